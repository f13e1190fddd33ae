use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use thiserror::Error;
use tracing::info;
use zip::ZipArchive;

use crate::model::CoordinatePair;

const COORDINATES_TAG: &[u8] = b"coordinates";

#[derive(Debug, Error)]
pub enum GeodataError {
    #[error("failed to open geodata file: {0}")]
    Io(#[from] std::io::Error),
    #[error("geodata file is not a valid zip container: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),
    #[error("no KML document inside the geodata container")]
    NoMarkup,
    #[error("malformed KML document: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("no parseable coordinates in KML document")]
    NoCoordinates,
}

/// Extracts the first coordinate pair from a KMZ container. Every failure is
/// a [`GeodataError`]; callers treat it as absent coordinates.
pub fn locate_coordinates(path: &Path) -> Result<CoordinatePair, GeodataError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let markup_index = (0..archive.len())
        .find(|&index| {
            archive
                .by_index_raw(index)
                .map(|entry| entry.name().to_ascii_lowercase().ends_with(".kml"))
                .unwrap_or(false)
        })
        .ok_or(GeodataError::NoMarkup)?;

    let mut markup = Vec::new();
    archive.by_index(markup_index)?.read_to_end(&mut markup)?;

    let pair = coordinates_from_kml(&markup)?;
    info!(
        path = %path.display(),
        latitude = pair.latitude,
        longitude = pair.longitude,
        "extracted coordinates"
    );
    Ok(pair)
}

/// Scans a KML document for `coordinates` elements anywhere in the tree.
/// Elements in the root element's namespace are preferred; unqualified
/// elements are the fallback when the namespace yields none.
pub fn coordinates_from_kml(markup: &[u8]) -> Result<CoordinatePair, GeodataError> {
    let mut reader = NsReader::from_reader(markup);
    let mut buf = Vec::new();

    let mut root_namespace: Option<Option<Vec<u8>>> = None;
    let mut qualified: Vec<String> = Vec::new();
    let mut unqualified: Vec<String> = Vec::new();
    // (namespace of the open coordinates element, text collected so far)
    let mut open: Option<(Option<Vec<u8>>, String)> = None;

    loop {
        let (namespace, event) = reader.read_resolved_event_into(&mut buf)?;
        let namespace = owned_namespace(namespace);

        match event {
            Event::Start(start) => {
                if root_namespace.is_none() {
                    root_namespace = Some(namespace.clone());
                }
                if start.local_name().as_ref() == COORDINATES_TAG {
                    open = Some((namespace, String::new()));
                }
            }
            Event::Empty(_) => {
                if root_namespace.is_none() {
                    root_namespace = Some(namespace);
                }
            }
            Event::Text(text) => {
                if let Some((_, collected)) = open.as_mut() {
                    collected.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some((_, collected)) = open.as_mut() {
                    collected.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(end) => {
                if end.local_name().as_ref() == COORDINATES_TAG {
                    if let Some((element_namespace, collected)) = open.take() {
                        let root = root_namespace.clone().flatten();
                        if root.is_some() && element_namespace == root {
                            qualified.push(collected);
                        } else if element_namespace.is_none() {
                            unqualified.push(collected);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let candidates = if qualified.is_empty() {
        unqualified
    } else {
        qualified
    };

    candidates
        .iter()
        .find_map(|text| first_point(text))
        .ok_or(GeodataError::NoCoordinates)
}

/// Reads the first `lon,lat[,alt]` tuple of a coordinates string. KML lists
/// longitude before latitude.
pub fn first_point(text: &str) -> Option<CoordinatePair> {
    let token = text.split_whitespace().next()?;
    let mut parts = token.split(',');
    let longitude = parts.next()?.trim().parse::<f64>().ok()?;
    let latitude = parts.next()?.trim().parse::<f64>().ok()?;

    Some(CoordinatePair {
        latitude,
        longitude,
    })
}

fn owned_namespace(namespace: ResolveResult<'_>) -> Option<Vec<u8>> {
    match namespace {
        ResolveResult::Bound(Namespace(uri)) => Some(uri.to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    const KML_NS: &str = "http://www.opengis.net/kml/2.2";

    fn write_kmz(dir: &Path, name: &str, entries: &[(&str, &str)]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).expect("kmz file");
        let mut zip = zip::ZipWriter::new(file);
        for (entry_name, body) in entries {
            zip.start_file(*entry_name, SimpleFileOptions::default())
                .expect("zip entry");
            zip.write_all(body.as_bytes()).expect("zip body");
        }
        zip.finish().expect("zip finish");
        path
    }

    fn placemark(namespace: Option<&str>, coordinates: &[&str]) -> String {
        let xmlns = namespace
            .map(|ns| format!(" xmlns=\"{ns}\""))
            .unwrap_or_default();
        let body = coordinates
            .iter()
            .map(|c| format!("<Placemark><Point><coordinates>{c}</coordinates></Point></Placemark>"))
            .collect::<String>();
        format!("<?xml version=\"1.0\"?><kml{xmlns}><Document><Folder>{body}</Folder></Document></kml>")
    }

    #[test]
    fn first_point_respects_longitude_first_order() {
        let pair = first_point("-99.1332,19.4326,0 -99.2,19.5,0").expect("pair");
        assert_eq!(pair.latitude, 19.4326);
        assert_eq!(pair.longitude, -99.1332);
    }

    #[test]
    fn first_point_rejects_incomplete_tuples() {
        assert!(first_point("-99.1332").is_none());
        assert!(first_point("abc,19.4").is_none());
        assert!(first_point("   ").is_none());
    }

    #[test]
    fn extracts_from_namespaced_nested_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kml = placemark(Some(KML_NS), &["\n  -103.35,20.67,0 -103.36,20.68,0\n"]);
        let path = write_kmz(temp.path(), "store.kmz", &[("doc.kml", &kml)]);

        let pair = locate_coordinates(&path).expect("coordinates");
        assert_eq!(pair.latitude, 20.67);
        assert_eq!(pair.longitude, -103.35);
    }

    #[test]
    fn extracts_from_document_without_namespace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kml = placemark(None, &["-99.1332,19.4326,0"]);
        let path = write_kmz(temp.path(), "store.kmz", &[("files/DOC.KML", &kml)]);

        let pair = locate_coordinates(&path).expect("coordinates");
        assert_eq!(pair.latitude, 19.4326);
        assert_eq!(pair.longitude, -99.1332);
    }

    #[test]
    fn falls_back_to_unqualified_elements() {
        let markup = format!(
            "<kml xmlns=\"{KML_NS}\"><Document xmlns=\"\"><coordinates>-100.3,25.6</coordinates></Document></kml>"
        );
        let pair = coordinates_from_kml(markup.as_bytes()).expect("coordinates");
        assert_eq!(pair.latitude, 25.6);
        assert_eq!(pair.longitude, -100.3);
    }

    #[test]
    fn skips_unparseable_elements_and_keeps_scanning() {
        let markup = placemark(Some(KML_NS), &["", "n/a,n/a", "-106.4,23.2,0"]);
        let pair = coordinates_from_kml(markup.as_bytes()).expect("coordinates");
        assert_eq!(pair.latitude, 23.2);
        assert_eq!(pair.longitude, -106.4);
    }

    #[test]
    fn out_of_region_values_are_returned_unchanged() {
        let markup = placemark(Some(KML_NS), &["151.2093,-33.8688,0"]);
        let pair = coordinates_from_kml(markup.as_bytes()).expect("coordinates");
        assert_eq!(pair.latitude, -33.8688);
        assert_eq!(pair.longitude, 151.2093);
    }

    #[test]
    fn uses_first_markup_entry_in_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = placemark(None, &["-1.0,2.0"]);
        let second = placemark(None, &["-3.0,4.0"]);
        let path = write_kmz(
            temp.path(),
            "store.kmz",
            &[("images/icon.png", "png"), ("a.kml", &first), ("b.kml", &second)],
        );

        let pair = locate_coordinates(&path).expect("coordinates");
        assert_eq!(pair.latitude, 2.0);
        assert_eq!(pair.longitude, -1.0);
    }

    #[test]
    fn zero_byte_container_is_invalid_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("empty.kmz");
        File::create(&path).expect("empty file");

        assert!(matches!(
            locate_coordinates(&path),
            Err(GeodataError::InvalidArchive(_))
        ));
    }

    #[test]
    fn archive_without_markup_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_kmz(temp.path(), "store.kmz", &[("readme.txt", "hello")]);
        assert!(matches!(
            locate_coordinates(&path),
            Err(GeodataError::NoMarkup)
        ));
    }

    #[test]
    fn document_without_coordinates_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kml = format!("<kml xmlns=\"{KML_NS}\"><Document><name>x</name></Document></kml>");
        let path = write_kmz(temp.path(), "store.kmz", &[("doc.kml", &kml)]);
        assert!(matches!(
            locate_coordinates(&path),
            Err(GeodataError::NoCoordinates)
        ));
    }

    #[test]
    fn mismatched_tags_are_an_xml_error() {
        let result = coordinates_from_kml(b"<kml><Document><coordinates>1,2</Document></kml>");
        assert!(matches!(result, Err(GeodataError::Xml(_))));
    }
}
