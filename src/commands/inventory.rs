use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::commands::ingest::{OutputPaths, load_checkpoint};
use crate::model::{InventoryEntry, InventoryManifest};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub const UNKNOWN_STORE_ID: &str = "unknown";

/// A leaf store folder found under `<root>/<year>/<city>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFolder {
    pub path: PathBuf,
    pub identity: String,
    pub year: String,
    pub city: String,
    pub folder_name: String,
    pub store_id: String,
    pub store_name: String,
}

impl StoreFolder {
    pub fn geodata_file(&self) -> Option<PathBuf> {
        find_input_file(&self.path, "kmz")
    }

    pub fn report_file(&self) -> Option<PathBuf> {
        find_input_file(&self.path, "pdf")
    }
}

/// Parses folder names like `03) 42056 FELIX CASTRO` into a store id and a
/// display name.
pub struct StoreNameParser {
    pattern: Regex,
    digits: Regex,
}

impl StoreNameParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r"^\d+\)\s*(\d+)\s+(.+)$")
                .context("failed to compile store folder regex")?,
            digits: Regex::new(r"\d+").context("failed to compile digit regex")?,
        })
    }

    pub fn parse(&self, folder_name: &str) -> (String, String) {
        if let Some(captures) = self.pattern.captures(folder_name) {
            if let (Some(id), Some(name)) = (captures.get(1), captures.get(2)) {
                return (id.as_str().to_string(), name.as_str().trim().to_string());
            }
        }

        let numbers: Vec<&str> = self
            .digits
            .find_iter(folder_name)
            .map(|m| m.as_str())
            .collect();

        let store_id = match numbers.as_slice() {
            [_, second, ..] => second.to_string(),
            [only] => only.to_string(),
            [] => UNKNOWN_STORE_ID.to_string(),
        };

        (store_id, folder_name.to_string())
    }
}

/// Absolute, symlink-free form of a store root. Identities hang off the
/// root's parent, so `.` or a relative root must be resolved first.
pub fn resolve_root(root: &Path) -> Result<PathBuf> {
    fs::canonicalize(root)
        .with_context(|| format!("store root is not accessible: {}", root.display()))
}

/// Lists every store folder three levels below `root` in lexicographic order.
pub fn discover_stores(root: &Path) -> Result<Vec<StoreFolder>> {
    if !root.is_dir() {
        bail!("store root is not a readable directory: {}", root.display());
    }

    let parser = StoreNameParser::new()?;
    let base = root.parent().unwrap_or(root);
    let mut stores = Vec::new();

    for year_dir in sorted_subdirectories(root)? {
        for city_dir in sorted_subdirectories_or_skip(&year_dir) {
            for store_dir in sorted_subdirectories_or_skip(&city_dir) {
                let folder_name = file_name_string(&store_dir);
                let (store_id, store_name) = parser.parse(&folder_name);

                stores.push(StoreFolder {
                    identity: relative_identity(&store_dir, base),
                    year: file_name_string(&year_dir),
                    city: file_name_string(&city_dir),
                    folder_name,
                    store_id,
                    store_name,
                    path: store_dir,
                });
            }
        }
    }

    Ok(stores)
}

/// Joins the normal components of `path` below `base` with `/`.
pub fn relative_identity(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    join_components(relative)
}

pub fn join_components(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<String>>()
        .join("/")
}

/// First regular file in `dir` whose extension matches `extension`,
/// ignoring case.
pub fn find_input_file(dir: &Path, extension: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();

    matches.sort();
    matches.into_iter().next()
}

fn sorted_subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}

fn sorted_subdirectories_or_skip(dir: &Path) -> Vec<PathBuf> {
    match sorted_subdirectories(dir) {
        Ok(dirs) => dirs,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "skipping unreadable directory");
            Vec::new()
        }
    }
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn run(args: InventoryArgs) -> Result<()> {
    let root = resolve_root(&args.root)?;
    let stores = discover_stores(&root)?;
    let paths = OutputPaths::new(&args.output_dir, &args.output_stem);
    let checkpoint = load_checkpoint(&paths.structural, &root);

    let mut entries = Vec::with_capacity(stores.len());
    for store in &stores {
        let geodata = store.geodata_file();
        let report = store.report_file();
        let completed = checkpoint.is_completed(&store.identity);

        if geodata.is_none() || report.is_none() {
            warn!(
                store = %store.identity,
                geodata = geodata.is_some(),
                report = report.is_some(),
                "store folder is missing an input file"
            );
        }

        let (report_size_bytes, report_sha256) = match &report {
            Some(path) => (
                fs::metadata(path).map(|meta| meta.len()).ok(),
                Some(sha256_file(path)?),
            ),
            None => (None, None),
        };

        entries.push(InventoryEntry {
            identity: store.identity.clone(),
            year: store.year.clone(),
            city: store.city.clone(),
            store_id: store.store_id.clone(),
            store_name: store.store_name.clone(),
            geodata_file: geodata.map(|path| path.display().to_string()),
            report_file: report.map(|path| path.display().to_string()),
            report_size_bytes,
            report_sha256,
            completed,
        });
    }

    let completed_count = entries.iter().filter(|entry| entry.completed).count();
    let manifest = InventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        root: root.display().to_string(),
        store_count: entries.len(),
        completed_count,
        pending_count: entries.len() - completed_count,
        stores: entries,
    };

    info!(
        root = %manifest.root,
        stores = manifest.store_count,
        completed = manifest.completed_count,
        pending = manifest.pending_count,
        "inventory completed"
    );

    if let Some(manifest_path) = &args.manifest_path {
        write_json_pretty(manifest_path, &manifest)?;
        info!(path = %manifest_path.display(), "wrote inventory manifest");
    }

    Ok(())
}
