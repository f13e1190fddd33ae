use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ingest::{OutputPaths, TABLE_NAME, load_checkpoint};
use crate::commands::inventory::{discover_stores, resolve_root};
use crate::model::IngestRunManifest;

pub fn run(args: StatusArgs) -> Result<()> {
    let paths = OutputPaths::new(&args.output_dir, &args.output_stem);
    let manifest_dir = args.output_dir.join("manifests");

    info!(
        output_dir = %args.output_dir.display(),
        stem = %args.output_stem,
        "status requested"
    );

    let root = match resolve_root(&args.root) {
        Ok(root) => root,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "using store root as given");
            args.root.clone()
        }
    };
    let checkpoint = load_checkpoint(&paths.structural, &root);
    if paths.structural.exists() {
        let records = checkpoint.records();
        let with_coordinates = records
            .iter()
            .filter(|record| record.coordinates().is_some())
            .count();
        let cost_usd: f64 = records
            .iter()
            .filter_map(|record| record.usage.as_ref())
            .map(|usage| usage.cost_usd)
            .sum();

        info!(
            path = %paths.structural.display(),
            records = records.len(),
            completed = checkpoint.completed_count(),
            with_coordinates,
            cost_usd = %format!("{cost_usd:.4}"),
            "structural results"
        );

        for record in records.iter().filter(|record| record.error.is_some()) {
            warn!(
                store_id = %record.store_id,
                store = %record.store_name,
                error = record.error.as_deref().unwrap_or_default(),
                "record carries an error"
            );
        }
    } else {
        warn!(path = %paths.structural.display(), "structural results missing");
    }

    if paths.sqlite.exists() {
        let conn = Connection::open(&paths.sqlite)
            .with_context(|| format!("failed to open {}", paths.sqlite.display()))?;
        let rows = query_count(&conn, &format!("SELECT COUNT(*) FROM {TABLE_NAME}")).unwrap_or(0);
        info!(path = %paths.sqlite.display(), rows, "tabular database");
    } else {
        warn!(path = %paths.sqlite.display(), "tabular database missing");
    }

    if paths.csv.exists() {
        info!(path = %paths.csv.display(), "portable csv present");
    } else {
        warn!(path = %paths.csv.display(), "portable csv missing");
    }

    if paths.errors.exists() {
        let raw = fs::read_to_string(&paths.errors)
            .with_context(|| format!("failed to read {}", paths.errors.display()))?;
        let entries = raw.lines().count().saturating_sub(1);
        info!(path = %paths.errors.display(), entries, "error report");
    }

    match latest_run_manifest(&manifest_dir) {
        Some(path) => {
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: IngestRunManifest = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!(
                run_id = %manifest.run_id,
                status = %manifest.status,
                updated_at = %manifest.updated_at,
                processed = manifest.counts.processed_stores,
                error_entries = manifest.counts.error_entries,
                cost_usd = %format!("{:.4}", manifest.usage.cost_usd),
                "last ingest run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no ingest run manifests"),
    }

    if root.is_dir() {
        let stores = discover_stores(&root)?;
        let pending = stores
            .iter()
            .filter(|store| !checkpoint.is_completed(&store.identity))
            .count();
        info!(
            root = %root.display(),
            stores = stores.len(),
            pending,
            "store tree"
        );
    } else {
        warn!(root = %root.display(), "store root missing");
    }

    Ok(())
}

/// Newest `ingest_run_*.json`; the compact timestamp in the name sorts
/// chronologically.
fn latest_run_manifest(manifest_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(manifest_dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("ingest_run_") && name.ends_with(".json"))
                .unwrap_or(false)
        })
        .max()
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_run_manifest_picks_newest_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in [
            "ingest_run_20250101T000000Z.json",
            "ingest_run_20250302T101500Z.json",
            "inventory.json",
            "ingest_run_20250302T101500Z.json.tmp",
        ] {
            fs::write(temp.path().join(name), "{}").expect("fixture");
        }

        let latest = latest_run_manifest(temp.path()).expect("manifest");
        assert_eq!(
            latest.file_name().and_then(|name| name.to_str()),
            Some("ingest_run_20250302T101500Z.json")
        );
        assert!(latest_run_manifest(&temp.path().join("absent")).is_none());
    }
}
