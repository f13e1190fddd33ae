use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::commands::inventory::join_components;
use crate::model::StoreRecord;

/// Results persisted by earlier runs and the identities they cover.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    records: Vec<StoreRecord>,
    completed: HashSet<String>,
}

impl Checkpoint {
    pub fn records(&self) -> &[StoreRecord] {
        &self.records
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_completed(&self, identity: &str) -> bool {
        self.completed.contains(identity)
    }

    pub fn record(&mut self, identity: String, record: StoreRecord) {
        self.completed.insert(identity);
        self.records.push(record);
    }
}

/// Loads the structural result file. Any problem yields an empty checkpoint.
pub fn load_checkpoint(structural_path: &Path, root: &Path) -> Checkpoint {
    if !structural_path.exists() {
        info!(path = %structural_path.display(), "no previous results; starting fresh");
        return Checkpoint::default();
    }

    let raw = match fs::read_to_string(structural_path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %structural_path.display(), error = %err, "unreadable previous results; starting fresh");
            return Checkpoint::default();
        }
    };

    let items = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            warn!(path = %structural_path.display(), "previous results are not a JSON array; starting fresh");
            return Checkpoint::default();
        }
        Err(err) => {
            warn!(path = %structural_path.display(), error = %err, "malformed previous results; starting fresh");
            return Checkpoint::default();
        }
    };

    let mut checkpoint = Checkpoint::default();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<StoreRecord>(item) {
            Ok(record) => {
                if let Some(identity) = identity_for_record(&record, root) {
                    checkpoint.completed.insert(identity);
                }
                checkpoint.records.push(record);
            }
            Err(err) => {
                warn!(index, error = %err, "skipping unreadable previous record");
            }
        }
    }

    info!(
        records = checkpoint.records.len(),
        completed = checkpoint.completed.len(),
        "loaded previous results"
    );
    checkpoint
}

/// Identity of the store a persisted record came from, taken from the folder
/// of its geodata file, then of its report, then the store folder itself.
pub fn identity_for_record(record: &StoreRecord, root: &Path) -> Option<String> {
    let file_dir = [record.geodata_file.as_deref(), record.report_file.as_deref()]
        .into_iter()
        .flatten()
        .find(|path| !path.trim().is_empty())
        .and_then(|path| {
            Path::new(&path.replace('\\', "/"))
                .parent()
                .map(Path::to_path_buf)
        });
    let store_dir = file_dir.or_else(|| {
        record
            .store_dir
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(|path| PathBuf::from(path.replace('\\', "/")))
    })?;

    let identity = normalize_store_dir(&store_dir, root);
    (!identity.is_empty()).then_some(identity)
}

/// Expresses a recorded store folder relative to the parent of `root`.
///
/// Paths under the current root's parent lose that prefix. Paths recorded
/// from another mount point are re-anchored at the root directory's name
/// when it sits exactly three levels above the store folder. Anything else is
/// kept as recorded.
pub fn normalize_store_dir(store_dir: &Path, root: &Path) -> String {
    let base = root.parent().unwrap_or(Path::new(""));

    let relative = if base.as_os_str().is_empty() {
        store_dir.is_relative().then_some(store_dir)
    } else {
        store_dir.strip_prefix(base).ok()
    };
    if let Some(relative) = relative {
        return join_components(relative);
    }

    if let Some(root_name) = root.file_name() {
        let components: Vec<Component<'_>> = store_dir
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .collect();
        if components.len() >= 4 {
            let anchor = components.len() - 4;
            if components[anchor].as_os_str() == root_name {
                return components[anchor..]
                    .iter()
                    .map(|component| component.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<String>>()
                    .join("/");
            }
        }
    }

    join_components(store_dir)
}
