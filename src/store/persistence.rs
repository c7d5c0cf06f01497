//! Persistence layer for the Baseline Store

use crate::error::StorageError;
use crate::store::{BaselineStore, RunBundle};
use crate::types::RunId;
use std::path::Path;

const BUNDLE_PREFIX: &str = "bundle/";
const LATEST_PREFIX: &str = "latest/";

fn history_prefix(design_id: &str) -> Vec<u8> {
    let mut key = format!("{}{}", BUNDLE_PREFIX, design_id).into_bytes();
    key.push(0);
    key
}

fn history_key(design_id: &str, run_id: &RunId) -> Vec<u8> {
    let mut key = history_prefix(design_id);
    key.extend_from_slice(run_id.as_str().as_bytes());
    key
}

fn latest_key(design_id: &str) -> Vec<u8> {
    format!("{}{}", LATEST_PREFIX, design_id).into_bytes()
}

fn db_error(context: &str, e: sled::Error) -> StorageError {
    StorageError::Database(format!("{}: {}", context, e))
}

/// Sled-based implementation of BaselineStore.
///
/// Bundles are JSON values under `bundle/{design_id}\0{run_id}`; the latest run
/// id of each design lives under `latest/{design_id}`. Both keys are written in
/// one sled batch.
pub struct SledBaselineStore {
    db: sled::Db,
}

impl SledBaselineStore {
    /// Open (or create) a store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| db_error("Failed to open sled database", e))?;
        Ok(Self { db })
    }

    /// Temporary in-memory store, removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| db_error("Failed to open temporary sled database", e))?;
        Ok(Self { db })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| db_error("Failed to flush database", e))?;
        Ok(())
    }

    fn read_bundle(&self, key: &[u8]) -> Result<Option<RunBundle>, StorageError> {
        match self
            .db
            .get(key)
            .map_err(|e| db_error("Failed to read bundle", e))?
        {
            Some(value) => {
                let bundle: RunBundle = serde_json::from_slice(&value).map_err(|e| {
                    StorageError::Serialization(format!("Failed to deserialize bundle: {}", e))
                })?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }
}

impl BaselineStore for SledBaselineStore {
    fn save(&self, bundle: &RunBundle) -> Result<(), StorageError> {
        bundle.validate()?;
        let value = serde_json::to_vec(bundle).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize bundle: {}", e))
        })?;

        let mut batch = sled::Batch::default();
        batch.insert(history_key(&bundle.design_id, &bundle.run_id), value);
        batch.insert(
            latest_key(&bundle.design_id),
            bundle.run_id.as_str().as_bytes(),
        );
        self.db
            .apply_batch(batch)
            .map_err(|e| db_error("Failed to apply bundle batch", e))?;
        self.flush()
    }

    fn load_latest(&self, design_id: &str) -> Result<Option<RunBundle>, StorageError> {
        let run_id = match self
            .db
            .get(latest_key(design_id))
            .map_err(|e| db_error("Failed to read latest pointer", e))?
        {
            Some(value) => RunId(String::from_utf8_lossy(&value).into_owned()),
            None => return Ok(None),
        };
        match self.load(design_id, &run_id)? {
            Some(bundle) => Ok(Some(bundle)),
            // The pointer and the bundle are written in one batch
            None => Err(StorageError::BundleNotFound {
                design_id: design_id.to_string(),
            }),
        }
    }

    fn load(&self, design_id: &str, run_id: &RunId) -> Result<Option<RunBundle>, StorageError> {
        self.read_bundle(&history_key(design_id, run_id))
    }

    fn list_runs(&self, design_id: &str) -> Result<Vec<RunId>, StorageError> {
        let prefix = history_prefix(design_id);
        let mut runs = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(|e| db_error("Failed to scan bundles", e))?;
            runs.push(RunId(
                String::from_utf8_lossy(&key[prefix.len()..]).into_owned(),
            ));
        }
        Ok(runs)
    }
}
