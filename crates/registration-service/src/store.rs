//! File-backed registration store
//!
//! One pretty-printed JSON file per device: `{dir}/{device_id}.json`.
//! Every read-modify-write for a device runs under that device's lock.

use chrono::{DateTime, Utc};
use ingest_common::{
    DeviceRegistration, Error, RegistrationStatus, Result, TransitionDetails,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const MAX_DEVICE_ID_LEN: usize = 128;

/// Per-device locks, created on demand and dropped once idle
#[derive(Default)]
struct KeyLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// Persists one record per device and enforces the status state machine
pub struct RegistrationStore {
    dir: PathBuf,
    locks: KeyLocks,
}

impl RegistrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyLocks::default(),
        }
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", device_id))
    }

    /// Create or overwrite the record keyed by its device ID
    pub async fn save(&self, registration: &DeviceRegistration) -> Result<DeviceRegistration> {
        validate_device_id(&registration.device_id)?;

        let lock = self.locks.handle(&registration.device_id);
        let _guard = lock.lock().await;

        self.write(registration).await?;

        debug!(device_id = %registration.device_id, status = %registration.status(), "Saved registration");
        Ok(registration.clone())
    }

    /// Get a record by device ID
    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceRegistration>> {
        validate_device_id(device_id)?;
        self.read(&self.path_for(device_id)).await
    }

    /// Move a record to `to`, merging `details` into it.
    ///
    /// Fails with `InvalidTransition` (record unchanged) if the edge from the
    /// current status is not declared, and with `NotFound` if there is no record.
    pub async fn transition(
        &self,
        device_id: &str,
        to: RegistrationStatus,
        details: TransitionDetails,
    ) -> Result<DeviceRegistration> {
        validate_device_id(device_id)?;

        let lock = self.locks.handle(device_id);
        let _guard = lock.lock().await;

        let mut record = self
            .read(&self.path_for(device_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))?;

        let from = record.status();
        if let Err(e) = record.apply_transition(to, details, Utc::now()) {
            error!(device_id, %from, %to, "Rejected status transition");
            return Err(e);
        }

        self.write(&record).await?;

        info!(device_id, %from, %to, "Status transition");
        Ok(record)
    }

    /// Merge `details` into a record without changing its status
    pub async fn annotate(
        &self,
        device_id: &str,
        details: TransitionDetails,
    ) -> Result<DeviceRegistration> {
        validate_device_id(device_id)?;

        let lock = self.locks.handle(device_id);
        let _guard = lock.lock().await;

        let mut record = self
            .read(&self.path_for(device_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))?;

        record.merge_details(details, Utc::now());
        self.write(&record).await?;

        Ok(record)
    }

    /// All records, newest first
    pub async fn list(&self) -> Result<Vec<DeviceRegistration>> {
        if !fs::try_exists(&self.dir)
            .await
            .map_err(|e| storage_error("access", &self.dir, e))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_error("read", &self.dir, e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("read", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read(&path).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Records in `processing` whose processing started before `older_than`
    pub async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<DeviceRegistration>> {
        let stale = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status() == RegistrationStatus::Processing)
            .filter(|r| r.processing_started_at.unwrap_or(r.updated_at) < older_than)
            .collect();

        Ok(stale)
    }

    async fn read(&self, path: &Path) -> Result<Option<DeviceRegistration>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Storage(format!("Corrupt record {}: {}", path.display(), e))
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", path, e)),
        }
    }

    async fn write(&self, record: &DeviceRegistration) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create", &self.dir, e))?;

        let json = serde_json::to_vec_pretty(record)?;
        let path = self.path_for(&record.device_id);
        let tmp = self.dir.join(format!("{}.json.tmp", record.device_id));

        fs::write(&tmp, json)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("rename", &tmp, e))
    }
}

/// Device IDs double as file names
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let valid = !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id != "."
        && device_id != ".."
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if !valid {
        return Err(Error::Validation(format!("Invalid deviceId: {:?}", device_id)));
    }
    Ok(())
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> Error {
    Error::Storage(format!("Failed to {} {}: {}", action, path.display(), err))
}
