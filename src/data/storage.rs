//! Measurement persistence.
//!
//! The run controller never touches the filesystem itself; it calls a
//! [`DataSerializer`]. Two implementations ship with the crate:
//!
//! - [`FileSerializer`]: one folder per job under the configured data directory,
//!   histograms as `<file_stem>.txt` (one count per line) and the finished job as
//!   `job_record.json`.
//! - [`MemorySerializer`]: keeps everything in memory, for tests.

use crate::error::SerializationError;
use crate::experiment::state::JobRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// File name of the persisted job record inside a job folder.
pub const JOB_RECORD_FILE: &str = "job_record.json";

/// Persistence collaborator used by the run controller.
#[async_trait]
pub trait DataSerializer: Send + Sync {
    /// Select (and create) the folder the next writes of `job_id` go to.
    async fn set_base_folder(&self, job_id: &str) -> Result<(), SerializationError>;

    /// Store one histogram under `file_stem`.
    async fn save_histogram(&self, data: &[u64], file_stem: &str)
        -> Result<(), SerializationError>;

    /// Store the finished job.
    async fn save_job_record(&self, record: &JobRecord) -> Result<(), SerializationError>;
}

/// Writes job data below a root directory.
pub struct FileSerializer {
    root: PathBuf,
    base: Mutex<Option<PathBuf>>,
}

impl FileSerializer {
    /// Serializer writing one folder per job below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: Mutex::new(None),
        }
    }

    fn base(&self) -> Result<PathBuf, SerializationError> {
        self.base.lock().clone().ok_or(SerializationError::NoBaseFolder)
    }
}

#[async_trait]
impl DataSerializer for FileSerializer {
    async fn set_base_folder(&self, job_id: &str) -> Result<(), SerializationError> {
        let folder = self.root.join(job_id);
        tokio::fs::create_dir_all(&folder).await?;
        info!(folder = %folder.display(), "job data folder ready");
        *self.base.lock() = Some(folder);
        Ok(())
    }

    async fn save_histogram(
        &self,
        data: &[u64],
        file_stem: &str,
    ) -> Result<(), SerializationError> {
        let path = self.base()?.join(format!("{}.txt", file_stem));
        let mut text = String::with_capacity(data.len() * 4);
        for count in data {
            text.push_str(&count.to_string());
            text.push('\n');
        }
        tokio::fs::write(&path, text).await?;
        debug!(path = %path.display(), bins = data.len(), "histogram saved");
        Ok(())
    }

    async fn save_job_record(&self, record: &JobRecord) -> Result<(), SerializationError> {
        // The record always lands in its own job folder, even if the
        // folder could not be selected earlier.
        let folder = self.root.join(&record.job.id);
        tokio::fs::create_dir_all(&folder).await?;
        let path = folder.join(JOB_RECORD_FILE);
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "job record saved");
        Ok(())
    }
}

/// In-memory [`DataSerializer`] with failure injection.
#[derive(Default)]
pub struct MemorySerializer {
    base: Mutex<Option<String>>,
    folders: Mutex<Vec<String>>,
    histograms: Mutex<HashMap<(String, String), Vec<u64>>>,
    records: Mutex<Vec<JobRecord>>,
    fail_base_folder: Mutex<Option<String>>,
    fail_histogram: Mutex<Option<String>>,
    fail_record: Mutex<Option<String>>,
}

impl MemorySerializer {
    /// Empty serializer that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `set_base_folder` fail.
    pub fn fail_base_folder(&self, message: &str) {
        *self.fail_base_folder.lock() = Some(message.to_string());
    }

    /// Make `save_histogram` fail.
    pub fn fail_histograms(&self, message: &str) {
        *self.fail_histogram.lock() = Some(message.to_string());
    }

    /// Make `save_job_record` fail.
    pub fn fail_records(&self, message: &str) {
        *self.fail_record.lock() = Some(message.to_string());
    }

    /// Folders selected so far, in order.
    pub fn folders(&self) -> Vec<String> {
        self.folders.lock().clone()
    }

    /// Histogram stored under `file_stem` for `job_id`.
    pub fn histogram(&self, job_id: &str, file_stem: &str) -> Option<Vec<u64>> {
        self.histograms
            .lock()
            .get(&(job_id.to_string(), file_stem.to_string()))
            .cloned()
    }

    /// Job records saved so far, in order.
    pub fn records(&self) -> Vec<JobRecord> {
        self.records.lock().clone()
    }

    fn injected(slot: &Mutex<Option<String>>) -> Result<(), SerializationError> {
        match slot.lock().clone() {
            Some(message) => Err(SerializationError::Other(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataSerializer for MemorySerializer {
    async fn set_base_folder(&self, job_id: &str) -> Result<(), SerializationError> {
        Self::injected(&self.fail_base_folder)?;
        self.folders.lock().push(job_id.to_string());
        *self.base.lock() = Some(job_id.to_string());
        Ok(())
    }

    async fn save_histogram(
        &self,
        data: &[u64],
        file_stem: &str,
    ) -> Result<(), SerializationError> {
        Self::injected(&self.fail_histogram)?;
        let base = self
            .base
            .lock()
            .clone()
            .ok_or(SerializationError::NoBaseFolder)?;
        self.histograms
            .lock()
            .insert((base, file_stem.to_string()), data.to_vec());
        Ok(())
    }

    async fn save_job_record(&self, record: &JobRecord) -> Result<(), SerializationError> {
        Self::injected(&self.fail_record)?;
        self.records.lock().push(record.clone());
        Ok(())
    }
}
