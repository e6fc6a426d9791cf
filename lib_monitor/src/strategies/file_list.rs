//! # File List Source
//!
//! Events are files named in a plain-text list, one path per line. Every worker
//! takes its contiguous shard of the list; each record carries the file's
//! modification time as timestamp, its path as `event_id` and its size.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::info;

use super::{EventSource, EventStream};
use crate::core::topology::{shard_range, Rank};
use crate::errors::{ConfigurationError, ExtractionError};
use crate::model::DataRecord;

/// Reads events from the files listed in a list file.
#[derive(Debug, Clone)]
pub struct FileListSource {
    list_path: PathBuf,
    shard: Vec<PathBuf>,
}

impl FileListSource {
    /// Source backed by the list file at `list_path`. Nothing is read before `initialize`.
    pub fn new(list_path: impl Into<PathBuf>) -> Self {
        Self {
            list_path: list_path.into(),
            shard: Vec::new(),
        }
    }

    /// Paths assigned to this node.
    pub fn shard(&self) -> &[PathBuf] {
        &self.shard
    }

    fn read_list(&self) -> Result<Vec<PathBuf>, ConfigurationError> {
        let content = fs::read_to_string(&self.list_path).map_err(|e| {
            ConfigurationError::SourceUnavailable {
                source_name: self.list_path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

/// Builds the record for one event file.
pub fn record_for(path: &Path) -> Result<DataRecord, ExtractionError> {
    let event_id = path.display().to_string();
    let fail = |reason: String| ExtractionError::Source {
        event_id: event_id.clone(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| fail(e.to_string()))?;
    let modified = metadata.modified().map_err(|e| fail(e.to_string()))?;
    let timestamp = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| fail(e.to_string()))?
        .as_secs_f64();

    Ok(DataRecord::new(timestamp)
        .with_field("event_id", event_id.clone())
        .with_field("file_size", metadata.len()))
}

impl EventSource for FileListSource {
    fn initialize(&mut self, rank: Rank, pool_size: usize) -> Result<(), ConfigurationError> {
        let all = self.read_list()?;
        let range = shard_range(all.len(), rank, pool_size);
        info!(
            "Rank {} takes events {}..{} of {} from {}",
            rank,
            range.start,
            range.end,
            all.len(),
            self.list_path.display()
        );
        self.shard = all[range].to_vec();
        Ok(())
    }

    fn events(&mut self) -> EventStream {
        let shard = std::mem::take(&mut self.shard);
        Box::new(shard.into_iter().map(|path| record_for(&path)))
    }

    fn retrieve_event(&mut self, event_id: &str) -> Result<DataRecord, ExtractionError> {
        record_for(Path::new(event_id))
    }
}
