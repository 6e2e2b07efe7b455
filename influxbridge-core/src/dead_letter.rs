//! Append-only JSON lines file for records the sink never accepted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::Error;
use crate::error::Result;
use crate::record::{FieldValue, ParsedRecord};

#[derive(Serialize)]
struct DeadLetterEntry<'a> {
    timestamp: DateTime<Utc>,
    measurement: &'a str,
    fields: &'a BTreeMap<String, FieldValue>,
    tags: &'a BTreeMap<String, String>,
    error: &'a str,
}

#[derive(Debug)]
pub struct DeadLetterLog {
    path: PathBuf,
    // opened on first use
    file: Mutex<Option<File>>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line per record. Lines of one call are written together.
    pub async fn append(&self, records: &[ParsedRecord], error: &str) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let error = if error.is_empty() { "unknown" } else { error };

        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            let entry = DeadLetterEntry {
                timestamp: record.timestamp(),
                measurement: record.measurement(),
                fields: record.fields(),
                tags: record.tags(),
                error,
            };
            serde_json::to_writer(&mut buf, &entry)
                .map_err(|e| Error::DeadLetter(format!("Serializing entry: {e}")))?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        let file = match guard.as_mut() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .map_err(|e| {
                        Error::DeadLetter(format!("Opening {}: {e}", self.path.display()))
                    })?;
                guard.insert(file)
            }
        };

        if let Err(e) = write_all(file, &buf).await {
            // reopen on the next append
            *guard = None;
            warn!(path = %self.path.display(), ?e, "Writing to dead-letter log failed");
            return Err(e);
        }
        Ok(())
    }
}

async fn write_all(file: &mut File, buf: &[u8]) -> Result<()> {
    file.write_all(buf)
        .await
        .map_err(|e| Error::DeadLetter(format!("Writing entries: {e}")))?;
    file.flush()
        .await
        .map_err(|e| Error::DeadLetter(format!("Flushing entries: {e}")))
}
