//! File-backed queue
//!
//! Layout under the base directory:
//! - `pending/{topic}/` pending messages, one `{id}.json` file each
//! - `processed/{topic}/` acknowledged messages
//! - `dead/{topic}/` files that could not be decoded
//!
//! Each state has its own root, so no topic name can alias another
//! topic's processed or dead directory.
//!
//! Message IDs start with a zero-padded millisecond timestamp, so a lexical
//! sort of file names gives approximate FIFO order. Moving a file into the
//! processed directory is the acknowledgment; a crash between reading and
//! moving redelivers the message on restart.

use async_trait::async_trait;
use chrono::Utc;
use ingest_common::{Error, QueueMessage, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::QueueBackend;

const PENDING: &str = "pending";
const PROCESSED: &str = "processed";
const DEAD: &str = "dead";

/// Local durable backend
pub struct LocalQueue {
    base_dir: PathBuf,
    /// Serializes read-then-move in `dequeue`
    dequeue_lock: Mutex<()>,
    sequence: AtomicU64,
}

impl LocalQueue {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dequeue_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
        }
    }

    fn pending_dir(&self, topic: &str) -> PathBuf {
        self.base_dir.join(PENDING).join(topic)
    }

    fn processed_dir(&self, topic: &str) -> PathBuf {
        self.base_dir.join(PROCESSED).join(topic)
    }

    fn dead_dir(&self, topic: &str) -> PathBuf {
        self.base_dir.join(DEAD).join(topic)
    }

    fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{:013}-{:06}-{}",
            Utc::now().timestamp_millis(),
            seq,
            &suffix[..8]
        )
    }

    /// Pending file names in lexical (approximate FIFO) order
    async fn pending_files(&self, topic: &str) -> Result<Vec<String>> {
        let dir = self.pending_dir(topic);
        if !fs::try_exists(&dir)
            .await
            .map_err(|e| storage_error("access", &dir, e))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| storage_error("read", &dir, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("read", &dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn read_message(path: &Path) -> Result<std::result::Result<QueueMessage, String>> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| storage_error("read", path, e))?;

        Ok(serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
    }

    async fn move_file(from: &Path, to_dir: &Path, name: &str) -> Result<()> {
        fs::create_dir_all(to_dir)
            .await
            .map_err(|e| storage_error("create", to_dir, e))?;

        let to = to_dir.join(name);
        fs::rename(from, &to)
            .await
            .map_err(|e| storage_error("move", from, e))
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic == "." || topic == ".." || topic.contains(['/', '\\']) {
        return Err(Error::Validation(format!("Invalid topic name: {:?}", topic)));
    }
    Ok(())
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> Error {
    Error::QueueStorage(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl QueueBackend for LocalQueue {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<QueueMessage> {
        validate_topic(topic)?;

        let dir = self.pending_dir(topic);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("create", &dir, e))?;

        let message = QueueMessage::new(self.next_id(), topic, payload);
        let json = serde_json::to_vec_pretty(&message)?;

        // Write then rename so readers never see a partial file
        let path = dir.join(format!("{}.json", message.id));
        let tmp = dir.join(format!("{}.json.tmp", message.id));
        fs::write(&tmp, json)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("rename", &tmp, e))?;

        debug!(topic, message_id = %message.id, "Wrote message file");
        Ok(message)
    }

    async fn dequeue(&self, topic: &str) -> Result<Option<QueueMessage>> {
        validate_topic(topic)?;
        let _guard = self.dequeue_lock.lock().await;

        let dir = self.pending_dir(topic);
        for name in self.pending_files(topic).await? {
            let path = dir.join(&name);

            match Self::read_message(&path).await? {
                Ok(message) => {
                    Self::move_file(&path, &self.processed_dir(topic), &name).await?;
                    debug!(topic, message_id = %message.id, "Moved message to processed");
                    return Ok(Some(message));
                }
                Err(e) => {
                    error!(topic, file = %name, error = %e, "Undecodable message file, moving aside");
                    Self::move_file(&path, &self.dead_dir(topic), &name).await?;
                }
            }
        }

        Ok(None)
    }

    async fn list(&self, topic: &str) -> Result<Vec<QueueMessage>> {
        validate_topic(topic)?;

        let dir = self.pending_dir(topic);
        let mut messages = Vec::new();
        for name in self.pending_files(topic).await? {
            let path = dir.join(&name);
            match Self::read_message(&path).await {
                Ok(Ok(message)) => messages.push(message),
                Ok(Err(e)) => warn!(topic, file = %name, error = %e, "Skipping undecodable message file"),
                // Consumed between listing and reading
                Err(_) if !path.exists() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(messages)
    }

    fn supports_listing(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
