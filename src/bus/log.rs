//! Durable append-only log bus.
//!
//! Each topic is one CRC-framed file `<topic>.log` in the bus directory. A
//! record counts as delivered once its frame is written and synced, so the
//! log can stand in for a broker in single-host deployments and lets tests
//! read back exactly what was published.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::persistent::codec::{self, FileKind};
use crate::storage::persistent::FileLock;

use super::{BusAck, BusConnection, BusError, BusRecord, DeliveryFuture, EventBus};

const LOCK_FILE: &str = ".bus.lock";

/// A record as stored in a topic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedRecord {
    /// Offset assigned on append.
    pub offset: u64,
    /// Partitioning key.
    pub key: Vec<u8>,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    /// Record timestamp.
    pub timestamp: DateTime<Utc>,
    /// Record headers, in order.
    pub headers: Vec<(String, String)>,
}

struct TopicLog {
    file: File,
    next_offset: u64,
}

struct LogState {
    dir: PathBuf,
    sync_on_write: bool,
    topics: HashMap<String, TopicLog>,
}

impl LogState {
    fn topic(&mut self, topic: &str) -> Result<&mut TopicLog, BusError> {
        if !self.topics.contains_key(topic) {
            let path = topic_path(&self.dir, topic)?;
            let (file, recovered) = codec::open_append::<LoggedRecord>(&path, FileKind::BusLog, self.sync_on_write)?;
            let next_offset = recovered.records.last().map_or(0, |r| r.offset + 1);
            tracing::debug!(topic, next_offset, "opened topic log");
            self.topics.insert(topic.to_string(), TopicLog { file, next_offset });
        }
        self.topics
            .get_mut(topic)
            .ok_or_else(|| BusError::Disconnected(format!("topic log {topic} unavailable")))
    }
}

fn topic_path(dir: &Path, topic: &str) -> Result<PathBuf, BusError> {
    let valid = !topic.is_empty()
        && !topic.starts_with('.')
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(BusError::Rejected(format!("invalid topic name {topic:?}")));
    }
    Ok(dir.join(format!("{topic}.log")))
}

/// File-backed bus. Clones share the open topic logs.
#[derive(Clone)]
pub struct LogBus {
    state: Arc<Mutex<LogState>>,
    _lock: Arc<FileLock>,
}

impl std::fmt::Debug for LogBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBus").finish_non_exhaustive()
    }
}

impl LogBus {
    /// Opens (creating if needed) a bus directory.
    pub fn open(dir: impl AsRef<Path>, sync_on_write: bool) -> Result<Self, BusError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = FileLock::acquire(&dir, LOCK_FILE)?;
        Ok(Self {
            state: Arc::new(Mutex::new(LogState {
                dir,
                sync_on_write,
                topics: HashMap::new(),
            })),
            _lock: Arc::new(lock),
        })
    }

    /// Reads every intact record of `topic` in a bus directory.
    pub fn read_topic(dir: impl AsRef<Path>, topic: &str) -> Result<Vec<LoggedRecord>, BusError> {
        let path = topic_path(dir.as_ref(), topic)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader, FileKind::BusLog)?;

        let mut records = Vec::new();
        loop {
            match codec::read_frame::<LoggedRecord>(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "stopping at damaged topic log frame");
                    break;
                }
            }
        }
        Ok(records)
    }
}

impl EventBus for LogBus {
    fn connect(&self) -> Result<Box<dyn BusConnection>, BusError> {
        Ok(Box::new(LogConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct LogConnection {
    state: Arc<Mutex<LogState>>,
}

impl BusConnection for LogConnection {
    fn send(&mut self, record: BusRecord) -> Result<DeliveryFuture, BusError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Disconnected("poisoned lock: bus.log".to_string()))?;
        let sync = state.sync_on_write;
        let log = state.topic(&record.topic)?;

        let logged = LoggedRecord {
            offset: log.next_offset,
            key: record.key,
            value: record.value,
            timestamp: record.timestamp,
            headers: record.headers,
        };
        let frame = codec::encode(&logged)?;
        log.file.write_all(&frame)?;
        log.file.flush()?;
        if sync {
            log.file.sync_data()?;
        }
        log.next_offset += 1;

        Ok(DeliveryFuture::ready(Ok(BusAck {
            topic: record.topic,
            offset: logged.offset,
        })))
    }
}
