use std::path::{Path, PathBuf};

use icochat_core::split_sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::{JsonLoadError, JsonSaveError, load_json_from_path, save_json_with_retry},
    error::StoreError,
};

pub const HISTORY_FILE: &str = "historial_chat.json";
pub const USER_NAME_FILE: &str = "user_name.json";

pub const MAX_HISTORY_BYTES: u64 = 16 * 1024 * 1024;
pub const MAX_USER_NAME_BYTES: u64 = 64 * 1024;

/// Sender recorded for relayed lines that carry no `name: ` prefix.
pub const UNKNOWN_SENDER: &str = "unknown";

const LEGACY_SELF_SENDER: &str = "self";
const LEGACY_OTHER_SENDER: &str = "other";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
    pub direction: Direction,
}

impl ChatMessage {
    pub fn sent(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            direction: Direction::Sent,
        }
    }

    pub fn received(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            direction: Direction::Received,
        }
    }

    /// Parses a `sender: body` line as relayed by the server.
    pub fn from_relayed(line: &str) -> Self {
        match split_sender(line) {
            Some((sender, body)) => Self::received(sender, body),
            None => Self::received(UNKNOWN_SENDER, line),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message: String,
    sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    direction: Option<Direction>,
}

/// Entries written by older clients are plain `"name: text"` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Record(StoredMessage),
    Legacy(String),
}

impl StoredEntry {
    fn from_message(message: &ChatMessage) -> Self {
        StoredEntry::Record(StoredMessage {
            message: message.body.clone(),
            sender: message.sender.clone(),
            direction: Some(message.direction),
        })
    }

    fn into_message(self) -> ChatMessage {
        match self {
            StoredEntry::Legacy(line) => ChatMessage::from_relayed(&line),
            StoredEntry::Record(StoredMessage {
                message,
                sender,
                direction: Some(direction),
            }) => ChatMessage {
                sender,
                body: message,
                direction,
            },
            StoredEntry::Record(StoredMessage {
                message, sender, ..
            }) => legacy_record(sender, message),
        }
    }
}

fn legacy_record(sender: String, message: String) -> ChatMessage {
    let direction = if sender == LEGACY_SELF_SENDER {
        Direction::Sent
    } else {
        Direction::Received
    };
    if sender == LEGACY_SELF_SENDER || sender == LEGACY_OTHER_SENDER {
        if let Some((name, body)) = split_sender(&message) {
            return ChatMessage {
                sender: name.to_owned(),
                body: body.to_owned(),
                direction,
            };
        }
    }
    ChatMessage {
        sender,
        body: message,
        direction,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserNameRecord {
    user_name: String,
}

/// Durable chat history and the saved user name, both JSON documents in one directory.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    history_path: PathBuf,
    user_name_path: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            history_path: dir.join(HISTORY_FILE),
            user_name_path: dir.join(USER_NAME_FILE),
        }
    }

    /// Appends one message and rewrites the document before returning.
    ///
    /// A corrupt document is replaced rather than appended to; I/O failures
    /// leave the existing file untouched.
    pub fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(StoreError::CorruptData { path, reason }) => {
                warn!(path = %path.display(), %reason, "discarding corrupt chat history");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        entries.push(StoredEntry::from_message(message));
        save_json_with_retry(&self.history_path, &entries)
            .map_err(|err| save_error(&self.history_path, err))?;
        debug!(entries = entries.len(), "chat history saved");
        Ok(())
    }

    /// Returns every stored message in insertion order; empty when missing or corrupt.
    pub fn load_history(&self) -> Vec<ChatMessage> {
        match self.read_entries() {
            Ok(entries) => entries.into_iter().map(StoredEntry::into_message).collect(),
            Err(err) => {
                warn!(error = %err, "chat history unavailable");
                Vec::new()
            }
        }
    }

    pub fn load_user_name(&self) -> Option<String> {
        match load_json_from_path::<UserNameRecord>(&self.user_name_path, MAX_USER_NAME_BYTES) {
            Ok(record) => {
                let name = record.user_name.trim();
                (!name.is_empty()).then(|| name.to_owned())
            }
            Err(err) if err.is_missing() => None,
            Err(err) => {
                warn!(path = %self.user_name_path.display(), error = %err, "saved user name unreadable");
                None
            }
        }
    }

    pub fn save_user_name(&self, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyUserName);
        }
        let record = UserNameRecord {
            user_name: name.to_owned(),
        };
        save_json_with_retry(&self.user_name_path, &record)
            .map_err(|err| save_error(&self.user_name_path, err))
    }

    fn read_entries(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let path = &self.history_path;
        match load_json_from_path::<Vec<StoredEntry>>(path, MAX_HISTORY_BYTES) {
            Ok(entries) => Ok(entries),
            Err(err) if err.is_missing() => Ok(Vec::new()),
            Err(JsonLoadError::TooLarge { size, max }) => Err(StoreError::TooLarge {
                path: path.clone(),
                size,
                max,
            }),
            Err(JsonLoadError::Parse(err)) => Err(StoreError::CorruptData {
                path: path.clone(),
                reason: err.to_string(),
            }),
            Err(JsonLoadError::Metadata(source)) | Err(JsonLoadError::Read(source)) => {
                Err(StoreError::IoFailure {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

fn save_error(path: &Path, err: JsonSaveError) -> StoreError {
    match err {
        JsonSaveError::Serialize(err) => StoreError::CorruptData {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
        JsonSaveError::WriteTmp(source) | JsonSaveError::Rename(source) => StoreError::IoFailure {
            path: path.to_path_buf(),
            source,
        },
    }
}
