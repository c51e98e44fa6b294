//! Append-only JSONL journal of finalized turns.
//!
//! Line 1 is a `session` header; every following line is one `turn` record
//! wrapping a [`TranscriptEntry`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use agent_session::{SinkError, TranscriptEntry, TranscriptSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const JOURNAL_DIR: [&str; 2] = [".agent", "sessions"];
pub const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON at {path}:{line}: {source}")]
    JsonLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode turn {turn_id}: {source}")]
    Encode {
        turn_id: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing session header line in {path}")]
    MissingHeader { path: PathBuf },

    #[error("line {line} in {path} must be a session header record")]
    InvalidHeaderRecord { path: PathBuf, line: usize },

    #[error("line {line} in {path} must be a turn record")]
    InvalidTurnRecord { path: PathBuf, line: usize },

    #[error("line {line} in {path} has unsupported journal version {found}; expected 1")]
    UnsupportedVersion {
        path: PathBuf,
        line: usize,
        found: u32,
    },

    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

impl JournalError {
    fn io(operation: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalHeader {
    pub version: u32,
    pub session_id: String,
    pub created_at: String,
    pub cwd: String,
}

const SESSION_RECORD: &str = "session";
const TURN_RECORD: &str = "turn";

#[derive(Serialize)]
struct TaggedLine<'a, T: Serialize> {
    #[serde(rename = "type")]
    record_type: &'static str,
    #[serde(flatten)]
    record: &'a T,
}

fn encode_line<T: Serialize>(record_type: &'static str, record: &T) -> serde_json::Result<String> {
    serde_json::to_string(&TaggedLine {
        record_type,
        record,
    })
}

#[must_use]
pub fn journal_root(cwd: &Path) -> PathBuf {
    cwd.join(JOURNAL_DIR[0]).join(JOURNAL_DIR[1])
}

#[must_use]
pub fn journal_file_name(created_at: &str, session_id: &str) -> String {
    let sanitized: String = created_at
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' => '-',
            _ => c,
        })
        .collect();
    format!("{sanitized}_{session_id}.jsonl")
}

/// Transcript sink that appends each finalized turn to a session file.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
    header: JournalHeader,
    file: Mutex<File>,
}

impl JsonlJournal {
    /// Creates a new session file under `<cwd>/.agent/sessions/`.
    pub fn create_new(cwd: &Path, session_id: &str) -> Result<Self, JournalError> {
        let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let root = journal_root(cwd);
        fs::create_dir_all(&root)
            .map_err(|source| JournalError::io("creating journal directory", &root, source))?;

        let path = root.join(journal_file_name(&created_at, session_id));
        let header = JournalHeader {
            version: JOURNAL_VERSION,
            session_id: session_id.to_string(),
            created_at,
            cwd: cwd.display().to_string(),
        };
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::io("creating journal file", &path, source))?;

        let line = encode_line(SESSION_RECORD, &header).map_err(
            |source| JournalError::JsonLine {
                path: path.clone(),
                line: 1,
                source,
            },
        )?;
        writeln!(file, "{line}")
            .map_err(|source| JournalError::io("writing journal header", &path, source))?;

        Ok(Self {
            path,
            header,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    pub fn append(&self, entry: &TranscriptEntry) -> Result<(), JournalError> {
        let line = encode_line(TURN_RECORD, entry).map_err(
            |source| JournalError::Encode {
                turn_id: entry.turn_id,
                source,
            },
        )?;
        let mut file = lock_unpoisoned(&self.file);
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|source| JournalError::io("appending turn", &self.path, source))
    }
}

impl TranscriptSink for JsonlJournal {
    fn persist(&self, entry: &TranscriptEntry) -> Result<(), SinkError> {
        self.append(entry).map_err(SinkError::write)
    }
}

/// Reads a journal file back into its header and turns.
pub fn read_journal(path: &Path) -> Result<(JournalHeader, Vec<TranscriptEntry>), JournalError> {
    let file = File::open(path).map_err(|source| JournalError::io("opening journal", path, source))?;
    let reader = BufReader::new(file);

    let mut header = None;
    let mut entries = Vec::new();
    for (line_index, line_result) in reader.lines().enumerate() {
        let line_number = line_index + 1;
        let line =
            line_result.map_err(|source| JournalError::io("reading journal", path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let json_error = |source| JournalError::JsonLine {
            path: path.to_path_buf(),
            line: line_number,
            source,
        };
        let value = serde_json::from_str::<Value>(&line).map_err(json_error)?;
        let record_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match (line_number, record_type.as_str()) {
            (1, SESSION_RECORD) => {
                let parsed_header =
                    serde_json::from_value::<JournalHeader>(value).map_err(json_error)?;
                if parsed_header.version != JOURNAL_VERSION {
                    return Err(JournalError::UnsupportedVersion {
                        path: path.to_path_buf(),
                        line: line_number,
                        found: parsed_header.version,
                    });
                }
                header = Some(parsed_header);
            }
            (1, _) => {
                return Err(JournalError::InvalidHeaderRecord {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            }
            (_, TURN_RECORD) => {
                entries.push(serde_json::from_value::<TranscriptEntry>(value).map_err(json_error)?);
            }
            (_, _) => {
                return Err(JournalError::InvalidTurnRecord {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            }
        }
    }

    let header = header.ok_or_else(|| JournalError::MissingHeader {
        path: path.to_path_buf(),
    })?;
    Ok((header, entries))
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
