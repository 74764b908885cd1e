use std::fmt;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, TarnError};
use crate::index::IndexKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditAction {
    Insert,
    Update,
    Delete,
}

impl EditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EditAction::Insert => "insert",
            EditAction::Update => "update",
            EditAction::Delete => "delete",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(EditAction::Insert),
            "update" => Some(EditAction::Update),
            "delete" => Some(EditAction::Delete),
            _ => None,
        }
    }
}

/// One line of the recovery log. The textual grammar is fixed at first
/// write and round-trips through [`parse_record`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    Table {
        kind: IndexKind,
        name: String,
    },
    Start {
        client: Uuid,
    },
    Commit {
        client: Uuid,
    },
    Edit {
        client: Uuid,
        table: String,
        action: EditAction,
        key: i64,
        old_value: i64,
        new_value: i64,
    },
    Checkpoint {
        clients: Vec<Uuid>,
    },
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { kind, name } => {
                write!(f, "< create {} table {} >", kind.as_str(), name)
            }
            LogRecord::Start { client } => write!(f, "< {client} start >"),
            LogRecord::Commit { client } => write!(f, "< {client} commit >"),
            LogRecord::Edit {
                client,
                table,
                action,
                key,
                old_value,
                new_value,
            } => write!(
                f,
                "< {client}, {table}, {}, {key}, {old_value}, {new_value} >",
                action.as_str()
            ),
            LogRecord::Checkpoint { clients } => {
                let ids: Vec<String> = clients.iter().map(Uuid::to_string).collect();
                if ids.is_empty() {
                    write!(f, "< checkpoint >")
                } else {
                    write!(f, "< {} checkpoint >", ids.join(", "))
                }
            }
        }
    }
}

pub fn parse_record(line: &str) -> Result<LogRecord> {
    let malformed = || TarnError::Corrupt(format!("malformed log record: {line}"));
    let body = line
        .trim()
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .ok_or_else(malformed)?
        .trim();

    if let Some(rest) = body.strip_prefix("create ") {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        let [kind, keyword, name] = parts.as_slice() else {
            return Err(malformed());
        };
        if *keyword != "table" {
            return Err(malformed());
        }
        let kind = IndexKind::from_str(kind).ok_or_else(malformed)?;
        return Ok(LogRecord::Table {
            kind,
            name: (*name).to_string(),
        });
    }
    if body == "checkpoint" {
        return Ok(LogRecord::Checkpoint { clients: vec![] });
    }
    if let Some(ids) = body.strip_suffix(" checkpoint") {
        let clients = ids
            .split(',')
            .map(|id| Uuid::parse_str(id.trim()).map_err(|_| malformed()))
            .collect::<Result<Vec<Uuid>>>()?;
        return Ok(LogRecord::Checkpoint { clients });
    }
    if let Some(id) = body.strip_suffix(" start") {
        let client = Uuid::parse_str(id.trim()).map_err(|_| malformed())?;
        return Ok(LogRecord::Start { client });
    }
    if let Some(id) = body.strip_suffix(" commit") {
        let client = Uuid::parse_str(id.trim()).map_err(|_| malformed())?;
        return Ok(LogRecord::Commit { client });
    }

    let fields: Vec<&str> = body.split(',').map(str::trim).collect();
    let [client, table, action, key, old_value, new_value] = fields.as_slice() else {
        return Err(malformed());
    };
    Ok(LogRecord::Edit {
        client: Uuid::parse_str(client).map_err(|_| malformed())?,
        table: (*table).to_string(),
        action: EditAction::from_str(action).ok_or_else(malformed)?,
        key: key.parse().map_err(|_| malformed())?,
        old_value: old_value.parse().map_err(|_| malformed())?,
        new_value: new_value.parse().map_err(|_| malformed())?,
    })
}

/// Parses the log, accepting the prefix through the last well-formed
/// record; a corrupt tail is treated as truncation.
pub fn parse_log(text: &str) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(%err, records = records.len(), "truncating log at corrupt record");
                break;
            }
        }
    }
    records
}
