use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity carried by a [`Command::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Re-emit a forwarded line through the local subscriber.
    pub fn emit(self, source: &str, message: &str) {
        match self {
            LogLevel::Debug => tracing::debug!(source, "{}", message),
            LogLevel::Info => tracing::info!(source, "{}", message),
            LogLevel::Warn => tracing::warn!(source, "{}", message),
            LogLevel::Error => tracing::error!(source, "{}", message),
        }
    }
}

/// A control-bus command.
///
/// On the wire every command is one JSON object with a `cmd` discriminator
/// (`{"cmd":"ping","pid":12,...}`) terminated by `\n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Command {
    Register {
        pid: u32,
        port: u16,
    },
    Unregister {
        pid: u32,
    },
    Ping {
        pid: u32,
        memory: u64,
        born_at: DateTime<Utc>,
        ping_at: DateTime<Utc>,
    },
    Shutdown,
    Status,
    Restart,
    Stop,
    NewWorker {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    NewMaster {
        pid: u32,
    },
    PrepareMaster,
    Log {
        message: String,
        level: LogLevel,
    },
}

/// The closed set of command kinds, used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Register,
    Unregister,
    Ping,
    Shutdown,
    Status,
    Restart,
    Stop,
    NewWorker,
    NewMaster,
    PrepareMaster,
    Log,
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        CommandKind::Register,
        CommandKind::Unregister,
        CommandKind::Ping,
        CommandKind::Shutdown,
        CommandKind::Status,
        CommandKind::Restart,
        CommandKind::Stop,
        CommandKind::NewWorker,
        CommandKind::NewMaster,
        CommandKind::PrepareMaster,
        CommandKind::Log,
    ];

    /// Wire name of the kind, as found in the `cmd` field.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Register => "register",
            CommandKind::Unregister => "unregister",
            CommandKind::Ping => "ping",
            CommandKind::Shutdown => "shutdown",
            CommandKind::Status => "status",
            CommandKind::Restart => "restart",
            CommandKind::Stop => "stop",
            CommandKind::NewWorker => "newWorker",
            CommandKind::NewMaster => "newMaster",
            CommandKind::PrepareMaster => "prepareMaster",
            CommandKind::Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single line could not be turned into a [`Command`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("missing `cmd` field")]
    MissingCommand,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("malformed `{cmd}` command: {source}")]
    Malformed {
        cmd: CommandKind,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Register { .. } => CommandKind::Register,
            Command::Unregister { .. } => CommandKind::Unregister,
            Command::Ping { .. } => CommandKind::Ping,
            Command::Shutdown => CommandKind::Shutdown,
            Command::Status => CommandKind::Status,
            Command::Restart => CommandKind::Restart,
            Command::Stop => CommandKind::Stop,
            Command::NewWorker { .. } => CommandKind::NewWorker,
            Command::NewMaster { .. } => CommandKind::NewMaster,
            Command::PrepareMaster => CommandKind::PrepareMaster,
            Command::Log { .. } => CommandKind::Log,
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Command::Log {
            message: message.into(),
            level,
        }
    }

    /// Serialize to a single line, without the trailing `\n`.
    ///
    /// serde_json escapes control characters inside strings, so the output never
    /// contains a raw newline.
    pub fn encode(&self) -> String {
        // Serializing a derived enum of plain fields to a String cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode one non-empty line.
    pub fn decode_line(line: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).map_err(DecodeError::InvalidJson)?;
        let name = value
            .get("cmd")
            .and_then(|cmd| cmd.as_str())
            .ok_or(DecodeError::MissingCommand)?;
        let kind =
            CommandKind::from_name(name).ok_or_else(|| DecodeError::UnknownCommand(name.to_string()))?;
        serde_json::from_value(value).map_err(|source| DecodeError::Malformed { cmd: kind, source })
    }
}

/// Decode one received fragment.
///
/// Blank fragments are skipped. Fragments that fail to decode are logged and dropped;
/// the caller carries on with the next one.
pub fn decode_fragment(fragment: &str) -> Option<Command> {
    if fragment.trim().is_empty() {
        return None;
    }
    match Command::decode_line(fragment) {
        Ok(command) => Some(command),
        Err(e) => {
            tracing::warn!(error = %e, fragment, "Dropping undecodable control line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(pid: u32, memory: u64) -> Command {
        let now = Utc::now();
        Command::Ping {
            pid,
            memory,
            born_at: now,
            ping_at: now,
        }
    }

    #[test]
    fn encode_uses_camel_case_discriminator() {
        let line = Command::NewMaster { pid: 7 }.encode();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["cmd"], "newMaster");
        assert_eq!(value["pid"], 7);

        assert_eq!(Command::PrepareMaster.encode(), r#"{"cmd":"prepareMaster"}"#);
        assert_eq!(Command::Shutdown.encode(), r#"{"cmd":"shutdown"}"#);
    }

    #[test]
    fn ping_fields_use_wire_names() {
        let line = ping(12, 2048).encode();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["cmd"], "ping");
        assert_eq!(value["memory"], 2048);
        assert!(value.get("born_at").is_some());
        assert!(value.get("ping_at").is_some());
    }

    #[test]
    fn encoded_line_never_contains_newline() {
        let cmd = Command::log(LogLevel::Info, "first\nsecond\n");
        let line = cmd.encode();
        assert!(!line.contains('\n'));
        assert_eq!(Command::decode_line(&line).unwrap(), cmd);
    }

    #[test]
    fn decode_reports_missing_and_unknown_commands() {
        assert!(matches!(
            Command::decode_line(r#"{"pid": 1}"#),
            Err(DecodeError::MissingCommand)
        ));
        assert!(matches!(
            Command::decode_line(r#"{"cmd": 5}"#),
            Err(DecodeError::MissingCommand)
        ));
        match Command::decode_line(r#"{"cmd": "explode"}"#) {
            Err(DecodeError::UnknownCommand(name)) => assert_eq!(name, "explode"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            Command::decode_line("not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn decode_reports_malformed_payload() {
        match Command::decode_line(r#"{"cmd": "register", "pid": "abc"}"#) {
            Err(DecodeError::Malformed { cmd, .. }) => assert_eq!(cmd, CommandKind::Register),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn decode_ignores_extra_fields() {
        let cmd = Command::decode_line(r#"{"cmd": "status", "options": []}"#).unwrap();
        assert_eq!(cmd, Command::Status);
        let cmd = Command::decode_line(r#"{"cmd": "newWorker"}"#).unwrap();
        assert_eq!(cmd, Command::NewWorker { port: None });
    }

    #[test]
    fn bad_fragment_does_not_affect_following_ones() {
        let raw = format!(
            "{{broken json\n\n{}\n{{\"cmd\":\"nope\"}}\n{}\n",
            ping(3, 10).encode(),
            Command::Unregister { pid: 3 }.encode()
        );
        let commands: Vec<Command> = raw.split('\n').filter_map(decode_fragment).collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind(), CommandKind::Ping);
        assert_eq!(commands[1], Command::Unregister { pid: 3 });
    }

    #[test]
    fn kind_names_resolve_back() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::from_name("Ping"), None);
    }
}
