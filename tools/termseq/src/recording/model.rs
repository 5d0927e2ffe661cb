//! Serializable recording types.
//!
//! Older files store `commands` as plain strings; [`CommandInput`] accepts
//! both shapes and every [`RecordedCommand`] is built through it, so the
//! in-memory form is always `{command, directory}`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandInput")]
pub struct RecordedCommand {
    pub command: String,
    /// Directory the command was captured in, when known.
    pub directory: Option<String>,
}

impl RecordedCommand {
    pub fn new(command: impl Into<String>, directory: Option<String>) -> Self {
        Self {
            command: command.into(),
            directory,
        }
    }
}

/// Any accepted spelling of a recorded command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CommandInput {
    Bare(String),
    Entry {
        #[serde(default)]
        command: String,
        #[serde(default)]
        directory: Option<String>,
    },
    Other(Value),
}

impl From<CommandInput> for RecordedCommand {
    fn from(input: CommandInput) -> Self {
        match input {
            CommandInput::Bare(command) => Self::new(command, None),
            CommandInput::Entry { command, directory } => Self::new(command, directory),
            CommandInput::Other(value) => Self::new(value.to_string(), None),
        }
    }
}

impl From<&str> for CommandInput {
    fn from(value: &str) -> Self {
        Self::Bare(value.to_string())
    }
}

impl From<String> for CommandInput {
    fn from(value: String) -> Self {
        Self::Bare(value)
    }
}

impl From<RecordedCommand> for CommandInput {
    fn from(value: RecordedCommand) -> Self {
        Self::Entry {
            command: value.command,
            directory: value.directory,
        }
    }
}

pub fn normalize_commands<I, C>(commands: I) -> Vec<RecordedCommand>
where
    I: IntoIterator<Item = C>,
    C: Into<CommandInput>,
{
    commands
        .into_iter()
        .map(|c| RecordedCommand::from(c.into()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commands: Vec<RecordedCommand>,
    #[serde(default, alias = "startDirectory")]
    pub start_directory: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: NaiveDateTime,
    #[serde(default, alias = "lastPlayed")]
    pub last_played: Option<NaiveDateTime>,
    #[serde(default, alias = "playCount")]
    pub play_count: u64,
}

impl Recording {
    /// Directory the recording must be played from: where the first command
    /// ran, or the capture start directory for recordings without per-command
    /// directories.
    pub fn play_directory(&self) -> Option<&str> {
        self.commands
            .first()
            .and_then(|c| c.directory.as_deref())
            .or(self.start_directory.as_deref())
    }
}

/// Shape accepted by import. `name` and `commands` are required; everything
/// else in the file is ignored or reset.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportedRecording {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub commands: Vec<RecordedCommand>,
    #[serde(default, alias = "startDirectory")]
    pub start_directory: Option<String>,
}

pub fn recording_id_for(created_at: NaiveDateTime) -> String {
    format!("recording_{}", created_at.format("%Y%m%d_%H%M%S"))
}
