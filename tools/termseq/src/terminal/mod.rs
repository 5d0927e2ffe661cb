//! The terminal collaborator contract shared by the queue and playback engine.
//!
//! A terminal runs one command string at a time and later reports back through
//! [`TerminalEvent`]s, which its owner forwards to whichever state machine is
//! driving it. Nothing here blocks on command completion.

pub mod shell;

use crate::errors::SequencerError;
use crate::paths::predict_directory_after;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

pub type EnvVars = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEvent {
    /// The most recently dispatched command finished.
    Completed { exit_code: i32 },
    /// The terminal is ready for new input.
    PromptReady,
}

impl TerminalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::PromptReady => "prompt_ready",
        }
    }
}

pub trait Terminal: Send + Sync {
    /// Dispatch `command` with `env_vars` layered over the session environment.
    /// Returns as soon as the command is handed off.
    fn execute(&self, command: &str, env_vars: &EnvVars) -> Result<(), SequencerError>;
    fn current_working_directory(&self) -> PathBuf;
    /// Whether this terminal emits [`TerminalEvent::PromptReady`].
    fn supports_prompt_ready(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub command: String,
    pub env_vars: EnvVars,
}

struct FakeTerminalState {
    cwd: PathBuf,
    dispatched: Vec<Dispatch>,
    fail_next: Option<SequencerError>,
}

/// Scriptable terminal for tests: records every dispatch and, when
/// `follows_cd` is set, moves its directory on `cd` the moment it is dispatched.
#[derive(Clone)]
pub struct FakeTerminal {
    state: Arc<Mutex<FakeTerminalState>>,
    prompt_ready: bool,
    follows_cd: bool,
}

impl FakeTerminal {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeTerminalState {
                cwd: cwd.into(),
                dispatched: Vec::new(),
                fail_next: None,
            })),
            prompt_ready: true,
            follows_cd: true,
        }
    }

    pub fn without_prompt_ready(mut self) -> Self {
        self.prompt_ready = false;
        self
    }

    pub fn ignoring_cd(mut self) -> Self {
        self.follows_cd = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeTerminalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
        self.lock().cwd = cwd.into();
    }

    pub fn set_fail_next(&self, error: SequencerError) {
        self.lock().fail_next = Some(error);
    }

    pub fn dispatched(&self) -> Vec<Dispatch> {
        self.lock().dispatched.clone()
    }

    pub fn dispatched_commands(&self) -> Vec<String> {
        self.lock()
            .dispatched
            .iter()
            .map(|d| d.command.clone())
            .collect()
    }
}

impl Terminal for FakeTerminal {
    fn execute(&self, command: &str, env_vars: &EnvVars) -> Result<(), SequencerError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.dispatched.push(Dispatch {
            command: command.to_string(),
            env_vars: env_vars.clone(),
        });
        if self.follows_cd {
            if let Some(next) = predict_directory_after(command, &state.cwd) {
                state.cwd = next;
            }
        }
        Ok(())
    }

    fn current_working_directory(&self) -> PathBuf {
        self.lock().cwd.clone()
    }

    fn supports_prompt_ready(&self) -> bool {
        self.prompt_ready
    }
}
