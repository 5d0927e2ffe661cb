//! Replays a stored recording into a terminal one command at a time.
//!
//! The engine is a plain state machine: the owner forwards terminal events to
//! [`PlaybackEngine::on_event`] and fires the fallback timer through
//! [`PlaybackEngine::on_timer`] or [`PlaybackEngine::tick`]. Commands that were
//! captured in a different directory than the one playback is tracking get a
//! `cd` dispatched ahead of them.

use crate::errors::SequencerError;
use crate::logging::append_run_log;
use crate::paths::{
    cd_command_for, is_cd_command, normalize_directory, predict_directory_after, same_directory,
};
use crate::recording::model::{RecordedCommand, Recording};
use crate::recording::store::RecordingStore;
use crate::runtime::Clock;
use crate::terminal::{EnvVars, Terminal, TerminalEvent};
use crate::timer::{TimerId, Watchdog};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(1000);

/// Flag shared by every engine that must not play concurrently.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSlot {
    held: Arc<AtomicBool>,
}

impl PlaybackSlot {
    /// Private slot, only shared with clones of itself.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<Arc<AtomicBool>> = OnceLock::new();
        Self {
            held: GLOBAL
                .get_or_init(|| Arc::new(AtomicBool::new(false)))
                .clone(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// A `cd` to the recording's directory is in flight.
    ValidatingDirectory,
    Playing,
    Paused,
    AwaitingDirectoryChange,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ValidatingDirectory => "validating_directory",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::AwaitingDirectoryChange => "awaiting_directory_change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryMismatch {
    pub recording_id: String,
    pub required: String,
    pub current: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayStart {
    Started,
    DirectoryMismatch(DirectoryMismatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A recorded command exited non-zero.
    Command,
    /// A `cd` issued by playback exited non-zero.
    DirectoryChange,
    /// The terminal refused the command.
    Dispatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackFailure {
    pub recording_id: String,
    /// Zero-based position of the failing command in the recording.
    pub failed_index: usize,
    /// Playback cursor when the failure was observed.
    pub command_index: usize,
    /// Text that was dispatched, which is the `cd` for directory failures.
    pub command: String,
    pub directory: Option<String>,
    pub exit_code: Option<i32>,
    pub kind: FailureKind,
}

impl fmt::Display for PlaybackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exit = self
            .exit_code
            .map(|code| format!("exit code {code}"))
            .unwrap_or_else(|| "not dispatched".to_string());
        match self.kind {
            FailureKind::DirectoryChange => write!(
                f,
                "directory change to {} failed before command {} ({exit})",
                self.directory.as_deref().unwrap_or("?"),
                self.failed_index + 1
            ),
            FailureKind::Command | FailureKind::Dispatch => write!(
                f,
                "command {} `{}` failed ({exit})",
                self.failed_index + 1,
                self.command
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed { recording_id: String },
    Stopped { recording_id: String },
    Failed(PlaybackFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { recording_id: String, total: usize },
    Dispatched { index: usize, command: String, injected: bool },
    DirectoryMismatch(DirectoryMismatch),
    Paused,
    Resumed,
    Finished(PlaybackOutcome),
}

#[derive(Debug, Clone)]
struct InFlight {
    index: usize,
    command: String,
    directory: Option<String>,
    injected: bool,
    predicted: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct JumpInFlight {
    mismatch: DirectoryMismatch,
    command: String,
    completed: bool,
    prompt_ready: bool,
}

#[derive(Debug)]
struct PlaybackSession {
    recording: Recording,
    command_index: usize,
    paused: bool,
    pending_injected_command: Option<RecordedCommand>,
    waiting_for_directory_change: bool,
    tracked_directory: PathBuf,
    in_flight: Option<InFlight>,
    completion_observed: bool,
    prompt_observed: bool,
    ready_to_advance: bool,
}

impl PlaybackSession {
    fn new(recording: Recording, tracked_directory: PathBuf) -> Self {
        Self {
            recording,
            command_index: 0,
            paused: false,
            pending_injected_command: None,
            waiting_for_directory_change: false,
            tracked_directory,
            in_flight: None,
            completion_observed: false,
            prompt_observed: false,
            ready_to_advance: false,
        }
    }
}

pub struct PlaybackEngine {
    terminal: Arc<dyn Terminal>,
    store: Arc<RecordingStore>,
    clock: Arc<dyn Clock>,
    slot: PlaybackSlot,
    fallback_delay: Duration,
    state: PlaybackState,
    session: Option<PlaybackSession>,
    jump: Option<JumpInFlight>,
    timer: Watchdog,
    last_outcome: Option<PlaybackOutcome>,
    observers: Vec<mpsc::UnboundedSender<PlaybackEvent>>,
}

impl PlaybackEngine {
    pub fn new(
        terminal: Arc<dyn Terminal>,
        store: Arc<RecordingStore>,
        clock: Arc<dyn Clock>,
        slot: PlaybackSlot,
        fallback_delay: Duration,
    ) -> Self {
        Self {
            terminal,
            store,
            clock,
            slot,
            fallback_delay,
            state: PlaybackState::Idle,
            session: None,
            jump: None,
            timer: Watchdog::default(),
            last_outcome: None,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != PlaybackState::Idle
    }

    pub fn recording_id(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|s| s.recording.id.as_str())
            .or(self.jump.as_ref().map(|j| j.mismatch.recording_id.as_str()))
    }

    pub fn command_index(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.command_index)
    }

    pub fn last_outcome(&self) -> Option<&PlaybackOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn next_deadline(&self) -> Option<TimerId> {
        self.timer.armed()
    }

    /// Start playing `recording_id` if the terminal already sits in the
    /// recording's directory. A mismatch is reported without changing state;
    /// pass it to [`Self::jump_to_directory`] to move there first.
    pub fn play(&mut self, recording_id: &str) -> Result<PlayStart, SequencerError> {
        if self.state != PlaybackState::Idle || self.slot.is_held() {
            append_run_log(
                "warn",
                "playback.rejected_active",
                json!({ "recording_id": recording_id }),
            );
            return Err(SequencerError::PlaybackActive(recording_id.to_string()));
        }
        let recording = self
            .store
            .get(recording_id)
            .ok_or_else(|| SequencerError::RecordingNotFound(recording_id.to_string()))?;

        let current = self.terminal.current_working_directory();
        if let Some(required) = recording.play_directory() {
            let required_path = normalize_directory(required, &current);
            if !same_directory(&required_path, &current) {
                let mismatch = DirectoryMismatch {
                    recording_id: recording.id.clone(),
                    required: required.to_string(),
                    current,
                };
                append_run_log(
                    "info",
                    "playback.directory_mismatch",
                    json!({
                        "recording_id": mismatch.recording_id,
                        "required": mismatch.required,
                        "current": mismatch.current.display().to_string(),
                    }),
                );
                return Ok(PlayStart::DirectoryMismatch(mismatch));
            }
        }

        if !self.slot.try_acquire() {
            return Err(SequencerError::PlaybackActive(recording_id.to_string()));
        }
        self.begin(recording, &current);
        Ok(PlayStart::Started)
    }

    /// Dispatch `cd` to the mismatch's required directory, then retry
    /// [`Self::play`] once it completes.
    pub fn jump_to_directory(&mut self, mismatch: &DirectoryMismatch) -> Result<(), SequencerError> {
        if self.state != PlaybackState::Idle || self.slot.is_held() {
            return Err(SequencerError::PlaybackActive(mismatch.recording_id.clone()));
        }
        if self.store.get(&mismatch.recording_id).is_none() {
            return Err(SequencerError::RecordingNotFound(
                mismatch.recording_id.clone(),
            ));
        }
        if !self.slot.try_acquire() {
            return Err(SequencerError::PlaybackActive(mismatch.recording_id.clone()));
        }

        let command = cd_command_for(&mismatch.required);
        if let Err(err) = self.terminal.execute(&command, &EnvVars::new()) {
            self.slot.release();
            append_run_log(
                "error",
                "playback.jump_dispatch_failed",
                json!({ "command": command, "error": err.to_string() }),
            );
            return Err(err);
        }
        append_run_log(
            "info",
            "playback.jump_dispatched",
            json!({ "recording_id": mismatch.recording_id, "command": command }),
        );
        self.state = PlaybackState::ValidatingDirectory;
        self.last_outcome = None;
        self.jump = Some(JumpInFlight {
            mismatch: mismatch.clone(),
            command: command.clone(),
            completed: false,
            prompt_ready: false,
        });
        self.emit(PlaybackEvent::Dispatched {
            index: 0,
            command,
            injected: true,
        });
        Ok(())
    }

    pub fn cancel_jump(&mut self) -> bool {
        self.stop()
    }

    pub fn pause(&mut self) -> bool {
        if !matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::AwaitingDirectoryChange
        ) {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.paused = true;
        self.timer.disarm();
        self.state = PlaybackState::Paused;
        append_run_log(
            "info",
            "playback.paused",
            json!({ "command_index": session.command_index }),
        );
        self.emit(PlaybackEvent::Paused);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != PlaybackState::Paused {
            return false;
        }
        let prompt_mode = self.terminal.supports_prompt_ready();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.paused = false;
        self.state = if session.waiting_for_directory_change {
            PlaybackState::AwaitingDirectoryChange
        } else {
            PlaybackState::Playing
        };
        let pending = if session.waiting_for_directory_change || session.in_flight.is_some() {
            None
        } else {
            session
                .pending_injected_command
                .take()
                .map(|command| (session.command_index.saturating_sub(1), command))
        };
        let ready = session.ready_to_advance;
        let rearm = !prompt_mode && session.in_flight.as_ref().is_some_and(|f| !f.injected);
        append_run_log(
            "info",
            "playback.resumed",
            json!({ "command_index": session.command_index }),
        );
        self.emit(PlaybackEvent::Resumed);

        if let Some((index, command)) = pending {
            self.dispatch_recorded(index, command);
        } else if ready {
            self.execute_next();
        } else if rearm {
            self.timer.arm(self.clock.now(), self.fallback_delay);
        }
        true
    }

    /// End playback or a pending jump. Returns `false` when nothing was active.
    pub fn stop(&mut self) -> bool {
        if self.state == PlaybackState::Idle {
            return false;
        }
        let recording_id = self.recording_id().unwrap_or_default().to_string();
        self.finish(PlaybackOutcome::Stopped { recording_id });
        true
    }

    /// Feed a terminal event. Returns `false` when no playback is active and
    /// the event belongs to someone else.
    pub fn on_event(&mut self, event: TerminalEvent) -> bool {
        match self.state {
            PlaybackState::Idle => false,
            PlaybackState::ValidatingDirectory => {
                self.on_jump_event(event);
                true
            }
            PlaybackState::Playing
            | PlaybackState::Paused
            | PlaybackState::AwaitingDirectoryChange => {
                self.on_session_event(event);
                true
            }
        }
    }

    pub fn on_timer(&mut self, id: TimerId) -> bool {
        if !self.timer.take_if_current(id) {
            return false;
        }
        append_run_log(
            "debug",
            "playback.fallback_elapsed",
            json!({ "delay_ms": self.fallback_delay.as_millis() as u64 }),
        );
        self.advance();
        true
    }

    pub fn tick(&mut self) -> bool {
        match self.timer.due(self.clock.now()) {
            Some(id) => self.on_timer(id),
            None => false,
        }
    }

    fn begin(&mut self, recording: Recording, current: &Path) {
        if let Err(err) = self.store.track_play(&recording.id) {
            append_run_log(
                "warn",
                "playback.track_play_failed",
                json!({ "recording_id": recording.id, "error": err.to_string() }),
            );
        }
        let recording_id = recording.id.clone();
        let total = recording.commands.len();
        let tracked = normalize_directory(&current.to_string_lossy(), Path::new("/"));
        self.session = Some(PlaybackSession::new(recording, tracked));
        self.state = PlaybackState::Playing;
        self.last_outcome = None;
        append_run_log(
            "info",
            "playback.started",
            json!({ "recording_id": recording_id, "commands": total }),
        );
        self.emit(PlaybackEvent::Started {
            recording_id,
            total,
        });
        self.execute_next();
    }

    fn execute_next(&mut self) {
        let terminal_cwd = self.terminal.current_working_directory();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.paused {
            return;
        }
        session.ready_to_advance = false;

        let index = session.command_index;
        let Some(entry) = session.recording.commands.get(index).cloned() else {
            let recording_id = session.recording.id.clone();
            self.finish(PlaybackOutcome::Completed { recording_id });
            return;
        };

        if !same_directory(&terminal_cwd, &session.tracked_directory) {
            append_run_log(
                "warn",
                "playback.directory_drift",
                json!({
                    "tracked": session.tracked_directory.display().to_string(),
                    "terminal": terminal_cwd.display().to_string(),
                    "command_index": index,
                }),
            );
        }
        session.command_index += 1;

        if let Some(directory) = entry.directory.as_deref() {
            if !is_cd_command(&entry.command) {
                let required = normalize_directory(directory, &session.tracked_directory);
                if !same_directory(&required, &session.tracked_directory) {
                    session.pending_injected_command = Some(entry.clone());
                    session.waiting_for_directory_change = true;
                    self.state = PlaybackState::AwaitingDirectoryChange;
                    self.dispatch(InFlight {
                        index,
                        command: cd_command_for(directory),
                        directory: Some(directory.to_string()),
                        injected: true,
                        predicted: Some(required),
                    });
                    return;
                }
            }
        }
        self.dispatch_recorded(index, entry);
    }

    fn dispatch_recorded(&mut self, index: usize, entry: RecordedCommand) {
        let predicted = self
            .session
            .as_ref()
            .and_then(|s| predict_directory_after(&entry.command, &s.tracked_directory));
        if self.state == PlaybackState::AwaitingDirectoryChange {
            self.state = PlaybackState::Playing;
        }
        self.dispatch(InFlight {
            index,
            command: entry.command,
            directory: entry.directory,
            injected: false,
            predicted,
        });
    }

    fn dispatch(&mut self, in_flight: InFlight) {
        if let Err(err) = self.terminal.execute(&in_flight.command, &EnvVars::new()) {
            append_run_log(
                "error",
                "playback.dispatch_failed",
                json!({ "command": in_flight.command, "error": err.to_string() }),
            );
            self.fail(&in_flight, FailureKind::Dispatch, None);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.completion_observed = false;
        session.prompt_observed = false;
        session.in_flight = Some(in_flight.clone());
        append_run_log(
            "info",
            "playback.dispatched",
            json!({
                "recording_id": session.recording.id,
                "index": in_flight.index,
                "command": in_flight.command,
                "injected": in_flight.injected,
            }),
        );
        if !in_flight.injected && !self.terminal.supports_prompt_ready() {
            self.timer.arm(self.clock.now(), self.fallback_delay);
        }
        self.emit(PlaybackEvent::Dispatched {
            index: in_flight.index,
            command: in_flight.command,
            injected: in_flight.injected,
        });
    }

    fn on_session_event(&mut self, event: TerminalEvent) {
        let prompt_mode = self.terminal.supports_prompt_ready();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(in_flight) = session.in_flight.clone() else {
            return;
        };

        match event {
            TerminalEvent::Completed { exit_code } if exit_code != 0 => {
                let kind = if in_flight.injected {
                    FailureKind::DirectoryChange
                } else {
                    FailureKind::Command
                };
                self.fail(&in_flight, kind, Some(exit_code));
            }
            TerminalEvent::Completed { .. } if in_flight.injected => {
                if let Some(directory) = in_flight.predicted {
                    session.tracked_directory = directory;
                }
                session.completion_observed = true;
                if !prompt_mode || session.prompt_observed {
                    self.directory_changed(in_flight.index);
                }
            }
            TerminalEvent::Completed { .. } => {
                if let Some(directory) = in_flight.predicted {
                    session.tracked_directory = directory;
                }
                session.completion_observed = true;
                if prompt_mode && session.prompt_observed {
                    self.advance();
                }
            }
            TerminalEvent::PromptReady => {
                session.prompt_observed = true;
                if !session.completion_observed {
                    return;
                }
                if in_flight.injected {
                    self.directory_changed(in_flight.index);
                } else if prompt_mode {
                    self.advance();
                }
            }
        }
    }

    /// The injected `cd` has settled; release the command held behind it.
    fn directory_changed(&mut self, index: usize) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.in_flight = None;
        session.waiting_for_directory_change = false;
        if session.paused {
            return;
        }
        if let Some(pending) = session.pending_injected_command.take() {
            self.dispatch_recorded(index, pending);
        }
    }

    fn on_jump_event(&mut self, event: TerminalEvent) {
        let prompt_mode = self.terminal.supports_prompt_ready();
        let Some(jump) = self.jump.as_mut() else {
            return;
        };
        match event {
            TerminalEvent::Completed { exit_code } if exit_code != 0 => {
                let in_flight = InFlight {
                    index: 0,
                    command: jump.command.clone(),
                    directory: Some(jump.mismatch.required.clone()),
                    injected: true,
                    predicted: None,
                };
                self.fail(&in_flight, FailureKind::DirectoryChange, Some(exit_code));
                return;
            }
            TerminalEvent::Completed { .. } => jump.completed = true,
            TerminalEvent::PromptReady => jump.prompt_ready = true,
        }
        // The first recorded command must not inherit the jump's prompt.
        if !jump.completed || (prompt_mode && !jump.prompt_ready) {
            return;
        }
        let Some(jump) = self.jump.take() else {
            return;
        };

        self.state = PlaybackState::Idle;
        self.slot.release();
        match self.play(&jump.mismatch.recording_id) {
            Ok(PlayStart::Started) => {}
            Ok(PlayStart::DirectoryMismatch(mismatch)) => {
                self.emit(PlaybackEvent::DirectoryMismatch(mismatch));
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "playback.jump_retry_failed",
                    json!({
                        "recording_id": jump.mismatch.recording_id,
                        "error": err.to_string(),
                    }),
                );
            }
        }
    }

    fn advance(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.in_flight = None;
        if session.paused {
            session.ready_to_advance = true;
            return;
        }
        self.execute_next();
    }

    fn fail(&mut self, in_flight: &InFlight, kind: FailureKind, exit_code: Option<i32>) {
        let (recording_id, command_index) = match (&self.session, &self.jump) {
            (Some(session), _) => (session.recording.id.clone(), session.command_index),
            (None, Some(jump)) => (jump.mismatch.recording_id.clone(), 0),
            (None, None) => return,
        };
        let failure = PlaybackFailure {
            recording_id,
            failed_index: in_flight.index,
            command_index,
            command: in_flight.command.clone(),
            directory: in_flight.directory.clone(),
            exit_code,
            kind,
        };
        append_run_log(
            "error",
            "playback.failed",
            serde_json::to_value(&failure).unwrap_or_else(|_| json!({})),
        );
        self.finish(PlaybackOutcome::Failed(failure));
    }

    fn finish(&mut self, outcome: PlaybackOutcome) {
        let from_state = self.state.as_str();
        self.timer.disarm();
        self.session = None;
        self.jump = None;
        if self.state != PlaybackState::Idle {
            self.slot.release();
        }
        self.state = PlaybackState::Idle;
        let (level, event_type) = match &outcome {
            PlaybackOutcome::Completed { .. } => ("info", "playback.completed"),
            PlaybackOutcome::Stopped { .. } => ("info", "playback.stopped"),
            PlaybackOutcome::Failed(_) => ("warn", "playback.finished_with_failure"),
        };
        append_run_log(level, event_type, json!({ "from_state": from_state }));
        self.last_outcome = Some(outcome.clone());
        self.emit(PlaybackEvent::Finished(outcome));
    }

    fn emit(&mut self, event: PlaybackEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if self.state != PlaybackState::Idle {
            self.slot.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::model::CommandInput;
    use crate::runtime::{FakeClock, FakeFileSystem};
    use crate::terminal::FakeTerminal;

    const HOME: &str = "/home/alice";
    const PROJECT: &str = "/home/alice/project";

    struct Harness {
        engine: PlaybackEngine,
        terminal: FakeTerminal,
        store: Arc<RecordingStore>,
        clock: FakeClock,
        events: mpsc::UnboundedReceiver<PlaybackEvent>,
    }

    fn harness(terminal: FakeTerminal) -> Harness {
        harness_with_slot(terminal, PlaybackSlot::new())
    }

    fn harness_with_slot(terminal: FakeTerminal, slot: PlaybackSlot) -> Harness {
        let clock = FakeClock::default();
        let store = Arc::new(
            RecordingStore::open(
                "/data/recordings.json",
                Arc::new(FakeFileSystem::default()),
                Arc::new(clock.clone()),
            )
            .expect("store"),
        );
        let mut engine = PlaybackEngine::new(
            Arc::new(terminal.clone()),
            store.clone(),
            Arc::new(clock.clone()),
            slot,
            DEFAULT_FALLBACK_DELAY,
        );
        let events = engine.subscribe();
        Harness {
            engine,
            terminal,
            store,
            clock,
            events,
        }
    }

    fn at(command: &str, directory: &str) -> CommandInput {
        CommandInput::from(RecordedCommand::new(command, Some(directory.to_string())))
    }

    fn record(store: &RecordingStore, commands: Vec<CommandInput>) -> String {
        store.create("test", commands, "", None).expect("create")
    }

    fn ok() -> TerminalEvent {
        TerminalEvent::Completed { exit_code: 0 }
    }

    fn finish_command(engine: &mut PlaybackEngine) {
        engine.on_event(ok());
        engine.on_event(TerminalEvent::PromptReady);
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn failing_second_command_stops_playback_with_its_position() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["git pull".into(), "npm test".into(), "npm run build".into()]);

        assert_eq!(h.engine.play(&id).expect("play"), PlayStart::Started);
        finish_command(&mut h.engine);
        h.engine.on_event(TerminalEvent::Completed { exit_code: 1 });

        let Some(PlaybackOutcome::Failed(failure)) = h.engine.last_outcome().cloned() else {
            panic!("expected failure, got {:?}", h.engine.last_outcome());
        };
        assert_eq!(failure.failed_index, 1);
        assert_eq!(failure.command_index, 2);
        assert_eq!(failure.command, "npm test");
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.kind, FailureKind::Command);
        assert_eq!(h.terminal.dispatched_commands(), vec!["git pull", "npm test"]);
        assert_eq!(h.engine.state(), PlaybackState::Idle);
        assert!(h.engine.play(&id).is_ok());
    }

    #[test]
    fn matching_directory_plays_without_cd() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("ls", HOME), at("git status", HOME)]);

        assert_eq!(h.engine.play(&id).expect("play"), PlayStart::Started);
        assert_eq!(h.engine.state(), PlaybackState::Playing);
        finish_command(&mut h.engine);
        finish_command(&mut h.engine);

        assert_eq!(h.terminal.dispatched_commands(), vec!["ls", "git status"]);
        assert!(matches!(
            h.engine.last_outcome(),
            Some(PlaybackOutcome::Completed { .. })
        ));
        assert_eq!(h.store.get(&id).expect("recording").play_count, 1);
    }

    #[test]
    fn mismatch_is_reported_then_jump_starts_playback() {
        let mut h = harness(FakeTerminal::new("/tmp"));
        let id = record(&h.store, vec![at("ls", HOME)]);

        let PlayStart::DirectoryMismatch(mismatch) = h.engine.play(&id).expect("play") else {
            panic!("expected mismatch");
        };
        assert_eq!(mismatch.required, HOME);
        assert_eq!(mismatch.current, PathBuf::from("/tmp"));
        assert_eq!(h.engine.state(), PlaybackState::Idle);
        assert!(h.terminal.dispatched_commands().is_empty());

        h.engine.jump_to_directory(&mismatch).expect("jump");
        assert_eq!(h.engine.state(), PlaybackState::ValidatingDirectory);
        h.engine.on_event(ok());
        assert_eq!(h.engine.state(), PlaybackState::ValidatingDirectory);
        h.engine.on_event(TerminalEvent::PromptReady);

        assert_eq!(h.engine.state(), PlaybackState::Playing);
        assert_eq!(h.terminal.dispatched_commands(), vec!["cd /home/alice", "ls"]);
    }

    #[test]
    fn first_command_after_a_jump_waits_for_its_own_prompt() {
        let mut h = harness(FakeTerminal::new("/tmp"));
        let id = record(&h.store, vec![at("npm run build", HOME), at("npm test", HOME)]);
        let PlayStart::DirectoryMismatch(mismatch) = h.engine.play(&id).expect("play") else {
            panic!("expected mismatch");
        };
        h.engine.jump_to_directory(&mismatch).expect("jump");
        finish_command(&mut h.engine);

        h.engine.on_event(ok());
        assert_eq!(
            h.terminal.dispatched_commands(),
            vec!["cd /home/alice", "npm run build"]
        );
        h.engine.on_event(TerminalEvent::PromptReady);
        assert_eq!(
            h.terminal.dispatched_commands(),
            vec!["cd /home/alice", "npm run build", "npm test"]
        );
    }

    #[test]
    fn jump_that_does_not_land_reports_mismatch_again() {
        let mut h = harness(FakeTerminal::new("/tmp").ignoring_cd());
        let id = record(&h.store, vec![at("ls", HOME)]);
        let PlayStart::DirectoryMismatch(mismatch) = h.engine.play(&id).expect("play") else {
            panic!("expected mismatch");
        };
        h.engine.jump_to_directory(&mismatch).expect("jump");
        drain(&mut h.events);
        finish_command(&mut h.engine);

        assert_eq!(h.engine.state(), PlaybackState::Idle);
        let events = drain(&mut h.events);
        assert!(matches!(events.as_slice(), [PlaybackEvent::DirectoryMismatch(m)] if m.required == HOME));
    }

    #[test]
    fn cancelled_jump_releases_the_slot() {
        let slot = PlaybackSlot::new();
        let mut h = harness_with_slot(FakeTerminal::new("/tmp"), slot.clone());
        let id = record(&h.store, vec![at("ls", HOME)]);
        let PlayStart::DirectoryMismatch(mismatch) = h.engine.play(&id).expect("play") else {
            panic!("expected mismatch");
        };
        h.engine.jump_to_directory(&mismatch).expect("jump");
        assert!(slot.is_held());
        assert!(h.engine.cancel_jump());
        assert!(!slot.is_held());
        assert_eq!(
            h.engine.last_outcome(),
            Some(&PlaybackOutcome::Stopped { recording_id: id })
        );
        assert!(!h.engine.on_event(ok()));
        assert_eq!(h.terminal.dispatched_commands(), vec!["cd /home/alice"]);
    }

    #[test]
    fn failing_jump_is_a_directory_change_failure() {
        let mut h = harness(FakeTerminal::new("/tmp"));
        let id = record(&h.store, vec![at("ls", HOME)]);
        let PlayStart::DirectoryMismatch(mismatch) = h.engine.play(&id).expect("play") else {
            panic!("expected mismatch");
        };
        h.engine.jump_to_directory(&mismatch).expect("jump");
        h.engine.on_event(TerminalEvent::Completed { exit_code: 1 });

        let Some(PlaybackOutcome::Failed(failure)) = h.engine.last_outcome() else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::DirectoryChange);
        assert_eq!(failure.directory.as_deref(), Some(HOME));
        assert!(!h.engine.is_active());
    }

    #[test]
    fn cd_is_injected_when_a_command_ran_elsewhere() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("ls", HOME), at("make", PROJECT)]);

        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        assert_eq!(h.engine.state(), PlaybackState::AwaitingDirectoryChange);
        assert_eq!(h.terminal.dispatched_commands(), vec!["ls", "cd /home/alice/project"]);

        h.engine.on_event(ok());
        assert_eq!(h.engine.state(), PlaybackState::AwaitingDirectoryChange);
        h.engine.on_event(TerminalEvent::PromptReady);
        assert_eq!(h.engine.state(), PlaybackState::Playing);
        assert_eq!(
            h.terminal.dispatched_commands(),
            vec!["ls", "cd /home/alice/project", "make"]
        );
        finish_command(&mut h.engine);
        assert!(matches!(
            h.engine.last_outcome(),
            Some(PlaybackOutcome::Completed { .. })
        ));
    }

    #[test]
    fn prompt_of_an_injected_cd_is_not_credited_to_the_next_command() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(
            &h.store,
            vec![
                at("ls", HOME),
                at("long-running-build", PROJECT),
                at("deploy", PROJECT),
            ],
        );
        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        finish_command(&mut h.engine);
        assert_eq!(
            h.terminal.dispatched_commands(),
            vec!["ls", "cd /home/alice/project", "long-running-build"]
        );

        h.engine.on_event(ok());
        assert_eq!(h.terminal.dispatched_commands().len(), 3);
        h.engine.on_event(TerminalEvent::PromptReady);
        assert_eq!(
            h.terminal.dispatched_commands().last().map(String::as_str),
            Some("deploy")
        );
    }

    #[test]
    fn failing_injected_cd_is_labelled_directory_change() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("ls", HOME), at("make", PROJECT)]);
        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        h.engine.on_event(TerminalEvent::Completed { exit_code: 1 });

        let Some(PlaybackOutcome::Failed(failure)) = h.engine.last_outcome() else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::DirectoryChange);
        assert_eq!(failure.failed_index, 1);
        assert_eq!(failure.command, "cd /home/alice/project");
        assert!(failure.to_string().contains("directory change"));
        assert_eq!(h.terminal.dispatched_commands().len(), 2);
    }

    #[test]
    fn directory_drift_is_not_reconciled() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("ls", HOME), at("make", HOME)]);
        h.engine.play(&id).expect("play");
        h.terminal.set_cwd("/tmp");
        finish_command(&mut h.engine);

        assert_eq!(h.terminal.dispatched_commands(), vec!["ls", "make"]);
        assert_eq!(h.engine.state(), PlaybackState::Playing);
    }

    #[test]
    fn recorded_cd_moves_tracking_without_injection() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("cd project", HOME), at("make", PROJECT)]);
        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        finish_command(&mut h.engine);
        assert_eq!(h.terminal.dispatched_commands(), vec!["cd project", "make"]);
    }

    #[test]
    fn prompt_before_completion_still_waits_for_completion() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["a".into(), "b".into()]);
        h.engine.play(&id).expect("play");
        h.engine.on_event(TerminalEvent::PromptReady);
        assert_eq!(h.terminal.dispatched_commands(), vec!["a"]);
        h.engine.on_event(ok());
        assert_eq!(h.terminal.dispatched_commands(), vec!["a", "b"]);
    }

    #[test]
    fn fallback_timer_advances_terminals_without_prompt_events() {
        let mut h = harness(FakeTerminal::new(HOME).without_prompt_ready());
        let id = record(&h.store, vec!["a".into(), "b".into()]);
        h.engine.play(&id).expect("play");
        assert!(h.engine.next_deadline().is_some());

        h.clock.advance(Duration::from_millis(999));
        assert!(!h.engine.tick());
        h.clock.advance(Duration::from_millis(1));
        assert!(h.engine.tick());
        assert_eq!(h.terminal.dispatched_commands(), vec!["a", "b"]);

        h.clock.advance(DEFAULT_FALLBACK_DELAY);
        assert!(h.engine.tick());
        assert!(matches!(
            h.engine.last_outcome(),
            Some(PlaybackOutcome::Completed { .. })
        ));
        assert!(h.engine.next_deadline().is_none());
    }

    #[test]
    fn fallback_mode_does_not_time_injected_cd() {
        let mut h = harness(FakeTerminal::new(HOME).without_prompt_ready());
        let id = record(&h.store, vec![at("ls", HOME), at("make", PROJECT)]);
        h.engine.play(&id).expect("play");
        h.clock.advance(DEFAULT_FALLBACK_DELAY);
        assert!(h.engine.tick());
        assert_eq!(h.engine.state(), PlaybackState::AwaitingDirectoryChange);
        assert!(h.engine.next_deadline().is_none());
        h.engine.on_event(ok());
        assert!(h.engine.next_deadline().is_some());
    }

    #[test]
    fn pause_holds_the_next_command_until_resume() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["a".into(), "b".into()]);
        h.engine.play(&id).expect("play");
        assert!(h.engine.pause());
        assert!(!h.engine.pause());
        finish_command(&mut h.engine);
        assert_eq!(h.terminal.dispatched_commands(), vec!["a"]);
        assert_eq!(h.engine.state(), PlaybackState::Paused);

        assert!(h.engine.resume());
        assert!(!h.engine.resume());
        assert_eq!(h.terminal.dispatched_commands(), vec!["a", "b"]);
    }

    #[test]
    fn pause_withholds_the_command_behind_an_injected_cd() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec![at("ls", HOME), at("make", PROJECT)]);
        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        h.engine.pause();
        finish_command(&mut h.engine);
        assert_eq!(h.terminal.dispatched_commands(), vec!["ls", "cd /home/alice/project"]);

        h.engine.resume();
        assert_eq!(h.engine.state(), PlaybackState::Playing);
        assert_eq!(
            h.terminal.dispatched_commands(),
            vec!["ls", "cd /home/alice/project", "make"]
        );
    }

    #[test]
    fn pause_disarms_and_resume_rearms_the_fallback_timer() {
        let mut h = harness(FakeTerminal::new(HOME).without_prompt_ready());
        let id = record(&h.store, vec!["a".into(), "b".into()]);
        h.engine.play(&id).expect("play");
        let armed = h.engine.next_deadline().expect("armed");
        h.engine.pause();
        assert!(h.engine.next_deadline().is_none());
        assert!(!h.engine.on_timer(armed));
        h.engine.resume();
        assert!(h.engine.next_deadline().is_some());
    }

    #[test]
    fn second_play_is_rejected_while_active() {
        let slot = PlaybackSlot::new();
        let mut h = harness_with_slot(FakeTerminal::new(HOME), slot.clone());
        let id = record(&h.store, vec!["a".into()]);
        h.engine.play(&id).expect("play");
        assert!(matches!(
            h.engine.play(&id),
            Err(SequencerError::PlaybackActive(_))
        ));

        let mut other = harness_with_slot(FakeTerminal::new(HOME), slot.clone());
        let other_id = record(&other.store, vec!["b".into()]);
        assert!(matches!(
            other.engine.play(&other_id),
            Err(SequencerError::PlaybackActive(_))
        ));

        h.engine.stop();
        assert!(!slot.is_held());
        assert_eq!(other.engine.play(&other_id).expect("play"), PlayStart::Started);
    }

    #[test]
    fn stop_is_idempotent_and_reports_once() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["a".into(), "b".into()]);
        assert!(!h.engine.stop());
        h.engine.play(&id).expect("play");
        drain(&mut h.events);
        assert!(h.engine.stop());
        assert!(!h.engine.stop());

        let events = drain(&mut h.events);
        assert_eq!(
            events,
            vec![PlaybackEvent::Finished(PlaybackOutcome::Stopped {
                recording_id: id
            })]
        );
        assert!(!h.engine.on_event(ok()));
    }

    #[test]
    fn empty_recording_completes_immediately() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, Vec::new());
        h.engine.play(&id).expect("play");
        assert!(matches!(
            h.engine.last_outcome(),
            Some(PlaybackOutcome::Completed { .. })
        ));
        assert!(!h.engine.is_active());
    }

    #[test]
    fn dispatch_refusal_fails_playback() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["a".into()]);
        h.terminal
            .set_fail_next(SequencerError::Terminal("closed".to_string()));
        h.engine.play(&id).expect("play");
        let Some(PlaybackOutcome::Failed(failure)) = h.engine.last_outcome() else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Dispatch);
        assert_eq!(failure.exit_code, None);
    }

    #[test]
    fn unknown_recording_is_an_error() {
        let mut h = harness(FakeTerminal::new(HOME));
        assert!(matches!(
            h.engine.play("recording_missing"),
            Err(SequencerError::RecordingNotFound(_))
        ));
        assert!(!h.engine.is_active());
    }

    #[test]
    fn events_follow_the_playback_lifecycle() {
        let mut h = harness(FakeTerminal::new(HOME));
        let id = record(&h.store, vec!["a".into()]);
        h.engine.play(&id).expect("play");
        finish_command(&mut h.engine);
        let events = drain(&mut h.events);
        assert_eq!(
            events,
            vec![
                PlaybackEvent::Started {
                    recording_id: id.clone(),
                    total: 1
                },
                PlaybackEvent::Dispatched {
                    index: 0,
                    command: "a".to_string(),
                    injected: false
                },
                PlaybackEvent::Finished(PlaybackOutcome::Completed { recording_id: id }),
            ]
        );
    }
}
