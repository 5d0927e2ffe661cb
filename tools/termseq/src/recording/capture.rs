use crate::errors::SequencerError;
use crate::logging::append_run_log;
use crate::paths::{is_cd_command, predict_directory_after};
use crate::recording::model::{CommandInput, RecordedCommand};
use crate::recording::store::RecordingStore;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Collects commands as they are entered into a terminal, tagging each with
/// the directory it ran in.
#[derive(Debug, Clone, Default)]
pub struct CaptureSession {
    start_directory: Option<String>,
    expected_directory: Option<PathBuf>,
    commands: Vec<RecordedCommand>,
}

impl CaptureSession {
    pub fn start(terminal_cwd: Option<&Path>) -> Self {
        append_run_log(
            "info",
            "capture.started",
            json!({ "cwd": terminal_cwd.map(|p| p.display().to_string()) }),
        );
        Self {
            start_directory: terminal_cwd.map(|p| p.display().to_string()),
            expected_directory: terminal_cwd.map(Path::to_path_buf),
            commands: Vec::new(),
        }
    }

    /// Record `command` as entered while the terminal sat in `terminal_cwd`.
    pub fn record(&mut self, command: &str, terminal_cwd: Option<&Path>) {
        if command.trim().is_empty() {
            return;
        }
        let directory = terminal_cwd
            .map(Path::to_path_buf)
            .or_else(|| self.expected_directory.clone());

        if is_cd_command(command) {
            if let Some(base) = directory.as_deref() {
                if let Some(next) = predict_directory_after(command, base) {
                    if next.is_dir() {
                        self.expected_directory = Some(next);
                    }
                }
            }
        } else if let Some(actual) = terminal_cwd {
            self.expected_directory = Some(actual.to_path_buf());
        }

        self.commands.push(RecordedCommand::new(
            command,
            directory.map(|d| d.display().to_string()),
        ));
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Where the next command is expected to run, following `cd` targets.
    pub fn expected_directory(&self) -> Option<&Path> {
        self.expected_directory.as_deref()
    }

    /// Persist the capture as a recording. Nothing is stored when no command
    /// was captured.
    pub fn finish(
        self,
        store: &RecordingStore,
        name: &str,
        description: &str,
    ) -> Result<Option<String>, SequencerError> {
        if self.commands.is_empty() {
            append_run_log("info", "capture.discarded_empty", json!({ "name": name }));
            return Ok(None);
        }
        let commands = self
            .commands
            .into_iter()
            .map(CommandInput::from)
            .collect::<Vec<_>>();
        let id = store.create(name, commands, description, self.start_directory)?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeFileSystem};
    use std::sync::Arc;

    #[test]
    fn commands_carry_the_directory_they_ran_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("app");
        std::fs::create_dir(&app).expect("mkdir");

        let mut capture = CaptureSession::start(Some(dir.path()));
        capture.record("cd app", Some(dir.path()));
        assert!(crate::paths::same_directory(
            capture.expected_directory().expect("tracked"),
            &app
        ));
        capture.record("npm test", Some(&app));
        capture.record("   ", Some(&app));

        let commands = capture.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].directory, Some(dir.path().display().to_string()));
        assert_eq!(commands[1].directory, Some(app.display().to_string()));
    }

    #[test]
    fn cd_into_missing_directory_keeps_expectation() {
        let mut capture = CaptureSession::start(Some(Path::new("/")));
        capture.record("cd /definitely/not/here/termseq", Some(Path::new("/")));
        assert_eq!(capture.expected_directory(), Some(Path::new("/")));
    }

    #[test]
    fn finish_only_stores_non_empty_captures() {
        let fs = FakeFileSystem::default();
        let store = RecordingStore::open(
            "/data/recs.json",
            Arc::new(fs),
            Arc::new(FakeClock::default()),
        )
        .expect("store");

        let empty = CaptureSession::start(Some(Path::new("/srv")));
        assert_eq!(empty.finish(&store, "nothing", "").expect("finish"), None);
        assert!(store.list_all().is_empty());

        let mut capture = CaptureSession::start(Some(Path::new("/srv")));
        capture.record("ls", Some(Path::new("/srv")));
        let id = capture
            .finish(&store, "listing", "")
            .expect("finish")
            .expect("stored");
        let recording = store.get(&id).expect("recording");
        assert_eq!(recording.start_directory.as_deref(), Some("/srv"));
        assert_eq!(recording.commands[0].directory.as_deref(), Some("/srv"));
    }
}
