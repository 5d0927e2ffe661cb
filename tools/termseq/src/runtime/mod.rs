use crate::errors::SequencerError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, SequencerError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, SequencerError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SequencerError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), SequencerError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), SequencerError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Console: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), SequencerError>;
    fn write_error_line(&self, line: &str) -> Result<(), SequencerError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SequencerError> {
        std::fs::read_to_string(path).map_err(|e| SequencerError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SequencerError> {
        std::fs::write(path, contents).map_err(|e| SequencerError::Io(e.to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), SequencerError> {
        std::fs::rename(from, to).map_err(|e| SequencerError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SequencerError> {
        std::fs::create_dir_all(path).map_err(|e| SequencerError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionProcessRunner;

impl ProcessRunner for ProductionProcessRunner {
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, SequencerError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args).envs(&request.env);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .map_err(|e| SequencerError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub struct ProductionConsole;

impl Console for ProductionConsole {
    fn write_line(&self, line: &str) -> Result<(), SequencerError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| SequencerError::Io(e.to_string()))
    }

    fn write_error_line(&self, line: &str) -> Result<(), SequencerError> {
        use std::io::Write;
        let mut err = std::io::stderr();
        writeln!(err, "{line}").map_err(|e| SequencerError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub console: Arc<dyn Console>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner),
            console: Arc::new(ProductionConsole),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *lock(&self.now)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<SequencerError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        lock(&fs.files).insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: SequencerError) {
        *lock(&self.fail_next) = Some(error);
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    fn maybe_fail(&self) -> Result<(), SequencerError> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SequencerError> {
        self.maybe_fail()?;
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| SequencerError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SequencerError> {
        self.maybe_fail()?;
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), SequencerError> {
        self.maybe_fail()?;
        let mut files = lock(&self.files);
        let contents = files
            .remove(from)
            .ok_or_else(|| SequencerError::Io(format!("missing file {}", from.display())))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SequencerError> {
        self.maybe_fail()?;
        lock(&self.dirs).push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeConsole {
    lines: Arc<Mutex<Vec<String>>>,
    error_lines: Arc<Mutex<Vec<String>>>,
}

impl FakeConsole {
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        lock(&self.error_lines).clone()
    }
}

impl Console for FakeConsole {
    fn write_line(&self, line: &str) -> Result<(), SequencerError> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }

    fn write_error_line(&self, line: &str) -> Result<(), SequencerError> {
        lock(&self.error_lines).push(line.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, SequencerError>>>>,
    requests: Arc<Mutex<Vec<ProcessRequest>>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, SequencerError>) {
        lock(&self.responses).push(output);
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        lock(&self.requests).clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, SequencerError> {
        lock(&self.requests).push(request);
        let mut responses = lock(&self.responses);
        if responses.is_empty() {
            return Err(SequencerError::Process(
                "no fake response queued".to_string(),
            ));
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_file_system_rename_moves_contents() {
        let fs = FakeFileSystem::with_file("/a.tmp", "{}");
        fs.rename(Path::new("/a.tmp"), Path::new("/a.json"))
            .expect("rename");
        assert!(!fs.exists(Path::new("/a.tmp")));
        assert_eq!(fs.contents(Path::new("/a.json")).as_deref(), Some("{}"));
    }

    #[test]
    fn fake_file_system_fails_once_when_armed() {
        let fs = FakeFileSystem::default();
        fs.set_fail_next(SequencerError::Io("disk full".to_string()));
        assert!(fs.write_string(Path::new("/x"), "1").is_err());
        assert!(fs.write_string(Path::new("/x"), "1").is_ok());
    }

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::default();
        clock.advance(Duration::from_millis(250));
        assert_eq!(
            clock.now(),
            SystemTime::UNIX_EPOCH + Duration::from_millis(250)
        );
    }

    #[test]
    fn fake_process_runner_replays_responses_in_order() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: "ok".to_string(),
            stderr: String::new(),
        }));
        let request = ProcessRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string()],
            cwd: None,
            env: BTreeMap::new(),
        };
        assert_eq!(runner.run(request.clone()).expect("first").stdout, "ok");
        assert!(runner.run(request).is_err());
        assert_eq!(runner.requests().len(), 2);
    }
}
