use crate::config::ShellConfig;
use crate::errors::SequencerError;
use crate::logging::append_run_log;
use crate::paths::{cd_target, predict_directory_after};
use crate::runtime::{Console, ProcessRequest, ProcessRunner};
use crate::terminal::{EnvVars, Terminal, TerminalEvent};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Directories {
    current: PathBuf,
    /// Target of `cd -`.
    previous: Option<PathBuf>,
}

/// A non-interactive terminal: every command runs as `<shell> <args..> <command>`
/// on a worker thread in the tracked directory. `cd` is handled in-process so
/// the directory carries over between commands.
pub struct ShellTerminal {
    runner: Arc<dyn ProcessRunner>,
    shell: ShellConfig,
    directories: Mutex<Directories>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    echo: Option<Arc<dyn Console>>,
}

impl ShellTerminal {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        shell: ShellConfig,
        cwd: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                runner,
                shell,
                directories: Mutex::new(Directories {
                    current: cwd,
                    previous: None,
                }),
                events,
                echo: None,
            },
            rx,
        )
    }

    /// Forward each command's stdout/stderr to `console` once it finishes.
    pub fn with_echo(mut self, console: Arc<dyn Console>) -> Self {
        self.echo = Some(console);
        self
    }

    fn directories(&self) -> MutexGuard<'_, Directories> {
        self.directories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cwd(&self) -> PathBuf {
        self.directories().current.clone()
    }

    fn echo_error(&self, line: &str) {
        if let Some(console) = &self.echo {
            let _ = console.write_error_line(line);
        }
    }

    fn change_directory(&self, command: &str) -> i32 {
        let mut directories = self.directories();
        let back = cd_target(command).as_deref() == Some("-");
        let next = if back {
            match directories.previous.clone() {
                Some(previous) => previous,
                None => {
                    self.echo_error("cd: OLDPWD not set");
                    return 1;
                }
            }
        } else {
            match predict_directory_after(command, &directories.current) {
                Some(next) => next,
                None => return 1,
            }
        };
        if !next.is_dir() {
            self.echo_error(&format!("cd: no such directory: {}", next.display()));
            return 1;
        }
        if back {
            if let Some(console) = &self.echo {
                let _ = console.write_line(&next.display().to_string());
            }
        }
        directories.previous = Some(std::mem::replace(&mut directories.current, next));
        0
    }

    fn finish(&self, exit_code: i32) {
        let _ = self.events.send(TerminalEvent::Completed { exit_code });
        let _ = self.events.send(TerminalEvent::PromptReady);
    }
}

fn is_plain_cd(command: &str) -> bool {
    cd_target(command)
        .map(|target| !target.contains(['&', ';', '|', '$', '`']))
        .unwrap_or(false)
}

impl Terminal for ShellTerminal {
    fn execute(&self, command: &str, env_vars: &EnvVars) -> Result<(), SequencerError> {
        if is_plain_cd(command) {
            let exit_code = self.change_directory(command);
            append_run_log(
                "debug",
                "shell.cd",
                json!({
                    "command": command,
                    "exit_code": exit_code,
                    "cwd": self.cwd().display().to_string(),
                }),
            );
            self.finish(exit_code);
            return Ok(());
        }

        let mut args = self.shell.args.clone();
        args.push(command.to_string());
        let request = ProcessRequest {
            program: self.shell.program.clone(),
            args,
            cwd: Some(self.cwd()),
            env: env_vars.clone(),
        };
        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let echo = self.echo.clone();
        let command = command.to_string();

        thread::Builder::new()
            .name("termseq-shell".to_string())
            .spawn(move || {
                let exit_code = match runner.run(request) {
                    Ok(output) => {
                        if let Some(console) = &echo {
                            for line in output.stdout.lines() {
                                let _ = console.write_line(line);
                            }
                            for line in output.stderr.lines() {
                                let _ = console.write_error_line(line);
                            }
                        }
                        output.exit_code
                    }
                    Err(err) => {
                        append_run_log(
                            "error",
                            "shell.spawn_failed",
                            json!({ "command": command, "error": err.to_string() }),
                        );
                        127
                    }
                };
                let _ = events.send(TerminalEvent::Completed { exit_code });
                let _ = events.send(TerminalEvent::PromptReady);
            })
            .map_err(|e| SequencerError::Terminal(e.to_string()))?;
        Ok(())
    }

    fn current_working_directory(&self) -> PathBuf {
        self.cwd()
    }

    fn supports_prompt_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeConsole, FakeProcessRunner, ProcessOutput};

    fn shell() -> ShellConfig {
        ShellConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
        }
    }

    #[test]
    fn commands_run_through_the_shell_in_the_tracked_directory() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
        }));
        let (terminal, mut rx) =
            ShellTerminal::new(Arc::new(runner.clone()), shell(), PathBuf::from("/srv"));
        let mut env = EnvVars::new();
        env.insert("CI".to_string(), "1".to_string());
        terminal.execute("make test", &env).expect("execute");

        assert_eq!(
            rx.blocking_recv(),
            Some(TerminalEvent::Completed { exit_code: 3 })
        );
        assert_eq!(rx.blocking_recv(), Some(TerminalEvent::PromptReady));
        let requests = runner.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].args, vec!["-c".to_string(), "make test".to_string()]);
        assert_eq!(requests[0].cwd, Some(PathBuf::from("/srv")));
        assert_eq!(requests[0].env.get("CI").map(String::as_str), Some("1"));
    }

    #[test]
    fn cd_is_handled_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("project");
        std::fs::create_dir(&target).expect("mkdir");
        let runner = FakeProcessRunner::default();
        let (terminal, mut rx) =
            ShellTerminal::new(Arc::new(runner.clone()), shell(), dir.path().to_path_buf());

        terminal.execute("cd project", &EnvVars::new()).expect("cd");
        assert_eq!(
            rx.blocking_recv(),
            Some(TerminalEvent::Completed { exit_code: 0 })
        );
        assert!(crate::paths::same_directory(
            &terminal.current_working_directory(),
            &target
        ));

        terminal.execute("cd missing", &EnvVars::new()).expect("cd");
        let _ = rx.blocking_recv();
        assert_eq!(
            rx.blocking_recv(),
            Some(TerminalEvent::Completed { exit_code: 1 })
        );
        assert!(runner.requests().is_empty());
    }

    #[test]
    fn compound_cd_goes_to_the_shell() {
        assert!(!is_plain_cd("cd /tmp && make"));
        assert!(is_plain_cd("cd /tmp"));
        assert!(!is_plain_cd("make"));
    }

    #[test]
    fn cd_dash_returns_to_the_previous_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(dir.path()).expect("canonical");
        std::fs::create_dir(root.join("app")).expect("mkdir");
        let console = FakeConsole::default();
        let (terminal, mut rx) = ShellTerminal::new(
            Arc::new(FakeProcessRunner::default()),
            shell(),
            root.clone(),
        );
        let terminal = terminal.with_echo(Arc::new(console.clone()));

        terminal.execute("cd -", &EnvVars::new()).expect("cd");
        assert_eq!(
            rx.blocking_recv(),
            Some(TerminalEvent::Completed { exit_code: 1 })
        );
        assert_eq!(console.error_lines(), vec!["cd: OLDPWD not set"]);

        terminal.execute("cd app", &EnvVars::new()).expect("cd");
        terminal.execute("cd -", &EnvVars::new()).expect("cd");
        let exits: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| *event != TerminalEvent::PromptReady)
            .collect();
        assert_eq!(
            exits,
            vec![
                TerminalEvent::Completed { exit_code: 0 },
                TerminalEvent::Completed { exit_code: 0 },
            ]
        );
        assert_eq!(terminal.current_working_directory(), root);
        assert_eq!(console.written_lines(), vec![root.display().to_string()]);
    }

    #[test]
    fn command_output_is_echoed_to_the_console() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: "built\nok\n".to_string(),
            stderr: "warning: unused\n".to_string(),
        }));
        let console = FakeConsole::default();
        let (terminal, mut rx) =
            ShellTerminal::new(Arc::new(runner), shell(), PathBuf::from("/srv"));
        let terminal = terminal.with_echo(Arc::new(console.clone()));
        terminal.execute("make", &EnvVars::new()).expect("execute");

        assert_eq!(
            rx.blocking_recv(),
            Some(TerminalEvent::Completed { exit_code: 0 })
        );
        assert_eq!(console.written_lines(), vec!["built", "ok"]);
        assert_eq!(console.error_lines(), vec!["warning: unused"]);
    }
}
