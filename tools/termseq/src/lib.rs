pub mod config;
pub mod driver;
pub mod errors;
pub mod log_retention;
pub mod logging;
pub mod paths;
pub mod playback;
pub mod queue;
pub mod recording;
pub mod runtime;
pub mod terminal;
pub mod timer;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use driver::TerminalDriver;
use errors::SequencerError;
use logging::{init_run_logger, structured_fallback_line, JsonlLogger};
use playback::{PlayStart, PlaybackEngine, PlaybackEvent, PlaybackOutcome, PlaybackSlot};
use queue::{CommandQueue, QueueItemStatus};
use recording::capture::CaptureSession;
use recording::store::RecordingStore;
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terminal::shell::ShellTerminal;
use terminal::{EnvVars, Terminal};
use tokio::sync::mpsc;

/// Exit code for a failed playback or a directory mismatch left unresolved.
pub const EXIT_PLAYBACK_FAILED: i32 = 2;

#[derive(Debug, Clone, Parser)]
#[command(name = "termseq")]
#[command(about = "Queue, record and replay terminal command sequences")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub store: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List recordings, newest first.
    List,
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    Duplicate {
        id: String,
    },
    Export {
        id: String,
        path: PathBuf,
    },
    Import {
        path: PathBuf,
    },
    /// Run commands one after another and save them as a recording.
    Record {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(required = true)]
        commands: Vec<String>,
    },
    Play {
        id: String,
        /// `cd` into the recording's directory first instead of refusing.
        #[arg(long, default_value_t = false)]
        jump: bool,
    },
    /// Run commands through the queue, one at a time.
    Queue {
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

pub fn run() -> Result<i32, SequencerError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| SequencerError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, SequencerError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(SequencerError::Cli(error.to_string())),
        },
    };

    let timeout_override = match &cli.command {
        Command::Queue { timeout_ms, .. } => *timeout_ms,
        _ => None,
    };
    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        store_path: cli.store.clone(),
        command_timeout_ms: timeout_override,
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;

    if cfg.logging.enabled {
        init_run_logger(JsonlLogger {
            path: cfg.logging.path.clone(),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.budget_bytes,
        });
    }
    logging::append_run_log(
        "info",
        "cli.started",
        json!({
            "command": format!("{:?}", cli.command),
            "store": cfg.store.path.display().to_string(),
        }),
    );

    let store = Arc::new(RecordingStore::open(
        &cfg.store.path,
        runtime.file_system.clone(),
        runtime.clock.clone(),
    )?);
    let console = runtime.console.as_ref();

    match cli.command {
        Command::List => {
            for recording in store.list_all() {
                console.write_line(&format!(
                    "{}\t{}\t{} commands\tplayed {}",
                    recording.id,
                    recording.name,
                    recording.commands.len(),
                    recording.play_count
                ))?;
            }
            Ok(0)
        }
        Command::Show { id } => {
            let recording = store
                .get(&id)
                .ok_or_else(|| SequencerError::RecordingNotFound(id.clone()))?;
            let body = serde_json::to_string_pretty(&recording)
                .map_err(|e| SequencerError::Io(e.to_string()))?;
            console.write_line(&body)?;
            Ok(0)
        }
        Command::Delete { id } => {
            if !store.delete(&id)? {
                return Err(SequencerError::RecordingNotFound(id));
            }
            console.write_line(&format!("deleted {id}"))?;
            Ok(0)
        }
        Command::Duplicate { id } => {
            let copy = store
                .duplicate(&id)?
                .ok_or_else(|| SequencerError::RecordingNotFound(id.clone()))?;
            console.write_line(&copy)?;
            Ok(0)
        }
        Command::Export { id, path } => {
            let path = absolutize(cwd, &path);
            if !store.export(&id, &path)? {
                return Err(SequencerError::RecordingNotFound(id));
            }
            console.write_line(&path.display().to_string())?;
            Ok(0)
        }
        Command::Import { path } => {
            let id = store.import(&absolutize(cwd, &path))?;
            console.write_line(&id)?;
            Ok(0)
        }
        Command::Record {
            name,
            description,
            commands,
        } => record_commands(&cfg, runtime, store, cwd, &name, &description, &commands),
        Command::Play { id, jump } => play_recording(&cfg, runtime, store, cwd, &id, jump),
        Command::Queue { commands, .. } => run_queue(&cfg, runtime, store, cwd, &commands),
    }
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

struct ShellSession {
    driver: TerminalDriver,
    terminal: Arc<dyn Terminal>,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
}

fn open_shell_session(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    store: Arc<RecordingStore>,
    cwd: &Path,
) -> ShellSession {
    let (terminal, events) = ShellTerminal::new(
        runtime.process_runner.clone(),
        cfg.shell.clone(),
        cwd.to_path_buf(),
    );
    let terminal: Arc<dyn Terminal> = Arc::new(terminal.with_echo(runtime.console.clone()));
    let queue =
        CommandQueue::new(terminal.clone(), runtime.clock.clone()).with_timeout(cfg.queue.command_timeout());
    let mut engine = PlaybackEngine::new(
        terminal.clone(),
        store,
        runtime.clock.clone(),
        PlaybackSlot::global(),
        cfg.playback.fallback_delay(),
    );
    let playback_events = engine.subscribe();
    let (driver, _handle) = TerminalDriver::new(queue, engine, runtime.clock.clone(), events);
    ShellSession {
        driver,
        terminal,
        playback_events,
    }
}

fn event_loop() -> Result<tokio::runtime::Runtime, SequencerError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| SequencerError::Io(e.to_string()))
}

fn play_recording(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    store: Arc<RecordingStore>,
    cwd: &Path,
    id: &str,
    jump: bool,
) -> Result<i32, SequencerError> {
    let console = runtime.console.as_ref();
    let mut session = open_shell_session(cfg, runtime, store, cwd);

    match session.driver.engine_mut().play(id)? {
        PlayStart::Started => {}
        PlayStart::DirectoryMismatch(mismatch) if jump => {
            console.write_line(&format!("cd {}", mismatch.required))?;
            session.driver.engine_mut().jump_to_directory(&mismatch)?;
        }
        PlayStart::DirectoryMismatch(mismatch) => {
            console.write_error_line(&format!(
                "recording {} must start in {} but the terminal is in {}; rerun with --jump",
                mismatch.recording_id,
                mismatch.required,
                mismatch.current.display()
            ))?;
            return Ok(EXIT_PLAYBACK_FAILED);
        }
    }

    event_loop()?.block_on(
        session
            .driver
            .run_until(|driver| !driver.engine().is_active()),
    );

    let mut unresolved = None;
    while let Ok(event) = session.playback_events.try_recv() {
        if let PlaybackEvent::DirectoryMismatch(mismatch) = event {
            unresolved = Some(mismatch);
        }
    }

    match session.driver.engine().last_outcome() {
        Some(PlaybackOutcome::Completed { recording_id }) => {
            console.write_line(&structured_fallback_line(
                "playback",
                "completed",
                recording_id,
            ))?;
            Ok(0)
        }
        Some(PlaybackOutcome::Failed(failure)) => {
            console.write_error_line(&structured_fallback_line(
                "playback",
                "failed",
                &failure.to_string(),
            ))?;
            Ok(EXIT_PLAYBACK_FAILED)
        }
        Some(PlaybackOutcome::Stopped { recording_id }) => {
            console.write_error_line(&structured_fallback_line(
                "playback",
                "stopped",
                recording_id,
            ))?;
            Ok(1)
        }
        None => {
            let message = unresolved
                .map(|m| {
                    format!(
                        "terminal is in {} after jumping, expected {}",
                        m.current.display(),
                        m.required
                    )
                })
                .unwrap_or_else(|| format!("playback of {id} did not start"));
            console.write_error_line(&structured_fallback_line(
                "playback",
                "mismatch",
                &message,
            ))?;
            Ok(EXIT_PLAYBACK_FAILED)
        }
    }
}

fn run_queue(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    store: Arc<RecordingStore>,
    cwd: &Path,
    commands: &[String],
) -> Result<i32, SequencerError> {
    let console = runtime.console.as_ref();
    let mut session = open_shell_session(cfg, runtime, store, cwd);
    let queue = session.driver.queue_mut();
    for (index, command) in commands.iter().enumerate() {
        queue.enqueue(command, &format!("#{}", index + 1), EnvVars::new());
    }
    queue.start();

    event_loop()?.block_on(
        session
            .driver
            .run_until(|driver| driver.queue().history().len() == commands.len()),
    );

    let mut dispatch_failed = false;
    for item in session.driver.queue().history() {
        dispatch_failed |= item.status == QueueItemStatus::DispatchFailed;
        console.write_line(&structured_fallback_line(
            "queue",
            item.status.as_str(),
            &format!("{} {}", item.display_name, item.command),
        ))?;
    }
    Ok(if dispatch_failed { 1 } else { 0 })
}

fn record_commands(
    cfg: &AppConfig,
    runtime: &ProductionRuntime,
    store: Arc<RecordingStore>,
    cwd: &Path,
    name: &str,
    description: &str,
    commands: &[String],
) -> Result<i32, SequencerError> {
    let mut session = open_shell_session(cfg, runtime, store.clone(), cwd);
    let mut capture = CaptureSession::start(Some(cwd));
    let rt = event_loop()?;
    session.driver.queue_mut().start();

    for (index, command) in commands.iter().enumerate() {
        let terminal_cwd = session.terminal.current_working_directory();
        capture.record(command, Some(&terminal_cwd));
        session
            .driver
            .queue_mut()
            .enqueue(command, &format!("#{}", index + 1), EnvVars::new());
        let finished = index + 1;
        rt.block_on(
            session
                .driver
                .run_until(|driver| driver.queue().history().len() >= finished),
        );
    }

    match capture.finish(&store, name, description)? {
        Some(id) => {
            runtime.console.write_line(&id)?;
            Ok(0)
        }
        None => Ok(1),
    }
}
