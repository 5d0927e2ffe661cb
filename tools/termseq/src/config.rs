use crate::errors::SequencerError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_FALLBACK_DELAY_MS: u64 = 1_000;
pub const RECORDINGS_FILE_NAME: &str = "session_recordings.json";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub playback: PlaybackConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Watchdog for a running item; `0` disables it.
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Delay between dispatches for terminals that never report a ready prompt.
    pub fallback_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl QueueConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl PlaybackConfig {
    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            queue: QueueConfig {
                command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            },
            playback: PlaybackConfig {
                fallback_delay_ms: DEFAULT_FALLBACK_DELAY_MS,
            },
            store: StoreConfig {
                path: data_dir.join(RECORDINGS_FILE_NAME),
            },
            logging: LoggingConfig {
                enabled: true,
                path: data_dir.join("logs").join("run.jsonl"),
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
            shell: ShellConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string()],
            },
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("termseq"))
        .unwrap_or_else(|| PathBuf::from(".termseq"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    queue: Option<PartialQueueConfig>,
    playback: Option<PartialPlaybackConfig>,
    store: Option<PartialStoreConfig>,
    logging: Option<PartialLoggingConfig>,
    shell: Option<PartialShellConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialQueueConfig {
    command_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPlaybackConfig {
    fallback_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStoreConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialShellConfig {
    program: Option<String>,
    args: Option<Vec<String>>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, SequencerError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| SequencerError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    cfg.store.path = absolutize_path(process_cwd, &cfg.store.path);
    cfg.logging.path = absolutize_path(process_cwd, &cfg.logging.path);

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(queue) = partial.queue {
        if let Some(value) = queue.command_timeout_ms {
            cfg.queue.command_timeout_ms = value;
        }
    }

    if let Some(playback) = partial.playback {
        if let Some(value) = playback.fallback_delay_ms {
            cfg.playback.fallback_delay_ms = value;
        }
    }

    if let Some(store) = partial.store {
        if let Some(path) = store.path {
            cfg.store.path = path;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.enabled {
            cfg.logging.enabled = value;
        }
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(shell) = partial.shell {
        if let Some(program) = shell.program {
            cfg.shell.program = program;
        }
        if let Some(args) = shell.args {
            cfg.shell.args = args;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.store_path {
        cfg.store.path = path.clone();
    }
    if let Some(timeout) = overrides.command_timeout_ms {
        cfg.queue.command_timeout_ms = timeout;
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), SequencerError> {
    if cfg.playback.fallback_delay_ms == 0 {
        return Err(SequencerError::InvalidConfig(
            "playback.fallback_delay_ms must be greater than zero".to_string(),
        ));
    }

    if cfg.shell.program.trim().is_empty() {
        return Err(SequencerError::InvalidConfig(
            "shell.program must not be empty".to_string(),
        ));
    }

    if cfg.logging.max_payload_bytes < 16 {
        return Err(SequencerError::InvalidConfig(
            "logging.max_payload_bytes must be at least 16".to_string(),
        ));
    }

    Ok(())
}
