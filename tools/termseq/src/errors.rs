use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("recording store parse error: {0}")]
    StoreParse(String),
    #[error("malformed recording: {0}")]
    MalformedRecording(String),
    #[error("recording not found: {0}")]
    RecordingNotFound(String),
    #[error("playback already active for recording {0}")]
    PlaybackActive(String),
    #[error("terminal error: {0}")]
    Terminal(String),
}
