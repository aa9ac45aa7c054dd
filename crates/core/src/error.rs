/// Result alias that carries the custom [`StageError`] type.
pub type Result<T> = std::result::Result<T, StageError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Free-form message for conditions that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// A caller handed in data the operation cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Config, lighting mode or fixture JSON failed to parse.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The audio file could not be decoded.
    #[error("audio decode: {0}")]
    Decode(#[from] hound::Error),
    /// A hardware device needed at startup is missing or refused to open.
    #[error("{device} is unavailable: {reason} (use the simulator to run without hardware)")]
    DeviceUnavailable { device: String, reason: String },
    /// The live capture stream failed while running.
    #[error("audio device failure: {0}")]
    AudioDevice(String),
    /// A persisted fixture record could not be turned into a fixture.
    #[error("malformed fixture record on line {line}: {reason}")]
    MalformedFixture { line: usize, reason: String },
    /// A fixture channel resolved outside the DMX universe.
    #[error("fixture `{fixture}` parameter `{param}` resolves to address {address}, outside 0..=511")]
    AddressOutOfRange {
        fixture: String,
        param: String,
        address: i64,
    },
    #[error("unknown lighting mode `{0}`")]
    UnknownMode(String),
    /// A shared lock was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl StageError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for StageError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for StageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
