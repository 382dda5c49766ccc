use std::fmt;

/// Failure reported by a loader for a single fetch attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("request timed out for {url}")]
    Timeout { url: String },

    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to read response body for {url}: {reason}")]
    Body { url: String, reason: String },
}

impl LoadError {
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Transient failures are worth another attempt; terminal ones are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                (500..600).contains(status) || *status == 408 || *status == 429
            }
            Self::Network { .. } | Self::Timeout { .. } | Self::Body { .. } => true,
            Self::InvalidUrl { .. } => false,
        }
    }

    /// Numeric code surfaced to the player, mirroring the HTTP status when there is one.
    pub fn code(&self) -> u32 {
        match self {
            Self::HttpStatus { status, .. } => u32::from(*status),
            _ => ErrorCode::NETWORK,
        }
    }
}

/// Manifest parsing or merge failure. Always non-fatal for the tracker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaylistError {
    #[error("manifest is not valid UTF-8: {0}")]
    Encoding(String),

    #[error("failed to parse manifest: {0}")]
    Parse(String),

    #[error("master playlist has no variants")]
    NoVariants,

    #[error("segment {sequence} has an empty URI")]
    EmptyUri { sequence: u64 },

    #[error("segment {sequence} has an invalid duration {duration}")]
    InvalidDuration { sequence: u64, duration: f64 },

    #[error("media sequence went backwards: {previous} -> {current}")]
    SequenceRegression { previous: u64, current: u64 },

    #[error("invalid IV `{0}`")]
    InvalidIv(String),

    #[error("unknown segment {0}")]
    UnknownSegment(String),

    #[error("segment {url} cannot move from {from} to {to}")]
    InvalidTransition {
        url: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecryptionError {
    #[error("unsupported encryption method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid key length {0}, expected 16 bytes")]
    InvalidKeyLength(usize),

    #[error("decryption key is not available yet")]
    MissingKey,

    #[error("decryption failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick interval must be greater than zero")]
    ZeroTickInterval,

    #[error("preload time must be a positive duration")]
    ZeroPreloadTime,

    #[error("retry delay {delay_ms}ms exceeds the maximum of {max_ms}ms")]
    RetryDelayAboveMax { delay_ms: u128, max_ms: u128 },
}

/// Crate-level error for operations on the controller itself.
#[derive(Debug, thiserror::Error)]
pub enum HlsLiveError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("controller has been torn down")]
    TornDown,

    #[error("operation was cancelled")]
    Cancelled,
}

/// Broad error category surfaced to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Parse,
    Buffer,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Parse => "parse",
            Self::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

/// Numeric codes carried by [`PlaybackError`].
pub struct ErrorCode;

impl ErrorCode {
    pub const NETWORK: u32 = 21;
    pub const KEY: u32 = 22;
    pub const MANIFEST: u32 = 30;
    pub const DEMUX: u32 = 31;
    pub const REMUX: u32 = 32;
    pub const BUFFER: u32 = 33;
    pub const DECRYPT: u32 = 34;
}

/// Player-facing error record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackError {
    pub code: u32,
    pub category: ErrorCategory,
    /// Human-readable detail in the form `[module]: message`.
    pub details: String,
    pub fatal: bool,
}

impl PlaybackError {
    pub fn new(
        code: u32,
        category: ErrorCategory,
        module: &str,
        message: impl fmt::Display,
        fatal: bool,
    ) -> Self {
        Self {
            code,
            category,
            details: format!("[{module}]: {message}"),
            fatal,
        }
    }
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error {} {}{}",
            self.category,
            self.code,
            self.details,
            if self.fatal { " (fatal)" } else { "" }
        )
    }
}
