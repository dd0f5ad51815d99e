use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid boxed path '{path}': {reason}")]
    BadBoxedPath { path: String, reason: String },

    #[error("Wrapper '{wrapper}' requires a literal command: {reason}")]
    NonLiteralCommand { wrapper: String, reason: String },

    #[error("URL-backed files are not allowed by this configuration")]
    UrlFilesNotAllowed,

    // Validation errors
    #[error("Route '{route}' is not allowed")]
    RouteNotAllowed { route: String },

    #[error("Validation failed for route '{route}': {reason}")]
    Validation { route: String, reason: String },

    // Execution errors
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    // Protocol errors
    #[error("Remote response is missing the exit code")]
    MissingExitCode,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server returned HTTP {status}: {body}")]
    ServerStatus { status: u16, body: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Multipart error: {0}")]
    Multipart(#[from] multer::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunboxError {
    /// True for errors raised before any process or network activity.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound { .. }
                | Self::TomlParse(_)
                | Self::BadBoxedPath { .. }
                | Self::NonLiteralCommand { .. }
                | Self::UrlFilesNotAllowed
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::RouteNotAllowed { .. } | Self::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, RunboxError>;
