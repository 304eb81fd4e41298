use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start interpreter `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("interpreter {stream} was not captured")]
    MissingPipe { stream: &'static str },
    #[error("interpreter initialization problem, error stream not empty: {stderr}")]
    StartupFailure { stderr: String },
    #[error("session called by {caller}, but locked for {}", .holder.as_deref().unwrap_or("nobody"))]
    CallerMismatch {
        caller: String,
        holder: Option<String>,
    },
    #[error("{caller} cannot unlock a session locked for {}", .holder.as_deref().unwrap_or("nobody"))]
    NotLockHolder {
        caller: String,
        holder: Option<String>,
    },
    #[error("session is still locked for {holder}")]
    Locked { holder: String },
    #[error("session has an operation in flight")]
    Busy,
    #[error("failed to read config {}: {source}", .path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl SessionError {
    pub(crate) fn caller_mismatch(caller: &str, holder: Option<String>) -> Self {
        Self::CallerMismatch {
            caller: caller.to_string(),
            holder,
        }
    }
}
