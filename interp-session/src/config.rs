use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::time::Duration;

use crate::errors::SessionError;

/// How an interpreter session is launched and how long it waits on the
/// interpreter. Every field may be omitted from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Flag that makes the interpreter load `profile` before reading
    /// commands, e.g. `-PSConsoleFile`.
    pub profile_flag: String,
    pub profile: Option<PathBuf>,
    /// Written to the interpreter's input when the session is closed.
    pub exit_instruction: String,
    pub stderr_grace_ms: u64,
    pub startup_grace_ms: u64,
    /// Error text left without a line break for this long is collected as a
    /// line of its own.
    pub partial_line_flush_ms: u64,
    /// Bound on the number of lines each drain queues ahead of the session.
    pub channel_capacity: usize,
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "powershell".to_string(),
            args: ["-ExecutionPolicy", "Bypass", "-NoExit", "-"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            profile_flag: "-PSConsoleFile".to_string(),
            profile: None,
            exit_instruction: "exit;".to_string(),
            stderr_grace_ms: 500,
            startup_grace_ms: 250,
            partial_line_flush_ms: 50,
            channel_capacity: 1024,
            close_timeout_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SessionError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SessionError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Arguments passed to `program`: the profile flag and path first when a
    /// profile is configured, then `args`.
    pub fn interpreter_args(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::with_capacity(self.args.len() + 2);
        if let Some(profile) = &self.profile {
            argv.push(self.profile_flag.clone().into());
            argv.push(profile.clone().into_os_string());
        }
        argv.extend(self.args.iter().map(OsString::from));
        argv
    }

    pub fn stderr_grace(&self) -> Duration {
        Duration::from_millis(self.stderr_grace_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn partial_line_flush(&self) -> Duration {
        Duration::from_millis(self.partial_line_flush_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
