//! Shares long-lived script interpreter processes between callers.
//!
//! An [`InterpreterSession`] owns one interpreter child process. Callers lock
//! it by id, submit a command whose last act is printing [`SENTINEL_LINE`],
//! and poll until the returned [`Status`] is terminal. Standard output and
//! standard error are drained in the background by [`StreamDrain`]s.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod actions;
mod command;
mod completion;
mod config;
mod drain;
mod errors;
mod registry;
mod session;
mod status;

pub use command::CommandRequest;
pub use command::format_lines;
pub use completion::SENTINEL_LINE;
pub use config::SessionConfig;
pub use drain::StreamDrain;
pub use errors::SessionError;
pub use registry::SessionRegistry;
pub use session::InterpreterSession;
pub use status::Status;
