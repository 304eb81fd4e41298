/// Outcome of a `submit` or `poll` call against an interpreter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// The command was accepted, or its sentinel line has not shown up yet.
    Running,
    /// The sentinel line was printed and nothing reached the error stream.
    Success,
    /// The interpreter wrote to its error stream while running the command.
    ScriptError,
    /// Writing the command to the interpreter's input failed.
    StdinClosed,
    /// The caller does not hold the session lock.
    CallerMismatch,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Running)
    }
}
