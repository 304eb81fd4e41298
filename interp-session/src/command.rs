use crate::status::Status;

/// One command submitted to an interpreter session together with everything
/// the session has attributed to it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    command: String,
    output: Vec<String>,
    errors: Vec<String>,
    status: Status,
    /// Set once the sentinel line has been consumed for this command.
    finished: bool,
    /// Error stream byte count when the command was written. Only bytes past
    /// this mark belong to the command.
    stderr_mark: u64,
    /// Error bytes were seen that may not have formed a line yet.
    error_activity: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: Vec::new(),
            errors: Vec::new(),
            status: Status::Running,
            finished: false,
            stderr_mark: 0,
            error_activity: false,
        }
    }

    pub(crate) fn with_stderr_mark(self, stderr_mark: u64) -> Self {
        Self {
            stderr_mark,
            ..self
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True once error output has been seen for this command, even if it has
    /// not been collected as a line.
    pub fn has_errors(&self) -> bool {
        self.error_activity || !self.errors.is_empty()
    }

    pub(crate) fn stderr_mark(&self) -> u64 {
        self.stderr_mark
    }

    pub(crate) fn note_error_activity(&mut self) {
        self.error_activity = true;
    }

    pub(crate) fn push_output(&mut self, line: String) {
        self.output.push(line);
    }

    pub(crate) fn push_error(&mut self, line: String) {
        self.errors.push(line);
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Records `status` unless a terminal status is already in place. Returns
    /// the status the command ends up with.
    pub(crate) fn set_status(&mut self, status: Status) -> Status {
        if !self.status.is_terminal() {
            self.status = status;
        }
        self.status
    }
}

/// Renders lines in the diagnostic layout used for logs and settings: each
/// line followed by a line break and a tab.
pub fn format_lines(lines: &[String]) -> String {
    let mut out = String::with_capacity(lines.iter().map(|line| line.len() + 2).sum());
    for line in lines {
        out.push_str(line);
        out.push_str("\n\t");
    }
    out
}
