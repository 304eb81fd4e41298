use tokio::time::Duration;
use tracing::trace;

use crate::command::CommandRequest;
use crate::drain::StreamDrain;
use crate::status::Status;

/// Line a submitted script prints once it has finished.
pub const SENTINEL_LINE: &str = "END_OF_SCRIPT";

/// Moves everything queued on both drains into `command` and decides where
/// the command stands.
///
/// Output lines are consumed before error lines. A sentinel line finishes the
/// command; error output arriving at any point turns a finished command into
/// a [`Status::ScriptError`], even when it is a fragment without a line break. Until the sentinel shows up the command stays
/// [`Status::Running`] no matter what the error stream says.
pub(crate) async fn resolve(
    command: &mut CommandRequest,
    stdout: &mut StreamDrain,
    stderr: &mut StreamDrain,
    stderr_grace: Duration,
) -> Status {
    for line in stdout.pop_available() {
        trace!("{} line: {line}", stdout.label());
        if line == SENTINEL_LINE {
            command.mark_finished();
            if stderr_activity(stderr, command.stderr_mark(), stderr_grace).await {
                command.note_error_activity();
                // The bytes may belong to a line the drain has not queued yet.
                if command.errors().is_empty() {
                    if let Some(error_line) = stderr.wait_for_line(stderr_grace).await {
                        command.push_error(error_line);
                    }
                }
            }
        } else {
            command.push_output(line);
        }
    }

    for line in stderr.pop_available() {
        trace!("{} line: {line}", stderr.label());
        command.push_error(line);
    }

    let status = if !command.is_finished() {
        Status::Running
    } else if command.has_errors() {
        Status::ScriptError
    } else {
        Status::Success
    };
    command.set_status(status)
}

/// Error text can trail the sentinel by a little, so give the error drain a
/// short window before calling the command clean. Any byte read past `mark`
/// counts, whether or not it completes a line.
async fn stderr_activity(stderr: &StreamDrain, mark: u64, grace: Duration) -> bool {
    stderr.wait_for_bytes_past(mark, grace).await
}
