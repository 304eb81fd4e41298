use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::command::CommandRequest;
use crate::command::format_lines;
use crate::completion;
use crate::config::SessionConfig;
use crate::drain::StreamDrain;
use crate::errors::SessionError;
use crate::status::Status;

/// A long-lived interpreter process shared by callers one at a time.
///
/// A caller takes the session with [`try_lock`](Self::try_lock), submits a
/// command, polls until the status is terminal, reads what the command
/// printed and finally [`unlock`](Self::unlock)s. Every operation other than
/// the lock queries takes the caller id and is refused for anyone but the
/// current holder.
///
/// Output is attributed to the current command while it is being polled; the
/// drains keep reading in between so the interpreter never waits on a full
/// pipe. Lines still queued when the next command is submitted go to the
/// command before it.
#[derive(Debug)]
pub struct InterpreterSession {
    config: SessionConfig,
    /// `None` while the session is free.
    owner: StdMutex<Option<String>>,
    /// `None` once the session has been closed.
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    io: Mutex<SessionIo>,
    child: Mutex<Child>,
}

#[derive(Debug)]
struct SessionIo {
    stdout: StreamDrain,
    stderr: StreamDrain,
    command: Option<CommandRequest>,
}

impl SessionIo {
    /// Hands lines still queued from the previous command to that command.
    /// Its status is left as it is.
    fn settle_previous(&mut self) {
        let output = self.stdout.pop_available();
        let errors = self.stderr.pop_available();
        if output.is_empty() && errors.is_empty() {
            return;
        }
        let Some(previous) = self.command.as_mut() else {
            debug!(
                "discarded {} output and {} error line(s) printed before any command",
                output.len(),
                errors.len()
            );
            return;
        };
        debug!(
            "settled {} late output and {} late error line(s) into the previous command",
            output.len(),
            errors.len()
        );
        for line in output {
            previous.push_output(line);
        }
        for line in errors {
            previous.push_error(line);
        }
    }
}

impl InterpreterSession {
    /// Spawns the interpreter described by `config` and starts draining its
    /// output. Fails if the interpreter reports anything on its error stream
    /// during the startup window; any banner on standard output is dropped.
    pub async fn create(config: SessionConfig) -> Result<Self, SessionError> {
        let mut child = Command::new(&config.program)
            .args(config.interpreter_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SessionError::MissingPipe { stream: "stderr" })?;

        let mut stdout = StreamDrain::spawn("stdout", stdout, config.channel_capacity);
        let mut stderr = StreamDrain::spawn_flushing_partial(
            "stderr",
            stderr,
            config.channel_capacity,
            config.partial_line_flush(),
        );

        let startup_grace = config.startup_grace();
        if !startup_grace.is_zero() {
            tokio::time::sleep(startup_grace).await;
        }

        let startup_errors = stderr.pop_available();
        if !startup_errors.is_empty() {
            if let Err(err) = child.start_kill() {
                debug!("failed to kill interpreter after startup failure: {err}");
            }
            return Err(SessionError::StartupFailure {
                stderr: startup_errors.join("\n"),
            });
        }

        let banner = stdout.pop_available();
        if !banner.is_empty() {
            debug!("discarded {} banner line(s) from {}", banner.len(), config.program);
        }

        debug!(
            "started interpreter {} (pid {:?})",
            config.program,
            child.id()
        );

        Ok(Self {
            config,
            owner: StdMutex::new(None),
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            io: Mutex::new(SessionIo {
                stdout,
                stderr,
                command: None,
            }),
            child: Mutex::new(child),
        })
    }

    /// Same as [`create`](Self::create) with `profile` loaded at startup.
    pub async fn with_profile(
        config: SessionConfig,
        profile: impl Into<PathBuf>,
    ) -> Result<Self, SessionError> {
        Self::create(SessionConfig {
            profile: Some(profile.into()),
            ..config
        })
        .await
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Takes the session for `caller_id` if nobody holds it. Never waits;
    /// callers that lose must retry on their own schedule.
    pub fn try_lock(&self, caller_id: &str) -> bool {
        let mut owner = self.owner_slot();
        if owner.is_some() {
            return false;
        }
        *owner = Some(caller_id.to_string());
        trace!("session locked for {caller_id}");
        true
    }

    pub fn is_locked(&self) -> bool {
        self.owner_slot().is_some()
    }

    pub fn lock_holder(&self) -> Option<String> {
        self.owner_slot().clone()
    }

    /// Releases the session. Only the holder may do this; unlocking a free
    /// session is a no-op.
    pub fn unlock(&self, caller_id: &str) -> Result<(), SessionError> {
        let mut owner = self.owner_slot();
        if owner.is_none() {
            return Ok(());
        }
        if owner.as_deref() != Some(caller_id) {
            return Err(SessionError::NotLockHolder {
                caller: caller_id.to_string(),
                holder: owner.clone(),
            });
        }
        *owner = None;
        trace!("session unlocked by {caller_id}");
        Ok(())
    }

    /// Releases the session whoever holds it.
    pub fn force_unlock(&self) {
        if let Some(previous) = self.owner_slot().take() {
            debug!("session forcibly unlocked, was held by {previous}");
        }
    }

    /// Writes `command` and a line break to the interpreter and makes it the
    /// current command. The command text has to print the sentinel line
    /// itself once it is done.
    pub async fn submit(&self, caller_id: &str, command: impl Into<String>) -> Status {
        if let Err(holder) = self.check_owner(caller_id) {
            warn!("shell called by {caller_id}, but locked for {holder:?}");
            return Status::CallerMismatch;
        }

        let command = command.into();
        let mut stdin = self.stdin.lock().await;
        // The lock may have changed hands while waiting for the input guard.
        if let Err(holder) = self.check_owner(caller_id) {
            warn!("shell called by {caller_id}, but handed over to {holder:?}");
            return Status::CallerMismatch;
        }
        debug!("caller {caller_id} submitting command:\n{command}");

        let mut state = self.io.lock().await;
        state.settle_previous();
        let stderr_mark = state.stderr.bytes_read();
        let written = match stdin.as_mut() {
            Some(writer) => write_line(writer, &command).await,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interpreter input already closed",
            )),
        };

        let mut request = CommandRequest::new(command).with_stderr_mark(stderr_mark);
        let status = match written {
            Ok(()) => Status::Running,
            Err(err) => {
                error!("caller {caller_id} failed to write command to interpreter stdin: {err}");
                request.set_status(Status::StdinClosed)
            }
        };
        state.command = Some(request);
        status
    }

    /// Moves whatever the interpreter has printed since the last poll into the
    /// current command and reports where the command stands.
    pub async fn poll(&self, caller_id: &str) -> Status {
        if let Err(holder) = self.check_owner(caller_id) {
            warn!("shell polled by {caller_id}, but locked for {holder:?}");
            return Status::CallerMismatch;
        }

        let mut io = self.io.lock().await;
        let SessionIo {
            stdout,
            stderr,
            command,
        } = &mut *io;
        let Some(command) = command.as_mut() else {
            debug!("caller {caller_id} polled before submitting a command");
            return Status::Running;
        };

        match command.status() {
            status @ (Status::Success | Status::StdinClosed) => status,
            _ => completion::resolve(command, stdout, stderr, self.config.stderr_grace()).await,
        }
    }

    /// The current command's output in the line-and-tab diagnostic layout.
    pub async fn read_output(&self, caller_id: &str) -> Result<String, SessionError> {
        let output = format_lines(&self.output_lines(caller_id).await?);
        trace!("caller {caller_id} found shell with output: {output}");
        Ok(output)
    }

    /// The current command's error output in the line-and-tab diagnostic layout.
    pub async fn read_error_output(&self, caller_id: &str) -> Result<String, SessionError> {
        let output = format_lines(&self.error_lines(caller_id).await?);
        trace!("caller {caller_id} found shell with error output: {output}");
        Ok(output)
    }

    pub async fn output_lines(&self, caller_id: &str) -> Result<Vec<String>, SessionError> {
        self.current_lines(caller_id, CommandRequest::output).await
    }

    pub async fn error_lines(&self, caller_id: &str) -> Result<Vec<String>, SessionError> {
        self.current_lines(caller_id, CommandRequest::errors).await
    }

    pub async fn has_exited(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(Some(_)))
    }

    /// Asks the interpreter to exit, closes its input, stops both drains and
    /// kills the process. Refused while a caller still holds the session or
    /// another operation is running. Closing twice is harmless.
    pub async fn close(&self) -> Result<(), SessionError> {
        if let Some(holder) = self.lock_holder() {
            return Err(SessionError::Locked { holder });
        }
        let Ok(mut stdin) = self.stdin.try_lock() else {
            return Err(SessionError::Busy);
        };
        let Ok(io) = self.io.try_lock() else {
            return Err(SessionError::Busy);
        };

        if let Some(mut writer) = stdin.take() {
            let exit = format!("{}\n", self.config.exit_instruction);
            if let Err(err) = write_all_and_flush(&mut writer, exit.as_bytes()).await {
                debug!("failed to send exit instruction: {err}");
            }
            if let Err(err) = writer.shutdown().await {
                debug!("failed to close interpreter stdin: {err}");
            }
        }

        io.stdout.interrupt();
        io.stderr.interrupt();
        drop(io);
        drop(stdin);

        let mut child = self.child.lock().await;
        if let Err(err) = child.start_kill() {
            debug!("failed to kill interpreter: {err}");
        }
        match timeout(self.config.close_timeout(), child.wait()).await {
            Ok(Ok(status)) => debug!("interpreter exited with {status}"),
            Ok(Err(err)) => warn!("failed to reap interpreter: {err}"),
            Err(_) => warn!(
                "interpreter did not exit within {:?}",
                self.config.close_timeout()
            ),
        }

        Ok(())
    }

    fn owner_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Err` carries the current holder when `caller_id` is not it.
    fn check_owner(&self, caller_id: &str) -> Result<(), Option<String>> {
        let owner = self.owner_slot();
        if owner.as_deref() == Some(caller_id) {
            Ok(())
        } else {
            Err(owner.clone())
        }
    }

    async fn current_lines(
        &self,
        caller_id: &str,
        pick: fn(&CommandRequest) -> &[String],
    ) -> Result<Vec<String>, SessionError> {
        self.check_owner(caller_id)
            .map_err(|holder| SessionError::caller_mismatch(caller_id, holder))?;
        let io = self.io.lock().await;
        Ok(io
            .command
            .as_ref()
            .map(|command| pick(command).to_vec())
            .unwrap_or_default())
    }
}

async fn write_line(writer: &mut BufWriter<ChildStdin>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    write_all_and_flush(writer, b"\n").await
}

async fn write_all_and_flush(writer: &mut BufWriter<ChildStdin>, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
