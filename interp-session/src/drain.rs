//! Background line readers for the interpreter's output streams.

use std::io::ErrorKind;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

const READ_CHUNK_SIZE: usize = 4096;

/// Continuously reads one stream and queues its lines for the session.
///
/// The reader task owns the stream for the session's whole lifetime, so the
/// interpreter never stalls on a full pipe while nobody is polling (up to
/// the channel bound). The session pops queued lines without blocking.
///
/// Besides lines, the drain publishes a running count of bytes read, so a
/// caller can tell that the stream produced something before a full line is
/// available.
#[derive(Debug)]
pub struct StreamDrain {
    label: &'static str,
    lines_rx: mpsc::Receiver<String>,
    bytes_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    reader_task: JoinHandle<()>,
}

impl StreamDrain {
    /// Starts draining `reader`. Must be called from within a tokio runtime.
    /// Text after the last line break is queued only once the stream ends.
    pub fn spawn<R>(label: &'static str, reader: R, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::start(label, reader, capacity, None)
    }

    /// Like [`spawn`](Self::spawn), but text that sits without a line break
    /// for `idle` is queued as a line of its own.
    pub fn spawn_flushing_partial<R>(
        label: &'static str,
        reader: R,
        capacity: usize,
        idle: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::start(label, reader, capacity, Some(idle))
    }

    fn start<R>(
        label: &'static str,
        reader: R,
        capacity: usize,
        partial_flush: Option<Duration>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (lines_tx, lines_rx) = mpsc::channel::<String>(capacity.max(1));
        let (bytes_tx, bytes_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let reader_task = tokio::spawn(drain_lines(
            label,
            reader,
            lines_tx,
            bytes_tx,
            partial_flush,
            cancel.clone(),
        ));

        Self {
            label,
            lines_rx,
            bytes_rx,
            cancel,
            reader_task,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Removes every line queued so far, oldest first. Never waits.
    pub fn pop_available(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.lines_rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Waits at most `window` for the next line. Returns `None` on timeout or
    /// once the stream has closed and its queue is empty.
    pub async fn wait_for_line(&mut self, window: Duration) -> Option<String> {
        timeout(window, self.lines_rx.recv()).await.ok().flatten()
    }

    /// Bytes read from the stream so far, including text not yet queued as a
    /// line.
    pub fn bytes_read(&self) -> u64 {
        *self.bytes_rx.borrow()
    }

    /// Waits at most `window` until more than `mark` bytes have been read.
    /// Returns at once if that is already the case.
    pub async fn wait_for_bytes_past(&self, mark: u64, window: Duration) -> bool {
        let mut bytes_rx = self.bytes_rx.clone();
        matches!(
            timeout(window, bytes_rx.wait_for(|total| *total > mark)).await,
            Ok(Ok(_))
        )
    }

    /// Asks the reader task to stop. Lines already queued stay poppable.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    #[cfg(test)]
    pub(crate) async fn wait_until_stopped(&self) {
        while self.is_alive() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Drop for StreamDrain {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain_lines<R>(
    label: &'static str,
    mut reader: R,
    lines_tx: mpsc::Sender<String>,
    bytes_tx: watch::Sender<u64>,
    partial_flush: Option<Duration>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(256);
    loop {
        let flush_partial = partial_flush.is_some() && !pending.is_empty();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => read,
            _ = tokio::time::sleep(partial_flush.unwrap_or_default()), if flush_partial => {
                let line = decode_line(&pending);
                pending.clear();
                if !forward(label, &lines_tx, &cancel, line).await {
                    break;
                }
                continue;
            }
        };

        match read {
            Ok(0) => {
                if !pending.is_empty() {
                    forward(label, &lines_tx, &cancel, decode_line(&pending)).await;
                }
                break;
            }
            Ok(n) => {
                bytes_tx.send_modify(|total| *total += n as u64);
                pending.extend_from_slice(&chunk[..n]);
                if !forward_complete_lines(label, &lines_tx, &cancel, &mut pending).await {
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("{label} drain stopped on read error: {err}");
                break;
            }
        }
    }

    debug!("{label} drain finished");
}

/// Queues every line terminated in `pending` and leaves the rest in place.
async fn forward_complete_lines(
    label: &'static str,
    lines_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    pending: &mut Vec<u8>,
) -> bool {
    while let Some(end) = pending.iter().position(|byte| *byte == b'\n') {
        let line = decode_line(&pending[..=end]);
        pending.drain(..=end);
        if !forward(label, lines_tx, cancel, line).await {
            return false;
        }
    }
    true
}

/// `false` once the drain has to stop.
async fn forward(
    label: &'static str,
    lines_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    line: String,
) -> bool {
    trace!("{label} drained line: {line}");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        // Err means the receiver is gone and the session has been dropped.
        sent = lines_tx.send(line) => sent.is_ok(),
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
