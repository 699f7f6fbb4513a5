//! Duplex transport - streams input into a child while draining its output
//!
//! A child that both consumes and produces a lot of data over pipes can
//! deadlock a parent that writes all of its input before reading anything:
//! the child blocks on a full stdout pipe and stops reading stdin, and the
//! parent blocks on a full stdin pipe. [`pump`] avoids this by multiplexing
//! both directions in a single `select!` loop on one task, writing bounded
//! chunks and reading whatever is available on every iteration.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Largest slice of input handed to a single write call
pub const DEFAULT_CHUNK_SIZE: usize = 65535;

/// Upper bound on a single readiness wait before the loop iterates again
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

// ============================================================================
// Errors and Options
// ============================================================================

/// Error types for the duplex pump
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "Transfer did not finish within {deadline:?} ({stalls} stalled waits, {bytes_written} bytes written)"
    )]
    Timeout {
        deadline: Duration,
        stalls: u32,
        bytes_written: usize,
    },

    #[error("Transfer cancelled after {bytes_written} bytes written")]
    Cancelled { bytes_written: usize },
}

/// Tuning knobs for a single pump run
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Maximum bytes per write and per read
    pub chunk_size: usize,

    /// Bound on each readiness wait; an elapsed wait is a stall, not an error
    pub poll_interval: Duration,

    /// Optional wall-clock limit for the whole transfer
    pub deadline: Option<Duration>,

    /// Cooperative cancellation for the whole transfer
    pub cancel: CancellationToken,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpOutcome {
    /// Everything read from the output channel, in arrival order
    pub output: Vec<u8>,

    /// Input bytes accepted by the input channel
    pub bytes_written: usize,

    /// Readiness waits that elapsed with nothing ready
    pub stalls: u32,
}

/// What woke the loop up
enum Step {
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
    Cancelled,
}

// ============================================================================
// Pump
// ============================================================================

/// Deliver `input` to `stdin` while collecting `stdout` until it reaches EOF
///
/// `stdin` is shut down and dropped exactly once, as soon as every input
/// byte has been accepted (immediately for empty input). If the reader side
/// of `stdin` goes away early the remaining input is abandoned, but `stdout`
/// is still drained to EOF so no output is lost.
pub async fn pump<W, R>(
    mut stdin: Option<W>,
    mut stdout: R,
    input: &[u8],
    options: &PumpOptions,
) -> Result<PumpOutcome, TransportError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let chunk_size = options.chunk_size.max(1);
    let mut read_buffer = vec![0u8; chunk_size];
    let mut output = Vec::new();
    let mut cursor = 0usize;
    let mut stalls = 0u32;

    trace!(
        "DuplexPump: starting transfer (input: {} bytes, chunk: {})",
        input.len(),
        chunk_size
    );

    loop {
        if cursor == input.len() {
            close_input(&mut stdin).await;
        }

        let wait = match options.deadline {
            Some(deadline) => {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(TransportError::Timeout {
                        deadline,
                        stalls,
                        bytes_written: cursor,
                    });
                }
                options.poll_interval.min(deadline - elapsed)
            }
            None => options.poll_interval,
        };

        let pending = &input[cursor..];
        let chunk = &pending[..pending.len().min(chunk_size)];

        let step = tokio::time::timeout(wait, async {
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => Step::Cancelled,
                result = stdout.read(&mut read_buffer) => Step::Read(result),
                result = write_chunk(stdin.as_mut(), chunk) => Step::Wrote(result),
            }
        })
        .await;

        let Ok(step) = step else {
            stalls += 1;
            warn!(
                "DuplexPump: nothing ready after {:?} (stall #{}, {}/{} bytes written)",
                wait,
                stalls,
                cursor,
                input.len()
            );
            continue;
        };

        match step {
            Step::Cancelled => {
                debug!("DuplexPump: cancelled after {} bytes written", cursor);
                return Err(TransportError::Cancelled {
                    bytes_written: cursor,
                });
            }
            Step::Read(Ok(0)) => {
                trace!("DuplexPump: output EOF reached");
                break;
            }
            Step::Read(Ok(n)) => {
                trace!("DuplexPump: read {} bytes", n);
                output.extend_from_slice(&read_buffer[..n]);
            }
            Step::Read(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Step::Read(Err(e)) => return Err(e.into()),
            Step::Wrote(Ok(0)) => {
                debug!(
                    "DuplexPump: input channel accepted nothing, abandoning {} bytes",
                    input.len() - cursor
                );
                close_input(&mut stdin).await;
            }
            Step::Wrote(Ok(n)) => {
                cursor += n;
                trace!("DuplexPump: wrote {} bytes ({}/{})", n, cursor, input.len());
            }
            Step::Wrote(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(
                    "DuplexPump: input channel closed by peer, abandoning {} bytes",
                    input.len() - cursor
                );
                close_input(&mut stdin).await;
            }
            Step::Wrote(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Step::Wrote(Err(e)) => return Err(e.into()),
        }
    }

    // Output ended before the child took all of its input
    if stdin.take().is_some() {
        debug!(
            "DuplexPump: output closed with {} input bytes undelivered",
            input.len() - cursor
        );
    }

    Ok(PumpOutcome {
        output,
        bytes_written: cursor,
        stalls,
    })
}

/// Write one chunk, or never resolve when there is nothing left to write
async fn write_chunk<W>(stdin: Option<&mut W>, chunk: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    match stdin {
        Some(writer) if !chunk.is_empty() => writer.write(chunk).await,
        _ => std::future::pending().await,
    }
}

/// Shut down and drop the input channel if it is still open
async fn close_input<W>(stdin: &mut Option<W>)
where
    W: AsyncWrite + Unpin,
{
    if let Some(mut writer) = stdin.take() {
        if let Err(e) = writer.shutdown().await {
            debug!("DuplexPump: failed to shut down input channel: {}", e);
        }
        trace!("DuplexPump: input channel closed");
    }
}

// ============================================================================
// Tests
// ============================================================================
