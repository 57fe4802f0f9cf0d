// AT Link
// Serialized command/response round trips over an async serial stream

use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout_at;
use tracing::{debug, trace};

use crate::transport::modem::at::{
    classify, AtLine, AtResponse, FinalResult, LineKind, LineTokenizer, Urc,
};
use crate::transport::TransportError;

const READ_CHUNK: usize = 256;

/// One serial port speaking the AT protocol
///
/// Callers hold the link behind a mutex, so at most one command is outstanding.
/// Unsolicited lines seen at any time are parked for the dispatcher.
pub struct AtLink<S> {
    io: S,
    tokenizer: LineTokenizer,
    unsolicited: Vec<Urc>,
    last_activity: Instant,
}

impl<S> AtLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            tokenizer: LineTokenizer::new(),
            unsolicited: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Drain the unsolicited codes collected so far
    pub fn take_unsolicited(&mut self) -> Vec<Urc> {
        std::mem::take(&mut self.unsolicited)
    }

    /// Send `command` and collect lines until a terminal result or the deadline
    pub async fn command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<AtResponse, TransportError> {
        self.park_stale_lines();
        self.write_line(command).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = Vec::new();
        match self.collect(command, &mut lines, deadline, false).await? {
            Some(Collected::Final(result)) => Ok(AtResponse {
                command: command.to_string(),
                lines,
                result,
            }),
            _ => Err(timeout_error(command, timeout)),
        }
    }

    /// Two-phase command: wait for the `> ` prompt, write `payload`, then await the result
    pub async fn command_with_payload(
        &mut self,
        command: &str,
        payload: &[u8],
        terminator: Option<u8>,
        timeout: Duration,
    ) -> Result<AtResponse, TransportError> {
        self.park_stale_lines();
        self.write_line(command).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = Vec::new();

        match self.collect(command, &mut lines, deadline, true).await? {
            Some(Collected::Prompt) => {}
            Some(Collected::Final(result)) => {
                // Rejected before the prompt
                return Ok(AtResponse {
                    command: command.to_string(),
                    lines,
                    result,
                });
            }
            None => return Err(timeout_error(command, timeout)),
        }

        self.io.write_all(payload).await?;
        if let Some(byte) = terminator {
            self.io.write_all(&[byte]).await?;
        }
        self.io.flush().await?;
        trace!(command, len = payload.len(), "payload written");

        match self.collect(command, &mut lines, deadline, false).await? {
            Some(Collected::Final(result)) => Ok(AtResponse {
                command: command.to_string(),
                lines,
                result,
            }),
            _ => Err(timeout_error(command, timeout)),
        }
    }

    /// Read whatever arrives within `window` and park any unsolicited codes
    pub async fn poll_unsolicited(&mut self, window: Duration) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + window;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match timeout_at(deadline, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(TransportError::Io("serial link closed".to_string())),
                Ok(Ok(n)) => {
                    self.tokenizer.feed(&buf[..n]);
                    self.last_activity = Instant::now();
                    self.park_stale_lines();
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        trace!(command, "-> modem");
        self.io.write_all(format!("{}\r\n", command).as_bytes()).await?;
        self.io.flush().await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Classify lines already buffered with no command outstanding
    fn park_stale_lines(&mut self) {
        while let Some(token) = self.tokenizer.next_line() {
            match token {
                AtLine::Text(line) => match classify(&line, None) {
                    LineKind::Unsolicited(urc) => {
                        debug!(?urc, "unsolicited result code");
                        self.unsolicited.push(urc);
                    }
                    _ => trace!(line = %line, "discarding stray line"),
                },
                AtLine::Final(result) => trace!(?result, "discarding stray result"),
                AtLine::Prompt => trace!("discarding stray prompt"),
            }
        }
    }

    async fn collect(
        &mut self,
        command: &str,
        lines: &mut Vec<String>,
        deadline: tokio::time::Instant,
        want_prompt: bool,
    ) -> Result<Option<Collected>, TransportError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            while let Some(token) = self.tokenizer.next_line() {
                match token {
                    AtLine::Final(result) => {
                        trace!(command, ?result, "<- modem");
                        return Ok(Some(Collected::Final(result)));
                    }
                    AtLine::Prompt if want_prompt => return Ok(Some(Collected::Prompt)),
                    AtLine::Prompt => trace!(command, "unexpected prompt"),
                    AtLine::Text(line) => match classify(&line, Some(command)) {
                        LineKind::Echo => {}
                        LineKind::Response => {
                            trace!(command, line = %line, "<- modem");
                            lines.push(line);
                        }
                        LineKind::Unsolicited(urc) => {
                            debug!(command, ?urc, "unsolicited result code during command");
                            self.unsolicited.push(urc);
                        }
                    },
                }
            }

            match timeout_at(deadline, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(TransportError::Io("serial link closed".to_string())),
                Ok(Ok(n)) => {
                    self.tokenizer.feed(&buf[..n]);
                    self.last_activity = Instant::now();
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    // Leftovers of a timed-out command must not leak into the next one
                    self.tokenizer.clear();
                    return Ok(None);
                }
            }
        }
    }
}

enum Collected {
    Final(FinalResult),
    Prompt,
}

fn timeout_error(command: &str, timeout: Duration) -> TransportError {
    debug!(command, timeout_ms = timeout.as_millis() as u64, "command timed out");
    TransportError::CommandTimeout {
        command: command.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}
