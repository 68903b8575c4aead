//! Line-oriented query/response exchange on a suspended transport.
//!
//! While the telemetry receive task is parked, the controller, the axis
//! identifier and discovery talk to the device directly: write `M=?`, then
//! read lines until one carries `M=` (optionally `A:M=`) or the deadline
//! passes. Telemetry lines that arrive in between are skipped.

use stage_core::error::{AppResult, StageError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Default bound on one query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before re-polling a reader that returned no data.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Format a command line: `[A:]text\n`.
pub fn frame_command(text: &str, letter: Option<char>) -> String {
    match letter {
        Some(l) => format!("{}:{}\n", l, text),
        None => format!("{}\n", text),
    }
}

/// Find the payload of `mnemonic` in a reply line.
///
/// Accepts `M=v` and `A:M=v` for any letter. Returns the raw payload text.
pub fn reply_payload<'a>(line: &'a str, mnemonic: &str) -> Option<&'a str> {
    line.split_whitespace().find_map(|token| {
        let (lhs, rhs) = token.split_once('=')?;
        let key = lhs.split_once(':').map_or(lhs, |(_, k)| k);
        key.eq_ignore_ascii_case(mnemonic).then_some(rhs)
    })
}

/// Borrowed reader/writer pair for query/response exchanges.
pub struct QueryLink<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    timeout: Duration,
    poll_interval: Duration,
    transcript: Vec<String>,
}

impl<'a, R, W> QueryLink<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Link over an exclusively borrowed transport.
    pub fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Self {
            reader,
            writer,
            timeout: DEFAULT_QUERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            transcript: Vec::new(),
        }
    }

    /// Override the per-query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the re-poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Every non-empty line read so far.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Write `[A:]text\n` and flush.
    pub async fn send(&mut self, text: &str, letter: Option<char>) -> AppResult<()> {
        let line = frame_command(text, letter);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read lines until quiet for `window`, recording them in the transcript.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let mut drained = 0;
        while let Some(line) = self.read_line_until(Instant::now() + window).await {
            self.transcript.push(line);
            drained += 1;
        }
        drained
    }

    /// Query `mnemonic` and return the raw payload text.
    pub async fn query_raw(&mut self, mnemonic: &str, letter: Option<char>) -> AppResult<String> {
        self.send(&format!("{}=?", mnemonic), letter).await?;
        let deadline = Instant::now() + self.timeout;
        while let Some(line) = self.read_line_until(deadline).await {
            let payload = reply_payload(&line, mnemonic).map(str::to_string);
            self.transcript.push(line);
            if let Some(payload) = payload {
                return Ok(payload);
            }
        }
        Err(StageError::Timeout(format!(
            "no reply to {}=? within {:?}",
            mnemonic, self.timeout
        )))
    }

    /// Query `mnemonic` and parse the payload as a number.
    pub async fn query(&mut self, mnemonic: &str, letter: Option<char>) -> AppResult<f64> {
        let payload = self.query_raw(mnemonic, letter).await?;
        payload.trim().parse::<f64>().map_err(|_| {
            StageError::Protocol(format!("{} reply '{}' is not a number", mnemonic, payload))
        })
    }

    /// Next non-empty line before `deadline`, or `None` on timeout.
    async fn read_line_until(&mut self, deadline: Instant) -> Option<String> {
        let mut buf = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.reader.read_until(b'\n', &mut buf)).await
            {
                Err(_) => return None,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "read error during query");
                    return None;
                }
                // EOF or nothing yet: poll again until the deadline
                Ok(Ok(0)) => {
                    if Instant::now() + self.poll_interval >= deadline {
                        return None;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(Ok(_)) => {
                    if buf.last() != Some(&b'\n') {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    buf.clear();
                    if !line.is_empty() {
                        return Some(line);
                    }
                }
            }
        }
    }
}
