//! Line-oriented transport shared by the protocol sessions.

use std::io;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tracing::{trace, warn};

use crate::error::{MailError, Result};

/// Longest command line accepted, terminator included.
pub const MAX_COMMAND_LINE: usize = 1000;

enum Line {
    Complete(Vec<u8>),
    TooLong,
    Eof,
}

/// Read through the next `\n`, keeping at most `limit` bytes.
///
/// An overlong line is still consumed up to its terminator so the next
/// read starts on a fresh line.
async fn read_capped<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> io::Result<Line> {
    let mut buf = Vec::new();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, buf.is_empty()) {
                (true, _) => Line::TooLong,
                (false, true) => Line::Eof,
                (false, false) => Line::Complete(buf),
            });
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if !overflow {
            buf.extend_from_slice(&available[..used]);
            if buf.len() > limit {
                overflow = true;
                buf = Vec::new();
            }
        }
        reader.consume(used);
        if done {
            return Ok(if overflow { Line::TooLong } else { Line::Complete(buf) });
        }
    }
}

/// A CRLF line transport with an idle deadline on every read and write.
///
/// Send failures are recorded rather than returned; sessions check
/// [`LineConnection::send_error`] once per loop iteration.
pub struct LineConnection<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    idle_timeout: Duration,
    send_error: Option<io::Error>,
}

impl<R, W> LineConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, idle_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            idle_timeout,
            send_error: None,
        }
    }

    /// Read one command line including its terminator.
    ///
    /// Returns `Ok(None)` at end of stream, [`MailError::IdleTimeout`] when
    /// the peer stays silent past the deadline.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_line_max(MAX_COMMAND_LINE).await
    }

    /// Read one line of at most `limit` bytes.
    ///
    /// A longer line is discarded and reported as
    /// [`MailError::ProtocolSyntax`]; the connection stays usable.
    pub async fn read_line_max(&mut self, limit: usize) -> Result<Option<Vec<u8>>> {
        let line = tokio::time::timeout(self.idle_timeout, read_capped(&mut self.reader, limit))
            .await
            .map_err(|_| MailError::IdleTimeout(self.idle_timeout.as_secs()))?
            .map_err(MailError::Transport)?;
        match line {
            Line::Complete(buf) => {
                trace!(line = %String::from_utf8_lossy(&buf).trim_end(), "<<");
                Ok(Some(buf))
            }
            Line::TooLong => {
                warn!(limit, "Discarded overlong line");
                Err(MailError::ProtocolSyntax("Line too long".into()))
            }
            Line::Eof => Ok(None),
        }
    }

    /// Send one line, appending CRLF.
    pub async fn send(&mut self, line: impl AsRef<[u8]>) {
        self.send_lines(std::iter::once(line)).await;
    }

    /// Send several lines with a single flush.
    pub async fn send_lines<I>(&mut self, lines: I)
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        if self.send_error.is_some() {
            return;
        }
        let deadline = self.idle_timeout;
        let result = tokio::time::timeout(deadline, async {
            for line in lines {
                let line = line.as_ref();
                self.writer.write_all(line).await?;
                self.writer.write_all(b"\r\n").await?;
                trace!(line = %String::from_utf8_lossy(line), ">>");
            }
            self.writer.flush().await
        })
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")));

        if let Err(e) = result {
            warn!(error = %e, "Failed to send");
            self.send_error = Some(e);
        }
    }

    /// The first send failure, if any.
    pub fn send_error(&self) -> Option<&io::Error> {
        self.send_error.as_ref()
    }
}
