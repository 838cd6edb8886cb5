use std::io;
use std::time::Duration;

use pop3_proto::find_line_end;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Fatal;

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_MAX_BUFFER: usize = 256 * 1024;

/// Buffered, timeout-bounded reader that yields CRLF-delimited command
/// lines from an arbitrary async byte stream.
///
/// Validates the buffer's UTF-8 prefix after every single read, rather
/// than batching raw bytes and decoding them as one unit: this is what
/// guards against splitting a multibyte character across two reads.
/// `str::from_utf8`'s `valid_up_to`/`error_len` distinguish a trailing
/// incomplete sequence (wait for more bytes) from a genuinely invalid one
/// (fatal close) exactly, for any split point, and needs no raw-socket
/// non-blocking probe, so it works the same way for plaintext and
/// TLS-wrapped streams.
pub struct LineReader<S> {
    stream: S,
    buf: Vec<u8>,
    timeout: Duration,
    max_buffer: usize,
    chunk_size: usize,
}

impl<S: AsyncRead + Unpin> LineReader<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        LineReader {
            stream,
            buf: Vec::new(),
            timeout,
            max_buffer: DEFAULT_MAX_BUFFER,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Returns the next complete line with its terminator stripped, `None`
    /// on a clean EOF with no partial line pending, or `Err` on a fatal
    /// condition: idle timeout, I/O failure, invalid UTF-8, or a buffer
    /// that grew past `max_buffer` without yielding a complete line.
    pub async fn next_line(&mut self) -> Result<Option<String>, Fatal> {
        loop {
            if let Some((content_end, consumed_end)) = self.find_line_end()? {
                let line = String::from_utf8(self.buf[..content_end].to_vec())
                    .expect("prefix was already validated as UTF-8");
                self.buf.drain(..consumed_end);
                return Ok(Some(line));
            }

            if self.buf.len() > self.max_buffer {
                return Err(Fatal::BufferOverflow);
            }

            let mut chunk = vec![0u8; self.chunk_size];
            let read = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| Fatal::Io(io::Error::new(io::ErrorKind::TimedOut, "client idle timeout elapsed")))?
                .map_err(Fatal::Io)?;

            if read == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..read]);

            if self.buf.len() > self.max_buffer {
                return Err(Fatal::BufferOverflow);
            }
        }
    }

    /// Looks for a line terminator within the longest valid-UTF-8 prefix
    /// of `buf`. A trailing incomplete multibyte sequence is left alone
    /// (it may still become valid once more bytes arrive), but any other
    /// invalid sequence is fatal.
    fn find_line_end(&self) -> Result<Option<(usize, usize)>, Fatal> {
        match std::str::from_utf8(&self.buf) {
            Ok(s) => Ok(find_line_end(s)),
            Err(e) => match e.error_len() {
                None => {
                    let prefix = std::str::from_utf8(&self.buf[..e.valid_up_to()])
                        .expect("valid_up_to bounds a validated prefix");
                    Ok(find_line_end(prefix))
                }
                Some(_) => Err(Fatal::InvalidUtf8),
            },
        }
    }
}
