//! IO adapters for the collection pipeline.

use std::io::{self, Read};

use crate::cancel::CancelToken;

/// Wraps a reader so that every read first observes a [`CancelToken`].
///
/// Once the token fires the next read returns an error carrying the cancel
/// reason, which terminates any in-flight `io::copy` promptly even when the
/// underlying reader would keep producing data.
pub struct CancelReader<R> {
    inner: R,
    token: CancelToken,
}

impl<R: Read> CancelReader<R> {
    /// Wrap `inner` with cancellation checks against `token`.
    pub fn new(token: CancelToken, inner: R) -> Self {
        Self { inner, token }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(reason) = self.token.err() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, reason));
        }
        self.inner.read(buf)
    }
}
