//! Append-only in-memory byte buffer with multiple concurrent subscribers,
//! each tracking their own read offset.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by buffer writes and subscriber reads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputError {
    /// Returned by [`Buffer::write`] when the buffer has already been closed.
    #[error("write to closed buffer")]
    Closed,

    /// Returned by [`Subscriber::read`] when the subscriber was closed.
    #[error("subscriber closed")]
    Cancelled,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<u8>,
    closed: bool,
}

/// Append-only, thread-safe byte buffer. The writer side is synchronous so it
/// can be fed from a blocking pipe pump; readers are async. Subscribers
/// created via [`Buffer::subscribe`] each maintain an independent offset and
/// wait until new data is available or the buffer is closed.
///
/// Wakeups ride on a version counter in a `watch` channel: every write and
/// the close bump it, and a blocked reader marks the version seen before
/// re-checking the buffer, so a bump between the check and the await is never
/// lost.
#[derive(Debug)]
pub struct Buffer {
    inner: Mutex<Inner>,
    version: watch::Sender<u64>,
}

impl Buffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                closed: false,
            }),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The lock is only held for memcpy-sized critical sections; a poisoned
        // lock means a panic mid-copy, and the buffer contents are still valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends bytes to the buffer, then wakes all waiting subscribers.
    /// Returns the number of bytes appended, which is always the full input
    /// on success.
    pub fn write(&self, data: &[u8]) -> Result<usize, OutputError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(OutputError::Closed);
            }
            inner.buf.extend_from_slice(data);
        }
        self.version.send_modify(|v| *v += 1);
        Ok(data.len())
    }

    /// Marks the buffer as complete. Idempotent. Subscriber reads that have
    /// consumed all data will return 0 (EOF) afterwards.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
        }
        self.version.send_modify(|v| *v += 1);
    }

    /// Returns a new subscriber whose next read begins at byte 0. May be
    /// called before, during, or after writes and close.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        Subscriber {
            buffer: Arc::clone(self),
            offset: 0,
            version: self.version.subscribe(),
            done: CancellationToken::new(),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A read endpoint on a [`Buffer`] with its own monotonic offset.
#[derive(Debug)]
pub struct Subscriber {
    buffer: Arc<Buffer>,
    offset: usize,
    version: watch::Receiver<u64>,
    done: CancellationToken,
}

impl Subscriber {
    /// Copies available bytes at the subscriber's offset into `dst`, waiting
    /// until data arrives. Returns 0 once the buffer is closed and everything
    /// has been consumed, and [`OutputError::Cancelled`] once the subscriber
    /// is closed.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, OutputError> {
        loop {
            // Mark the current version seen before inspecting the buffer, so
            // a write landing after the inspection makes `changed` fire.
            self.version.borrow_and_update();
            {
                let inner = self.buffer.lock();
                if self.offset < inner.buf.len() {
                    let n = dst.len().min(inner.buf.len() - self.offset);
                    dst[..n].copy_from_slice(&inner.buf[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }
                if inner.closed {
                    return Ok(0);
                }
            }
            tokio::select! {
                _ = self.done.cancelled() => return Err(OutputError::Cancelled),
                changed = self.version.changed() => {
                    if changed.is_err() {
                        // The buffer owns the sender and we hold the buffer,
                        // so this cannot happen; treat it as EOF regardless.
                        return Ok(0);
                    }
                }
            }
        }
    }

    /// Signals the subscriber to stop reading. Any blocked [`read`] returns
    /// [`OutputError::Cancelled`]. Idempotent; other subscribers of the same
    /// buffer are unaffected.
    ///
    /// [`read`]: Subscriber::read
    pub fn close(&self) {
        self.done.cancel();
    }

    /// Token cancelled when the subscriber is closed. Callers can link an
    /// external cancellation source (e.g. a dropped RPC) to [`close`].
    ///
    /// [`close`]: Subscriber::close
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.done
    }
}
