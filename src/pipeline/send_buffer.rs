//! Ordered async-writer queue
//!
//! A FIFO of `(bytes, completion callback)` sitting in front of a
//! single async writer. The owning task drives it with
//! [`SendBuffer::begin_write`] / [`SendBuffer::complete_write`], which
//! keeps at most one write in flight and delivers callbacks in enqueue
//! order. While the carrier is not yet connected, pushes accumulate
//! without dispatching.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;

/// Completion callback for one queued write
pub type SentCallback = Box<dyn FnOnce(io::Result<()>) + Send>;

struct Entry {
    data: Bytes,
    callback: Option<SentCallback>,
}

/// Single-producer write queue with connected/disconnected states
#[derive(Default)]
pub struct SendBuffer {
    queue: VecDeque<Entry>,
    connected: bool,
    in_flight: bool,
    failed: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the underlying writer usable; queued entries become
    /// eligible for dispatch.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Append bytes with a completion callback.
    ///
    /// After a writer error the entry is still accepted but will never
    /// be dispatched.
    pub fn push_data(&mut self, data: Bytes, callback: SentCallback) {
        self.queue.push_back(Entry {
            data,
            callback: Some(callback),
        });
    }

    /// Insert bytes at the head of the queue with no callback.
    ///
    /// Used to prepend the authentication prefix ahead of any payload
    /// already queued. Never reorders past a write already in flight.
    pub fn insert_data(&mut self, data: Bytes) {
        let entry = Entry {
            data,
            callback: None,
        };
        if self.in_flight {
            self.queue.insert(1, entry);
        } else {
            self.queue.push_front(entry);
        }
    }

    /// Claim the next write, if one may start.
    ///
    /// Returns `None` while disconnected, while a write is in flight,
    /// after a writer error, or when the queue is empty. A returned
    /// value must be answered with [`SendBuffer::complete_write`].
    pub fn begin_write(&mut self) -> Option<Bytes> {
        if !self.connected || self.in_flight || self.failed {
            return None;
        }
        let data = self.queue.front()?.data.clone();
        self.in_flight = true;
        Some(data)
    }

    /// Report the outcome of the in-flight write.
    ///
    /// The head callback fires with the result. On error the remaining
    /// queue is drained, each callback receiving a broken-pipe error,
    /// and no further writes will start.
    pub fn complete_write(&mut self, result: io::Result<()>) {
        debug_assert!(self.in_flight);
        self.in_flight = false;

        let head = self.queue.pop_front();
        match result {
            Ok(()) => {
                if let Some(callback) = head.and_then(|e| e.callback) {
                    callback(Ok(()));
                }
            }
            Err(error) => {
                self.failed = true;
                let kind = error.kind();
                if let Some(callback) = head.and_then(|e| e.callback) {
                    callback(Err(error));
                }
                for entry in self.queue.drain(..) {
                    if let Some(callback) = entry.callback {
                        callback(Err(io::Error::from(kind)));
                    }
                }
            }
        }
    }

    /// Whether a later `begin_write` could yield data
    pub fn has_pending(&self) -> bool {
        !self.failed && !self.queue.is_empty()
    }

    /// Whether the writer has reported an error
    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<(usize, bool)>>>, id: usize) -> SentCallback {
        let log = Arc::clone(log);
        Box::new(move |result| log.lock().unwrap().push((id, result.is_ok())))
    }

    #[test]
    fn test_fifo_callback_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut buffer = SendBuffer::new();
        buffer.set_connected(true);

        for id in 0..4 {
            buffer.push_data(Bytes::from(vec![id as u8]), recorder(&log, id));
        }

        while let Some(_data) = buffer.begin_write() {
            buffer.complete_write(Ok(()));
        }

        let fired: Vec<usize> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(fired, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_not_connected_accumulates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut buffer = SendBuffer::new();

        buffer.push_data(Bytes::from_static(b"a"), recorder(&log, 0));
        assert!(buffer.begin_write().is_none());
        assert!(log.lock().unwrap().is_empty());

        buffer.set_connected(true);
        assert_eq!(buffer.begin_write().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_insert_data_fires_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut buffer = SendBuffer::new();

        buffer.push_data(Bytes::from_static(b"payload"), recorder(&log, 1));
        buffer.insert_data(Bytes::from_static(b"prefix"));
        buffer.set_connected(true);

        assert_eq!(buffer.begin_write().unwrap(), Bytes::from_static(b"prefix"));
        buffer.complete_write(Ok(()));
        assert_eq!(buffer.begin_write().unwrap(), Bytes::from_static(b"payload"));
        buffer.complete_write(Ok(()));

        assert_eq!(*log.lock().unwrap(), vec![(1, true)]);
    }

    #[test]
    fn test_single_write_in_flight() {
        let mut buffer = SendBuffer::new();
        buffer.set_connected(true);
        buffer.push_data(Bytes::from_static(b"a"), Box::new(|_| {}));
        buffer.push_data(Bytes::from_static(b"b"), Box::new(|_| {}));

        assert!(buffer.begin_write().is_some());
        assert!(buffer.begin_write().is_none());
        buffer.complete_write(Ok(()));
        assert_eq!(buffer.begin_write().unwrap(), Bytes::from_static(b"b"));
    }

    #[test]
    fn test_error_drains_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut buffer = SendBuffer::new();
        buffer.set_connected(true);

        for id in 0..3 {
            buffer.push_data(Bytes::from(vec![id as u8]), recorder(&log, id));
        }

        buffer.begin_write().unwrap();
        buffer.complete_write(Err(io::Error::from(io::ErrorKind::BrokenPipe)));

        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, false), (1, false), (2, false)]
        );
        assert!(buffer.is_failed());

        // Pushes after the error are accepted but never dispatched
        buffer.push_data(Bytes::from_static(b"late"), recorder(&log, 9));
        assert!(buffer.begin_write().is_none());
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
