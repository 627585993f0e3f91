use chub_core::IpcError;
use chub_core::log_ring::LogRing;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bounded host buffer the firmware log ring is drained into.
///
/// Readers block on [`LogSink::wait_for_data`] until a flush appends
/// something. Once the buffer holds more than `capacity` bytes the oldest
/// bytes are discarded.
pub struct LogSink {
    buffer: Mutex<Vec<u8>>,
    ready: Condvar,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves everything pending in `ring` into the buffer.
    pub fn flush_from(&self, ring: &LogRing) -> Result<usize, IpcError> {
        let mut buffer = self.buffer();
        let copied = ring.flush_into(&mut buffer)?;
        if buffer.len() > self.capacity {
            let excess = buffer.len() - self.capacity;
            buffer.drain(..excess);
        }
        if copied > 0 {
            self.ready.notify_all();
        }
        Ok(copied)
    }

    /// Waits up to `timeout` for unread log data.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let buffer = self.buffer();
        let (buffer, _) = self
            .ready
            .wait_timeout_while(buffer, timeout, |b| b.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !buffer.is_empty()
    }

    /// Removes and returns everything buffered.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chub_core::window::SharedWindow;
    use std::sync::Arc;
    use std::thread;

    fn ring(size: usize) -> LogRing {
        let window = SharedWindow::allocate(20 + size);
        let ring = LogRing::new(
            window.slice(0, 20).unwrap(),
            window.slice(20, size).unwrap(),
        );
        ring.init();
        ring
    }

    #[test]
    fn keeps_only_the_newest_bytes() {
        let ring = ring(64);
        let sink = LogSink::new(8);
        ring.produce(b"0123456789");
        assert_eq!(sink.flush_from(&ring).unwrap(), 10);
        assert_eq!(sink.contents(), "23456789");
        assert_eq!(sink.flush_from(&ring).unwrap(), 0);
        assert_eq!(sink.take(), b"23456789");
        assert!(sink.is_empty());
    }

    #[test]
    fn reader_wakes_on_flush() {
        let ring = ring(64);
        let sink = Arc::new(LogSink::new(1024));
        let reader = {
            let sink = sink.clone();
            thread::spawn(move || sink.wait_for_data(Duration::from_secs(5)))
        };
        ring.produce(b"chub: hello\n");
        sink.flush_from(&ring).unwrap();
        assert!(reader.join().unwrap());
        assert_eq!(sink.contents(), "chub: hello\n");
    }

    #[test]
    fn wait_times_out_when_nothing_arrives() {
        let sink = LogSink::new(16);
        assert!(!sink.wait_for_data(Duration::from_millis(10)));
    }
}
