//! Device log ring.
//!
//! The device appends bytes at `write`, the host drains from `read`. The
//! host trusts neither index: both are checked against the size the host
//! resolved from the memory map, never against the `size` word the device
//! could have scribbled over.

use crate::IpcError;
use crate::window::SharedWindow;
use alloc::vec::Vec;

mod header {
    pub const WRITE: usize = 0;
    pub const READ: usize = 4;
    pub const SIZE: usize = 8;
    pub const TOKEN: usize = 12;
    pub const FULL: usize = 16;
}

pub struct LogRing {
    /// Header words.
    header: SharedWindow,
    /// Byte area.
    bytes: SharedWindow,
    size: u32,
}

impl LogRing {
    pub fn new(header: SharedWindow, bytes: SharedWindow) -> Self {
        let size = bytes.len() as u32;
        Self {
            header,
            bytes,
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Zeroes both indices and publishes the ring size.
    pub fn init(&self) {
        self.header.write_u32(header::WRITE, 0);
        self.header.write_u32(header::READ, 0);
        self.header.write_u32(header::SIZE, self.size);
        self.header.write_u32(header::TOKEN, 0);
        self.header.write_u32(header::FULL, 0);
    }

    /// Current `(write, read)` indices.
    pub fn indices(&self) -> (u32, u32) {
        (
            self.header.read_u32(header::WRITE),
            self.header.read_u32(header::READ),
        )
    }

    /// Number of bytes the device has written since the ring was initialised.
    pub fn token(&self) -> u32 {
        self.header.read_u32(header::TOKEN)
    }

    /// Bytes waiting to be drained.
    pub fn pending(&self) -> Result<usize, IpcError> {
        let (write, read) = self.checked_indices()?;
        Ok(if write >= read {
            (write - read) as usize
        } else {
            (self.size - read + write) as usize
        })
    }

    fn checked_indices(&self) -> Result<(u32, u32), IpcError> {
        let (write, read) = self.indices();
        if write >= self.size || read >= self.size {
            return Err(IpcError::LogRingCorrupted {
                write,
                read,
                size: self.size,
            });
        }
        Ok((write, read))
    }

    /// Appends everything between `read` and `write` to `sink` and marks it
    /// consumed. Returns the number of bytes copied.
    pub fn flush_into(&self, sink: &mut Vec<u8>) -> Result<usize, IpcError> {
        let (write, read) = self.checked_indices()?;
        if write == read {
            return Ok(0);
        }

        let start = sink.len();
        if read > write {
            let tail = (self.size - read) as usize;
            sink.resize(start + tail + write as usize, 0);
            self.bytes.read_bytes(read as usize, &mut sink[start..start + tail]);
            self.bytes.read_bytes(0, &mut sink[start + tail..]);
        } else {
            sink.resize(start + (write - read) as usize, 0);
            self.bytes.read_bytes(read as usize, &mut sink[start..]);
        }

        self.header.write_u32(header::READ, write);
        self.header.write_u32(header::FULL, 0);
        Ok(sink.len() - start)
    }

    /// Writer side: appends `data`, overwriting the oldest bytes once the
    /// reader falls a whole ring behind.
    pub fn produce(&self, data: &[u8]) {
        let (mut write, read) = self.indices();
        if write >= self.size {
            write = 0;
        }
        for &byte in data {
            self.bytes.write_bytes(write as usize, &[byte]);
            write = (write + 1) % self.size;
            if write == read {
                self.header.write_u32(header::FULL, 1);
            }
        }
        self.header.write_u32(header::WRITE, write);
        let token = self.header.read_u32(header::TOKEN);
        self.header.write_u32(header::TOKEN, token.wrapping_add(data.len() as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn ring(size: usize) -> LogRing {
        let header = SharedWindow::allocate(20);
        let bytes = SharedWindow::allocate(size);
        let ring = LogRing::new(header, bytes);
        ring.init();
        ring
    }

    #[test]
    fn equal_indices_copy_nothing() {
        let ring = ring(16);
        let mut sink = Vec::new();
        assert_eq!(ring.flush_into(&mut sink).unwrap(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn contiguous_flush() {
        let ring = ring(16);
        ring.produce(b"boot ok\n");
        let mut sink = Vec::new();
        assert_eq!(ring.flush_into(&mut sink).unwrap(), 8);
        assert_eq!(sink, b"boot ok\n");
        assert_eq!(ring.indices(), (8, 8));
        assert_eq!(ring.token(), 8);
    }

    #[test]
    fn wrapped_flush_copies_two_spans_in_order() {
        let ring = ring(8);
        ring.produce(b"abcdef");
        let mut sink = Vec::new();
        ring.flush_into(&mut sink).unwrap();

        ring.produce(b"ghijk");
        assert_eq!(ring.indices(), (3, 6));
        assert_eq!(ring.pending().unwrap(), 5);
        let mut sink = vec![b'>'];
        assert_eq!(ring.flush_into(&mut sink).unwrap(), 5);
        assert_eq!(sink, b">ghijk");
    }

    #[test]
    fn out_of_range_index_is_corruption() {
        let ring = ring(8);
        ring.header.write_u32(header::WRITE, 8);
        let mut sink = Vec::new();
        assert_eq!(
            ring.flush_into(&mut sink),
            Err(IpcError::LogRingCorrupted {
                write: 8,
                read: 0,
                size: 8
            })
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn size_word_is_not_trusted() {
        let ring = ring(8);
        ring.header.write_u32(header::SIZE, 4096);
        ring.header.write_u32(header::READ, 100);
        let mut sink = Vec::new();
        assert!(ring.flush_into(&mut sink).is_err());
    }
}
