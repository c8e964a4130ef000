//! Resizable byte buffers backing the reader and writer facades. Both grow
//! by a configured increment up to a maximum and never shrink on their own;
//! data that outlives a call is preserved across calls.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer full at maximum size ({max} bytes)")]
    Exhausted { max: usize },

    #[error("allocation failed: {0}")]
    Allocation(#[from] std::collections::TryReserveError),

    #[error("{left} bytes of pending data do not fit in {size} bytes")]
    WouldTruncate { left: usize, size: usize },

    #[error("size {size} exceeds maximum {max}")]
    OverMax { size: usize, max: usize },

    #[error("maximum {max} below current size {size}")]
    MaxBelowSize { max: usize, size: usize },

    #[error("buffer sizes must be non-zero")]
    Zero,
}

fn allocate(size: usize) -> Result<Vec<u8>, BufferError> {
    if size == 0 {
        return Err(BufferError::Zero);
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Ingress buffer: unconsumed data lives at `at..at + left`, free space
/// after it.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    buf: Vec<u8>,
    inc: usize,
    max: usize,
    at: usize,
    left: usize,
}

impl ReadBuffer {
    pub fn new(size: usize, inc: usize, max: usize) -> Result<Self, BufferError> {
        Ok(ReadBuffer {
            buf: allocate(size)?,
            inc,
            max,
            at: 0,
            left: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn set_size(&mut self, size: usize) -> Result<(), BufferError> {
        if size == 0 {
            return Err(BufferError::Zero);
        }
        if self.left > size {
            return Err(BufferError::WouldTruncate {
                left: self.left,
                size,
            });
        }
        if size > self.max {
            return Err(BufferError::OverMax {
                size,
                max: self.max,
            });
        }
        if self.at + self.left > size {
            self.compact();
        }
        if size > self.buf.len() {
            self.buf.try_reserve_exact(size - self.buf.len())?;
        }
        self.buf.resize(size, 0);
        Ok(())
    }

    pub fn set_inc(&mut self, inc: usize) -> Result<(), BufferError> {
        if inc == 0 {
            return Err(BufferError::Zero);
        }
        self.inc = inc;
        Ok(())
    }

    pub fn set_max(&mut self, max: usize) -> Result<(), BufferError> {
        if max < self.buf.len() {
            return Err(BufferError::MaxBelowSize {
                max,
                size: self.buf.len(),
            });
        }
        self.max = max;
        Ok(())
    }

    /// The unconsumed data.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.at..self.at + self.left]
    }

    pub fn is_empty(&self) -> bool {
        self.left == 0
    }

    /// Free space after the data, for filling directly (e.g. by a read
    /// syscall); call [`ReadBuffer::filled`] afterwards.
    pub fn space(&mut self) -> &mut [u8] {
        let start = self.at + self.left;
        &mut self.buf[start..]
    }

    pub fn has_space(&self) -> bool {
        self.at + self.left < self.buf.len()
    }

    /// Copy as much of `data` as fits into the free space; returns the
    /// number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let space = self.space();
        let n = space.len().min(data.len());
        space[..n].copy_from_slice(&data[..n]);
        self.left += n;
        n
    }

    /// Record `n` bytes appended directly into [`ReadBuffer::space`].
    pub fn filled(&mut self, n: usize) {
        self.left += n;
    }

    /// Mark `n` leading bytes of the data as consumed.
    pub fn consume(&mut self, n: usize) {
        self.at += n;
        self.left -= n;
        if self.left == 0 {
            self.at = 0;
        }
    }

    fn compact(&mut self) {
        if self.at > 0 {
            self.buf.copy_within(self.at..self.at + self.left, 0);
            self.at = 0;
        }
    }

    /// Make room for more input after a decode asked for more bytes: compact
    /// in place while trailing space remains, otherwise grow by the
    /// configured increment up to the maximum.
    pub fn make_room(&mut self) -> Result<(), BufferError> {
        if self.left < self.buf.len() {
            self.compact();
        } else if self.buf.len() < self.max {
            let size = (self.buf.len() + self.inc).min(self.max);
            self.buf.try_reserve_exact(size - self.buf.len())?;
            self.buf.resize(size, 0);
        } else {
            return Err(BufferError::Exhausted { max: self.max });
        }
        Ok(())
    }
}

/// Egress buffer: encoded data is appended at `at` and drained from the
/// front of the pending region `at - left..at`.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    buf: Vec<u8>,
    inc: usize,
    max: usize,
    at: usize,
    left: usize,
}

impl WriteBuffer {
    pub fn new(size: usize, inc: usize, max: usize) -> Result<Self, BufferError> {
        Ok(WriteBuffer {
            buf: allocate(size)?,
            inc,
            max,
            at: 0,
            left: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn set_size(&mut self, size: usize) -> Result<(), BufferError> {
        if size == 0 {
            return Err(BufferError::Zero);
        }
        if self.left > size {
            return Err(BufferError::WouldTruncate {
                left: self.left,
                size,
            });
        }
        if size > self.max {
            return Err(BufferError::OverMax {
                size,
                max: self.max,
            });
        }
        if self.at > size {
            self.buf.copy_within(self.at - self.left..self.at, 0);
            self.at = self.left;
        }
        if size > self.buf.len() {
            self.buf.try_reserve_exact(size - self.buf.len())?;
        }
        self.buf.resize(size, 0);
        Ok(())
    }

    pub fn set_inc(&mut self, inc: usize) -> Result<(), BufferError> {
        if inc == 0 {
            return Err(BufferError::Zero);
        }
        self.inc = inc;
        Ok(())
    }

    pub fn set_max(&mut self, max: usize) -> Result<(), BufferError> {
        if max < self.buf.len() {
            return Err(BufferError::MaxBelowSize {
                max,
                size: self.buf.len(),
            });
        }
        self.max = max;
        Ok(())
    }

    /// Free space for the encoder; call [`WriteBuffer::commit`] afterwards.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf[self.at..]
    }

    pub fn commit(&mut self, n: usize) {
        self.at += n;
        self.left += n;
    }

    /// Encoded bytes not yet handed to the caller or the transport.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.at - self.left..self.at]
    }

    pub fn is_drained(&self) -> bool {
        self.left == 0
    }

    /// Copy pending bytes into `out`; returns the number copied.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.left);
        let start = self.at - self.left;
        out[..n].copy_from_slice(&self.buf[start..start + n]);
        self.drained(n);
        n
    }

    /// Mark `n` pending bytes as flushed.
    pub fn drained(&mut self, n: usize) {
        self.left -= n;
        if self.left == 0 {
            self.at = 0;
        }
    }

    /// Grow by the configured increment, up to the maximum.
    pub fn grow(&mut self) -> Result<(), BufferError> {
        if self.buf.len() >= self.max {
            return Err(BufferError::Exhausted { max: self.max });
        }
        let size = (self.buf.len() + self.inc).min(self.max);
        self.buf.try_reserve_exact(size - self.buf.len())?;
        self.buf.resize(size, 0);
        Ok(())
    }
}
