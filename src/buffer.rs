// src/buffer.rs
//
// Growable byte region with read/write cursors. Invariant:
// read_pos <= write_pos <= storage.len(). Bytes between the cursors are
// readable; bytes past write_pos are writable; bytes before read_pos are
// prependable (already consumed, reclaimable by compaction).
use crate::syscalls;
use std::io;

const INITIAL_SIZE: usize = 1024;
const SCRATCH_SIZE: usize = 65536;

pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(size: usize) -> Self {
        Buffer {
            storage: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor, consuming up to `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        self.read_pos += n.min(self.readable());
    }

    /// Drop everything and reset both cursors. Storage is kept for reuse.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consume the whole readable region as an owned byte vector.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    /// Make room for `n` more bytes. If the dead prefix plus the tail
    /// suffices, compact in place; otherwise grow the storage.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.writable() + self.prependable() < n {
            self.storage.resize(self.write_pos + n + 1, 0);
        } else {
            let readable = self.readable();
            self.storage.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// One scatter read from `fd`: the first segment is the writable tail,
    /// the second a stack scratch region. A read that overflows the tail
    /// grows the buffer and appends the scratch overflow, so a single
    /// syscall can pull in more than the buffer currently has room for.
    pub fn read_from_fd(&mut self, fd: i32) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable();

        let n = {
            let (_, tail) = self.storage.split_at_mut(self.write_pos);
            syscalls::read_vectored(fd, tail, &mut scratch)?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// One plain write of the readable region to `fd`. The read cursor
    /// advances by the actual byte count, so partial writes resume cleanly.
    pub fn write_to_fd(&mut self, fd: i32) -> io::Result<usize> {
        let n = syscalls::write_fd(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
