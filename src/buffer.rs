//! Receive buffer with a read cursor and save/restore support.
//!
//! The stream parser consumes bytes through a cursor rather than draining the
//! underlying storage, so a parse attempt over insufficient data can be rolled
//! back without copying the input. After a response has been fully consumed,
//! [`ByteBuffer::trim`] discards everything before the cursor to bound memory.

use bytes::{Buf, BytesMut};

/// Append-only byte buffer with a movable read cursor.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
    cursor: usize,
    saved: usize,
}

impl ByteBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes at the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Returns the number of bytes from the cursor to the end.
    #[must_use]
    pub fn available(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Returns the cursor position within the buffer.
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Returns the bytes from the cursor to the end.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// Returns the byte at the cursor without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.cursor).copied()
    }

    /// Returns the byte at `offset` past the cursor without consuming it.
    #[must_use]
    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.cursor + offset).copied()
    }

    /// Moves the cursor forward by `n` bytes, clamped to the end.
    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }

    /// Consumes and returns the byte at the cursor.
    pub fn take(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.cursor += 1;
        Some(byte)
    }

    /// Records the current cursor so it can be restored later.
    pub fn save_cursor(&mut self) {
        self.saved = self.cursor;
    }

    /// Rewinds the cursor to the last saved position.
    pub fn restore_cursor(&mut self) {
        self.cursor = self.saved;
    }

    /// Discards everything before the cursor.
    ///
    /// The saved cursor is rebased so a later restore cannot point before the
    /// start of the buffer.
    pub fn trim(&mut self) {
        self.data.advance(self.cursor);
        self.saved = self.saved.saturating_sub(self.cursor);
        self.cursor = 0;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_available() {
        let mut buffer = ByteBuffer::new();
        assert_eq!(buffer.available(), 0);

        buffer.append(b"hello");
        assert_eq!(buffer.available(), 5);
        assert_eq!(buffer.remaining(), b"hello");

        buffer.append(b" world");
        assert_eq!(buffer.available(), 11);
    }

    #[test]
    fn test_peek_and_take() {
        let mut buffer = ByteBuffer::new();
        buffer.append(b"ab");

        assert_eq!(buffer.peek(), Some(b'a'));
        assert_eq!(buffer.peek_at(1), Some(b'b'));
        assert_eq!(buffer.peek_at(2), None);

        assert_eq!(buffer.take(), Some(b'a'));
        assert_eq!(buffer.take(), Some(b'b'));
        assert_eq!(buffer.take(), None);
    }

    #[test]
    fn test_save_restore_hides_partial_reads() {
        let mut buffer = ByteBuffer::new();
        buffer.append(b"* OK");

        buffer.save_cursor();
        buffer.advance(3);
        assert_eq!(buffer.remaining(), b"K");

        buffer.restore_cursor();
        assert_eq!(buffer.remaining(), b"* OK");
    }

    #[test]
    fn test_trim_preserves_unconsumed_bytes() {
        let mut buffer = ByteBuffer::new();
        buffer.append(b"first\r\nsecond");
        buffer.advance(7);

        buffer.trim();
        assert_eq!(buffer.remaining(), b"second");
        assert_eq!(buffer.available(), 6);

        // The rebased save point cannot rewind past the trim.
        buffer.advance(3);
        buffer.restore_cursor();
        assert_eq!(buffer.remaining(), b"second");
    }

    #[test]
    fn test_advance_is_clamped() {
        let mut buffer = ByteBuffer::new();
        buffer.append(b"xy");
        buffer.advance(10);
        assert_eq!(buffer.available(), 0);
        assert_eq!(buffer.peek(), None);
    }
}
