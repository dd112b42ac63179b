//! History Buffer (C1): a fixed-capacity rotating byte log per session.
//!
//! Backed by a deque of chunks rather than one contiguous `Vec<u8>` so that
//! `append` never has to shift the whole buffer to drop old bytes — only
//! whole chunks are popped from the front, with at most one partial-chunk
//! slice when the boundary falls mid-chunk. Bytes are opaque: no ANSI
//! awareness, no UTF-8 validation.

use std::collections::VecDeque;

use bytes::Bytes;

pub struct HistoryBuffer {
    capacity: usize,
    size: usize,
    chunks: VecDeque<Bytes>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, size: 0, chunks: VecDeque::new() }
    }

    /// Append bytes, discarding the oldest data if `capacity` would be
    /// exceeded. A single chunk larger than `capacity` is truncated to its
    /// last `capacity` bytes. Empty input is a no-op.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() || self.capacity == 0 {
            return;
        }
        let bytes = if bytes.len() > self.capacity {
            Bytes::copy_from_slice(&bytes[bytes.len() - self.capacity..])
        } else {
            Bytes::copy_from_slice(bytes)
        };
        self.size += bytes.len();
        self.chunks.push_back(bytes);
        self.trim();
    }

    fn trim(&mut self) {
        while self.size > self.capacity {
            let Some(front) = self.chunks.pop_front() else { break };
            let excess = self.size - self.capacity;
            if excess >= front.len() {
                self.size -= front.len();
                continue;
            }
            // Excess falls inside this chunk: keep its tail and put it back.
            let keep = front.slice(excess..);
            self.size -= excess;
            self.chunks.push_front(keep);
            break;
        }
    }

    /// Return a copy of the buffer contents. When `limit` is `Some` and
    /// positive, only the last `limit` bytes are returned.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<u8> {
        let take = limit.filter(|&n| n > 0).unwrap_or(self.size).min(self.size);
        let mut out = Vec::with_capacity(take);
        let skip = self.size - take;
        let mut remaining_skip = skip;
        let mut remaining_take = take;
        for chunk in &self.chunks {
            if remaining_take == 0 {
                break;
            }
            if remaining_skip >= chunk.len() {
                remaining_skip -= chunk.len();
                continue;
            }
            let start = remaining_skip;
            remaining_skip = 0;
            let end = (start + remaining_take).min(chunk.len());
            out.extend_from_slice(&chunk[start..end]);
            remaining_take -= end - start;
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_snapshot_round_trips() {
        let mut buf = HistoryBuffer::new(1024);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.snapshot(None), b"hello world");
        assert_eq!(buf.size(), 11);
    }

    #[test]
    fn empty_append_is_noop() {
        let mut buf = HistoryBuffer::new(16);
        buf.append(b"");
        assert!(buf.empty());
    }

    #[test]
    fn oversized_chunk_truncates_to_suffix() {
        let mut buf = HistoryBuffer::new(4);
        buf.append(b"abcdefgh");
        assert_eq!(buf.snapshot(None), b"efgh");
        assert_eq!(buf.size(), 4);
    }

    #[test]
    fn rolling_append_drops_oldest_bytes() {
        let mut buf = HistoryBuffer::new(5);
        buf.append(b"abc");
        buf.append(b"defgh");
        assert_eq!(buf.snapshot(None), b"defgh");
        assert!(buf.size() <= buf.capacity());
    }

    #[test]
    fn partial_chunk_trim_keeps_tail_of_front_chunk() {
        let mut buf = HistoryBuffer::new(6);
        buf.append(b"abc");
        buf.append(b"d");
        buf.append(b"efgh"); // total 8 bytes, cap 6 -> keep last 6: "cdefgh"
        assert_eq!(buf.snapshot(None), b"cdefgh");
    }

    #[test]
    fn snapshot_limit_returns_suffix() {
        let mut buf = HistoryBuffer::new(1024);
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(Some(4)), b"6789");
        assert_eq!(buf.snapshot(Some(100)), b"0123456789");
    }

    #[test]
    fn clear_resets_size() {
        let mut buf = HistoryBuffer::new(16);
        buf.append(b"data");
        buf.clear();
        assert!(buf.empty());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn never_exceeds_capacity_after_many_appends() {
        let mut buf = HistoryBuffer::new(10);
        for i in 0..50u8 {
            buf.append(&[i]);
            assert!(buf.size() <= buf.capacity());
        }
        assert_eq!(buf.snapshot(None), (40u8..50u8).collect::<Vec<_>>());
    }
}
