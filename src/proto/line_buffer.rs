//! Fixed-capacity accumulator over a [`Transport`], producing
//! CRLF-terminated logical lines and raw literal byte runs (spec §4.2).

use std::io::Read;

use crate::error::{Result, SyncError};
use crate::transport::Transport;

/// Minimum buffer size mandated by spec §4.2 ("≥ 1 KiB").
const MIN_CAPACITY: usize = 1024;
const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Accumulates bytes read from a transport and slices them into logical
/// lines / literal byte runs. Holds no transport reference itself — each
/// call is handed the transport to read more from, matching the C
/// original's `buffer_gets(ctx, &s)` taking the connection as a
/// parameter rather than owning it.
pub struct LineBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Index of the first unconsumed byte.
    start: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        LineBuffer {
            buf: Vec::with_capacity(capacity),
            capacity,
            start: 0,
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(0..self.start);
            self.start = 0;
        }
    }

    fn fill_more(&mut self, transport: &mut dyn Transport) -> Result<()> {
        self.compact();
        if self.buf.len() >= self.capacity {
            return Err(SyncError::box_bad("line buffer exhausted without finding CRLF"));
        }
        let mut chunk = [0u8; 4096];
        let want = chunk.len().min(self.capacity - self.buf.len());
        let n = transport
            .read(&mut chunk[..want])
            .map_err(|e| SyncError::store_bad(format!("transport read failed: {}", e)))?;
        if n == 0 {
            return Err(SyncError::store_bad("EOF from server"));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Return the next CRLF-terminated logical line, with the CRLF
    /// stripped. Blocks (reading more from `transport`) until a
    /// terminator is found or the buffer fills without one.
    pub fn getline(&mut self, transport: &mut dyn Transport) -> Result<String> {
        loop {
            if let Some(pos) = find_crlf(&self.buf[self.start..]) {
                let line_end = self.start + pos;
                let line = String::from_utf8_lossy(&self.buf[self.start..line_end]).into_owned();
                self.start = line_end + 2;
                return Ok(line);
            }
            self.fill_more(transport)?;
        }
    }

    /// Pull exactly `n` bytes for an IMAP literal (spec §4.2), first
    /// from whatever is already buffered, then directly from the
    /// transport for the remainder.
    pub fn read_literal(&mut self, transport: &mut dyn Transport, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        let available = self.buf.len() - self.start;
        let take = available.min(n);
        out.extend_from_slice(&self.buf[self.start..self.start + take]);
        self.start += take;
        self.compact();
        let remaining = n - take;
        if remaining > 0 {
            let mut rest = vec![0u8; remaining];
            transport
                .read_exact(&mut rest)
                .map_err(|e| SyncError::store_bad(format!("transport read failed mid-literal: {}", e)))?;
            out.extend_from_slice(&rest);
        }
        Ok(out)
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        LineBuffer::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
