//! Receiver-side chunk reassembly.

use std::collections::BTreeMap;

/// Result of offering a chunk to a [`ReassemblyBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    /// Chunk stored for the first time
    New,
    /// Index already present; the bytes were discarded
    Duplicate,
    /// Index outside `0..total`
    OutOfRange,
    /// Storing the chunk would exceed the byte limit
    Overflow,
}

/// Sparse buffer of chunks indexed `0..total`.
///
/// Storage grows with the chunks actually received, never with the
/// announced total.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    chunks: BTreeMap<u64, Vec<u8>>,
    total: u64,
    bytes: u64,
    byte_limit: u64,
}

impl ReassemblyBuffer {
    /// Create a buffer for `total` chunks with no byte limit.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self::with_byte_limit(total, u64::MAX)
    }

    /// Create a buffer for `total` chunks holding at most `byte_limit` bytes.
    #[must_use]
    pub fn with_byte_limit(total: u64, byte_limit: u64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            total,
            bytes: 0,
            byte_limit,
        }
    }

    /// Number of chunks expected
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of distinct chunks stored
    #[must_use]
    pub fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Bytes stored so far
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Store the chunk at `index`.
    pub fn insert(&mut self, index: u64, bytes: Vec<u8>) -> ChunkInsert {
        if index >= self.total {
            return ChunkInsert::OutOfRange;
        }
        if self.chunks.contains_key(&index) {
            return ChunkInsert::Duplicate;
        }

        let len = bytes.len() as u64;
        match self.bytes.checked_add(len) {
            Some(next) if next <= self.byte_limit => self.bytes = next,
            _ => return ChunkInsert::Overflow,
        }
        self.chunks.insert(index, bytes);
        ChunkInsert::New
    }

    /// Whether the chunk at `index` is present.
    #[must_use]
    pub fn contains(&self, index: u64) -> bool {
        self.chunks.contains_key(&index)
    }

    /// Indices present, ascending.
    #[must_use]
    pub fn received_indices(&self) -> Vec<u64> {
        self.chunks.keys().copied().collect()
    }

    /// Whether every index is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received() == self.total
    }

    /// Concatenate the chunks in index order.
    ///
    /// Returns `None` if any chunk is missing.
    #[must_use]
    pub fn assemble(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }

        let mut out = Vec::with_capacity(usize::try_from(self.bytes).ok()?);
        for chunk in self.chunks.into_values() {
            out.extend_from_slice(&chunk);
        }
        Some(out)
    }
}
