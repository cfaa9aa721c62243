//! Piece block addressing and outbound piece messages.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::PooledBuffer;

/// BitTorrent wire message id of a `piece` message.
const PIECE_MESSAGE_ID: u8 = 7;

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(piece, offset, length)` byte range requested by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceBlock {
    /// Index of the piece the block belongs to
    pub piece: PieceIndex,
    /// Byte offset within the piece
    pub offset: u32,
    /// Number of bytes requested
    pub length: u32,
}

impl PieceBlock {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece: PieceIndex::new(piece),
            offset,
            length,
        }
    }
}

impl fmt::Display for PieceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.piece, self.offset, self.length)
    }
}

/// Piece geometry of the file a pipeline serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    pub piece_size: u32,
    pub total_length: u64,
}

impl PieceLayout {
    pub fn new(piece_size: u32, total_length: u64) -> Self {
        Self {
            piece_size,
            total_length,
        }
    }

    /// Absolute file offset of the first byte of `block`.
    pub fn byte_offset(&self, block: &PieceBlock) -> u64 {
        u64::from(block.piece.as_u32()) * u64::from(self.piece_size) + u64::from(block.offset)
    }

    /// Whether `block` lies entirely inside the file.
    pub fn contains(&self, block: &PieceBlock) -> bool {
        block.length > 0
            && block.offset.checked_add(block.length).is_some_and(|end| end <= self.piece_size)
            && self.byte_offset(block) + u64::from(block.length) <= self.total_length
    }
}

/// Identifier the pipeline assigns to each accepted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

/// A completed read, ready to be transmitted as a `piece` message.
///
/// Holds the pooled buffers until the message is dropped, which returns
/// them to their pool.
#[derive(Debug)]
pub struct PieceMessage {
    pub id: BlockId,
    pub block: PieceBlock,
    pub chunks: Vec<PooledBuffer>,
}

impl PieceMessage {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes the length-prefixed `piece` wire frame.
    pub fn encode(&self) -> Bytes {
        let payload = self.len();
        let mut frame = BytesMut::with_capacity(4 + 1 + 8 + payload);
        frame.put_u32((1 + 8 + payload) as u32);
        frame.put_u8(PIECE_MESSAGE_ID);
        frame.put_u32(self.block.piece.as_u32());
        frame.put_u32(self.block.offset);
        for chunk in &self.chunks {
            frame.put_slice(chunk);
        }
        frame.freeze()
    }
}
