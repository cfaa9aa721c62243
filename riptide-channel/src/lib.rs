//! Riptide Channel - Asynchronous read requests over heterogeneous sources
//!
//! A uniform channel abstraction for reading byte ranges from local files,
//! remote URLs, streams being teed to disk, and identity-masked delegates.
//! Requests deliver pooled buffers through listener events, and a bounded
//! read-ahead pipeline feeds outbound piece messages from any channel.

pub mod backends;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod pipeline;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

// Re-export main types for convenient access
pub use backends::{
    CertificateInstaller, DelegateMaskBackend, FastStartReader, LocalFileBackend, PullReader,
    RedirectCache, RemoteUrlBackend, StreamTeeBackend,
};
pub use buffer::{BufferLease, BufferPool, PoolHandle, PooledBuffer, SharedBufferPool};
pub use channel::{
    Channel, ChannelBackend, ChannelError, ChannelResult, IdentityHash, ListenerId, Request,
    RequestEvent, RequestListener, RequestType, TO_END,
};
pub use config::ChannelConfig;
pub use pipeline::{
    BlockId, InlineReadExecutor, OutboundQueue, PieceBlock, PieceLayout, PieceMessage,
    PipelineStats, ReadAheadPipeline, ReadExecutor, RejectHandler, TokioReadExecutor,
};
