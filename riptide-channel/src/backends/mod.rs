//! Channel backends.
//!
//! Each backend implements [`ChannelBackend`](crate::channel::ChannelBackend)
//! over a different physical source and supplies a
//! [`RequestReader`](crate::channel::RequestReader) that performs the I/O
//! of its requests.

pub mod delegate;
pub mod fast_start;
pub mod local;
pub mod remote;
pub mod stream_tee;

pub use delegate::{DelegateMaskBackend, DelegateMaskChannel, PullReader};
pub use fast_start::FastStartReader;
pub use local::{LocalFileBackend, LocalFileChannel};
pub use remote::{CertificateInstaller, RedirectCache, RemoteUrlBackend, RemoteUrlChannel};
pub use stream_tee::{StreamTeeBackend, StreamTeeChannel};
