//! Channel, request and event protocol shared by every backend.
//!
//! A [`ChannelBackend`] opens [`Channel`]s against one logical file. A
//! channel hands out [`Request`]s which, when run, push [`RequestEvent`]s
//! to their listeners on the running thread.

pub mod event;
pub mod identity;
pub mod request;
pub mod state;

use std::sync::Arc;

pub use event::{ListenerId, RequestEvent, RequestListener};
pub use identity::IdentityHash;
pub use request::{Request, RequestCore, RequestReader, RequestSettings, RequestType, TO_END};
pub use state::ChannelState;

/// Errors delivered as terminal failed events.
///
/// Covers cancellation, channel teardown, short reads and the network and
/// file system faults of the individual backends.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("Channel destroyed")]
    Destroyed,

    #[error("Premature end of stream: expected {expected} bytes, got {actual}")]
    PrematureEof { expected: u64, actual: u64 },

    #[error("Redirect loop detected at {url} after {hops} hops")]
    RedirectLoop { url: String, hops: usize },

    #[error("Server certificate rejected for {url}")]
    CertificateRejected { url: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Unsupported operation: {operation}")]
    UnsupportedOperation { operation: &'static str },

    #[error("Backend has no resolvable content identity")]
    MissingIdentity,

    #[error("Source stream has already been consumed")]
    SourceExhausted,

    /// Failure shared between several requests or channels.
    #[error("{0}")]
    Shared(Arc<ChannelError>),

    #[error("URL parsing error")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the request ended because a consumer cancelled it.
    pub fn is_cancellation(&self) -> bool {
        match self {
            ChannelError::Cancelled => true,
            ChannelError::Shared(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ChannelError::Cancelled => "Transfer cancelled".to_string(),
            ChannelError::Destroyed => "File is no longer available".to_string(),
            ChannelError::PrematureEof { .. } => "File ended unexpectedly".to_string(),
            ChannelError::RedirectLoop { url, .. } => {
                format!("Too many redirects while fetching {url}")
            }
            ChannelError::CertificateRejected { url } => {
                format!("Could not establish a secure connection to {url}")
            }
            ChannelError::UnexpectedStatus { status, .. } => {
                format!("Server responded with status {status}")
            }
            ChannelError::Shared(inner) => inner.user_message(),
            ChannelError::Http(_) | ChannelError::InvalidUrl(_) => {
                "Network error occurred".to_string()
            }
            _ => "File access error occurred".to_string(),
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// An open handle on one logical file from which requests are created.
pub trait Channel: Send + Sync {
    /// Creates a request with default settings (offset 0, read to end).
    fn create_request(&self) -> Request;

    /// Content identity of the file this channel serves.
    fn identity(&self) -> IdentityHash;

    /// Last byte position delivered by any of this channel's requests.
    fn position(&self) -> u64;

    fn is_destroyed(&self) -> bool;

    /// Cancels every outstanding request. Idempotent.
    fn destroy(&self);
}

/// A logical file that can be served through channels.
pub trait ChannelBackend: Send + Sync {
    /// Content identity, if the backend can resolve one.
    fn identity(&self) -> Option<IdentityHash>;

    /// Total length in bytes, if known.
    fn length(&self) -> Option<u64>;

    /// Opens a new channel.
    ///
    /// # Errors
    ///
    /// Backend specific; for example the file cannot be opened or the
    /// backend cannot represent its target.
    fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>>;
}
