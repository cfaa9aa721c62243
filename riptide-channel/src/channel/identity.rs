//! Content-identity hashes used by consumers to key caches.

use std::fmt;
use std::path::Path;

use sha1::{Digest, Sha1};
use url::Url;

/// Seed prefix mixed into identities of URL-backed files.
const URL_IDENTITY_PREFIX: &str = "DiskManagerFileInfoURL";

/// Fixed-length SHA-1 content identity of a channel's target.
///
/// Derived deterministically from a seed string so the same target always
/// maps to the same identity across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityHash([u8; 20]);

impl IdentityHash {
    /// Creates an identity from raw hash bytes.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// SHA-1 of an arbitrary seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        Self(hasher.finalize().into())
    }

    /// Identity of a file or stream target: SHA-1 of its absolute path.
    pub fn for_path(path: &Path) -> Self {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Self::from_seed(absolute.to_string_lossy().as_bytes())
    }

    /// Identity of a remote resource.
    pub fn for_url(url: &Url) -> Self {
        let seed = format!("{URL_IDENTITY_PREFIX}{}", url.as_str());
        Self::from_seed(seed.as_bytes())
    }

    /// Derived identity that never equals `self`: the low bit of the first
    /// byte is flipped.
    pub fn masked(&self) -> Self {
        let mut hash = self.0;
        hash[0] ^= 0x01;
        Self(hash)
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
