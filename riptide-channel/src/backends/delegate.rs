//! Identity-masking wrapper and push-to-pull bridge.
//!
//! [`DelegateMaskBackend`] serves another backend's bytes under a derived
//! identity, so caches keyed by identity never confuse the two.
//! [`PullReader`] turns the event-driven request protocol into blocking
//! positional reads for code that expects `read(buf)` semantics.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::PooledBuffer;
use crate::channel::{Channel, ChannelBackend, ChannelError, ChannelResult, IdentityHash, Request, RequestEvent};

/// Backend exposing a wrapped backend under its masked identity.
pub struct DelegateMaskBackend {
    inner: Arc<dyn ChannelBackend>,
}

impl DelegateMaskBackend {
    pub fn new(inner: Arc<dyn ChannelBackend>) -> Self {
        Self { inner }
    }

    /// Opens a channel with access to the pull bridge.
    ///
    /// # Errors
    ///
    /// - `ChannelError::MissingIdentity` - If the wrapped backend has no identity to mask
    /// - Any error of the wrapped backend's `create_channel`
    pub fn open(&self) -> ChannelResult<Arc<DelegateMaskChannel>> {
        let identity = self
            .inner
            .identity()
            .ok_or(ChannelError::MissingIdentity)?
            .masked();
        let inner = self.inner.create_channel()?;
        debug!("Opening masked channel {} over {}", identity, inner.identity());

        Ok(Arc::new(DelegateMaskChannel {
            inner,
            identity,
            length: self.inner.length(),
            bridge_lock: Arc::new(Mutex::new(())),
        }))
    }
}

impl ChannelBackend for DelegateMaskBackend {
    fn identity(&self) -> Option<IdentityHash> {
        self.inner.identity().map(|identity| identity.masked())
    }

    fn length(&self) -> Option<u64> {
        self.inner.length()
    }

    fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>> {
        Ok(self.open()?)
    }
}

/// Channel forwarding every request to the wrapped channel.
pub struct DelegateMaskChannel {
    inner: Arc<dyn Channel>,
    identity: IdentityHash,
    length: Option<u64>,
    bridge_lock: Arc<Mutex<()>>,
}

impl DelegateMaskChannel {
    /// Blocking positional reader over this channel. Readers created from
    /// the same channel never run requests concurrently.
    pub fn pull_reader(&self) -> PullReader {
        PullReader {
            channel: Arc::clone(&self.inner),
            lock: Arc::clone(&self.bridge_lock),
            length: self.length,
            position: 0,
        }
    }
}

impl Channel for DelegateMaskChannel {
    fn create_request(&self) -> Request {
        self.inner.create_request()
    }

    fn identity(&self) -> IdentityHash {
        self.identity
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    fn destroy(&self) {
        self.inner.destroy();
    }
}

/// Progress of one bridged read.
#[derive(Debug)]
enum BridgeState {
    Idle,
    AwaitingBytes {
        remaining: usize,
        chunks: Vec<PooledBuffer>,
    },
    Done {
        chunks: Vec<PooledBuffer>,
    },
    Failed(Arc<ChannelError>),
}

impl BridgeState {
    fn on_event(&mut self, event: RequestEvent) {
        let state = std::mem::replace(self, BridgeState::Idle);
        *self = match (state, event) {
            (
                BridgeState::AwaitingBytes {
                    remaining,
                    mut chunks,
                },
                RequestEvent::Success { buffer, length, .. },
            ) => {
                chunks.push(buffer);
                match remaining.saturating_sub(length) {
                    0 => BridgeState::Done { chunks },
                    remaining => BridgeState::AwaitingBytes { remaining, chunks },
                }
            }
            (BridgeState::AwaitingBytes { chunks, .. }, RequestEvent::Failed { error })
                if matches!(*error, ChannelError::PrematureEof { .. }) =>
            {
                BridgeState::Done { chunks }
            }
            (BridgeState::AwaitingBytes { .. }, RequestEvent::Failed { error }) => {
                BridgeState::Failed(error)
            }
            (state, _) => state,
        };
    }

    /// Final state once the request has returned. A request that ended
    /// without filling the range is a short read.
    fn finish(self) -> Result<Vec<PooledBuffer>, Arc<ChannelError>> {
        match self {
            BridgeState::Done { chunks } | BridgeState::AwaitingBytes { chunks, .. } => Ok(chunks),
            BridgeState::Failed(error) => Err(error),
            BridgeState::Idle => Ok(Vec::new()),
        }
    }
}

/// Blocking random-access reader over a channel.
///
/// Each read runs one request sized to the caller's buffer and returns once
/// the whole range arrived, the stream ended, or the request failed.
pub struct PullReader {
    channel: Arc<dyn Channel>,
    lock: Arc<Mutex<()>>,
    length: Option<u64>,
    position: u64,
}

impl PullReader {
    /// Reads up to `buf.len()` bytes at `offset`. Returns fewer bytes only
    /// at end of stream.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying request, such as `ChannelError::Destroyed`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> ChannelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _serial = self.lock.lock();

        let state = Arc::new(Mutex::new(BridgeState::AwaitingBytes {
            remaining: buf.len(),
            chunks: Vec::new(),
        }));
        let request = self.channel.create_request();
        request.set_offset(offset);
        request.set_length(buf.len() as u64);
        let sink = Arc::clone(&state);
        request.add_listener(Arc::new(move |event: RequestEvent| sink.lock().on_event(event)));

        trace!(offset, len = buf.len(), "Bridged read");
        request.run();

        let finished = std::mem::replace(&mut *state.lock(), BridgeState::Idle);
        let chunks = finished.finish().map_err(ChannelError::Shared)?;
        let mut filled = 0;
        for chunk in chunks {
            let len = chunk.len().min(buf.len() - filled);
            buf[filled..filled + len].copy_from_slice(&chunk[..len]);
            filled += len;
        }
        Ok(filled)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> Option<u64> {
        self.length
    }
}

impl Read for PullReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(length) = self.length
            && self.position >= length
        {
            return Ok(0);
        }
        let read = self.read_at(self.position, buf).map_err(io::Error::other)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for PullReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let length = self.length.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length unknown")
                })?;
                length.checked_add_signed(delta)
            }
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::backends::LocalFileBackend;
    use crate::buffer::PoolHandle;
    use crate::channel::{ChannelState, RequestCore, RequestReader};
    use crate::config::ChannelConfig;
    use crate::test_fixtures::{CountingBufferPool, pattern_bytes, temp_pattern_file};

    fn local(path: &std::path::Path, pool: &CountingBufferPool) -> Arc<dyn ChannelBackend> {
        Arc::new(LocalFileBackend::new(
            path,
            pool.handle(),
            &ChannelConfig::for_testing(),
        ))
    }

    #[test]
    fn test_identity_is_masked() {
        let (_dir, path) = temp_pattern_file("data.bin", 100);
        let pool = CountingBufferPool::new();
        let inner = local(&path, &pool);
        let backend = DelegateMaskBackend::new(Arc::clone(&inner));

        let original = inner.identity().unwrap();
        let masked = backend.identity().unwrap();
        assert_ne!(masked, original);
        assert_eq!(masked.masked(), original);
        assert_eq!(masked.as_bytes()[1..], original.as_bytes()[1..]);
        assert_eq!(backend.create_channel().unwrap().identity(), masked);
    }

    #[test]
    fn test_read_spanning_chunks() {
        let (_dir, path) = temp_pattern_file("data.bin", 10_000);
        let pool = CountingBufferPool::new();
        let channel = DelegateMaskBackend::new(local(&path, &pool)).open().unwrap();
        let reader = channel.pull_reader();

        let mut buf = vec![0u8; 9000];
        assert_eq!(reader.read_at(1000, &mut buf).unwrap(), 9000);
        assert_eq!(buf, pattern_bytes(1000, 10_000));

        let mut tail = vec![0u8; 500];
        assert_eq!(reader.read_at(9900, &mut tail).unwrap(), 100);
        assert_eq!(tail[..100], pattern_bytes(9900, 10_000)[..]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_read_and_seek_traits() {
        let (_dir, path) = temp_pattern_file("data.bin", 5000);
        let pool = CountingBufferPool::new();
        let channel = DelegateMaskBackend::new(local(&path, &pool)).open().unwrap();
        let mut reader = channel.pull_reader();

        reader.seek(SeekFrom::End(-100)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, pattern_bytes(4900, 5000));

        reader.seek(SeekFrom::Start(10)).unwrap();
        reader.seek(SeekFrom::Current(5)).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf[..], pattern_bytes(15, 19)[..]);
        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_destroyed_channel_fails_read() {
        let (_dir, path) = temp_pattern_file("data.bin", 100);
        let pool = CountingBufferPool::new();
        let channel = DelegateMaskBackend::new(local(&path, &pool)).open().unwrap();
        let reader = channel.pull_reader();

        channel.destroy();
        let mut buf = [0u8; 10];
        assert!(matches!(
            reader.read_at(0, &mut buf),
            Err(ChannelError::Shared(ref error)) if matches!(**error, ChannelError::Destroyed)
        ));
    }

    /// Backend with no identity whose reads record how many overlap.
    struct OverlapBackend {
        identity: Option<IdentityHash>,
        pool: PoolHandle,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    struct OverlapChannel {
        state: Arc<ChannelState>,
        reader: Arc<OverlapReader>,
    }

    struct OverlapReader {
        pool: PoolHandle,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl RequestReader for OverlapReader {
        fn read(&self, request: &RequestCore) -> ChannelResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));

            let settings = request.settings();
            let end = settings.end().unwrap_or(settings.offset);
            let result = request.emit_success(
                PooledBuffer::copy_from(&self.pool, &pattern_bytes(settings.offset, end)),
                settings.offset,
            );
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl Channel for OverlapChannel {
        fn create_request(&self) -> Request {
            Request::new(Arc::clone(&self.state), self.reader.clone(), 1024)
        }

        fn identity(&self) -> IdentityHash {
            IdentityHash::from_seed(b"overlap")
        }

        fn position(&self) -> u64 {
            self.state.position()
        }

        fn is_destroyed(&self) -> bool {
            self.state.is_destroyed()
        }

        fn destroy(&self) {
            self.state.destroy();
        }
    }

    impl ChannelBackend for OverlapBackend {
        fn identity(&self) -> Option<IdentityHash> {
            self.identity
        }

        fn length(&self) -> Option<u64> {
            None
        }

        fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>> {
            Ok(Arc::new(OverlapChannel {
                state: ChannelState::new(),
                reader: Arc::new(OverlapReader {
                    pool: Arc::clone(&self.pool),
                    in_flight: Arc::clone(&self.in_flight),
                    max_in_flight: Arc::clone(&self.max_in_flight),
                }),
            }))
        }
    }

    fn overlap_backend(identity: Option<IdentityHash>, pool: &CountingBufferPool) -> OverlapBackend {
        OverlapBackend {
            identity,
            pool: pool.handle(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn test_backend_without_identity_is_rejected() {
        let pool = CountingBufferPool::new();
        let backend = DelegateMaskBackend::new(Arc::new(overlap_backend(None, &pool)));

        assert!(backend.identity().is_none());
        assert!(matches!(
            backend.create_channel().map(|_| ()),
            Err(ChannelError::MissingIdentity)
        ));
    }

    #[test]
    fn test_concurrent_pull_reads_serialize() {
        let pool = CountingBufferPool::new();
        let inner = overlap_backend(Some(IdentityHash::from_seed(b"overlap")), &pool);
        let max_in_flight = Arc::clone(&inner.max_in_flight);
        let channel = DelegateMaskBackend::new(Arc::new(inner)).open().unwrap();

        let handles: Vec<_> = (0..4u64)
            .map(|i| {
                let reader = channel.pull_reader();
                thread::spawn(move || {
                    let mut buf = vec![0u8; 64];
                    let read = reader.read_at(i * 64, &mut buf).unwrap();
                    (i, read, buf)
                })
            })
            .collect();

        for handle in handles {
            let (i, read, buf) = handle.join().unwrap();
            assert_eq!(read, 64);
            assert_eq!(buf, pattern_bytes(i * 64, i * 64 + 64));
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}
