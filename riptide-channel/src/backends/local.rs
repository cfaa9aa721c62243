//! Chunked reads from an existing local file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::fast_start::{FastStartReader, supports_extension};
use crate::buffer::{BufferLease, PoolHandle};
use crate::channel::{
    Channel, ChannelBackend, ChannelResult, ChannelState, IdentityHash, Request, RequestCore,
    RequestReader,
};
use crate::config::ChannelConfig;

/// Seekable byte source a request reads from.
pub(crate) trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Reads until `buf` is full or the source ends. Returns the bytes filled.
pub(crate) fn fill_buffer<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Delivers a request's range from `source` in pooled chunks.
///
/// `source` must already be positioned at the request offset. Stops when
/// the range is satisfied, or at end of stream, which is an error only for
/// bounded requests.
pub(crate) fn deliver_chunks<R: Read + ?Sized>(
    request: &RequestCore,
    pool: &PoolHandle,
    source: &mut R,
) -> ChannelResult<()> {
    let settings = request.settings();
    let mut position = settings.offset;
    loop {
        request.check_live()?;

        let wanted = settings.next_chunk_len(position);
        if wanted == 0 {
            return Ok(());
        }

        let mut lease = BufferLease::new(pool, wanted);
        let filled = fill_buffer(source, &mut lease)?;
        if filled == 0 {
            return if settings.is_unbounded() {
                trace!(position, "End of file reached");
                Ok(())
            } else {
                Err(settings.premature_eof(position))
            };
        }

        lease.truncate(filled);
        request.emit_success(lease.freeze(), position)?;
        position += filled as u64;
    }
}

/// Backend serving an existing file on disk.
pub struct LocalFileBackend {
    path: PathBuf,
    identity: IdentityHash,
    pool: PoolHandle,
    default_max_chunk: u32,
}

impl LocalFileBackend {
    pub fn new(path: impl AsRef<Path>, pool: PoolHandle, config: &ChannelConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            identity: IdentityHash::for_path(&path),
            path,
            pool,
            default_max_chunk: config.request.default_max_chunk,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChannelBackend for LocalFileBackend {
    fn identity(&self) -> Option<IdentityHash> {
        Some(self.identity)
    }

    fn length(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|meta| meta.len())
    }

    /// # Errors
    ///
    /// - `ChannelError::Io` - If the file does not exist or is not a regular file
    fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>> {
        let metadata = std::fs::metadata(&self.path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", self.path.display()),
            )
            .into());
        }
        debug!("Opening local channel on {}", self.path.display());

        Ok(Arc::new(LocalFileChannel {
            state: ChannelState::new(),
            reader: Arc::new(LocalFileReader {
                path: self.path.clone(),
                pool: Arc::clone(&self.pool),
            }),
            identity: self.identity,
            default_max_chunk: self.default_max_chunk,
        }))
    }
}

/// Channel over a local file.
pub struct LocalFileChannel {
    state: Arc<ChannelState>,
    reader: Arc<LocalFileReader>,
    identity: IdentityHash,
    default_max_chunk: u32,
}

impl Channel for LocalFileChannel {
    fn create_request(&self) -> Request {
        Request::new(
            Arc::clone(&self.state),
            self.reader.clone(),
            self.default_max_chunk,
        )
    }

    fn identity(&self) -> IdentityHash {
        self.identity
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

struct LocalFileReader {
    path: PathBuf,
    pool: PoolHandle,
}

impl LocalFileReader {
    /// Opens the file, through the fast-start adapter when the request
    /// feeds a media player.
    fn open(&self, user_agent: Option<&str>) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(&self.path)?;
        if let Some(agent) = user_agent
            && supports_extension(&self.path)
        {
            let reader = FastStartReader::new(file)?;
            if reader.is_reordered() {
                debug!(
                    user_agent = agent,
                    "Serving {} in fast-start order",
                    self.path.display()
                );
            }
            return Ok(Box::new(reader));
        }
        Ok(Box::new(file))
    }
}

impl RequestReader for LocalFileReader {
    fn read(&self, request: &RequestCore) -> ChannelResult<()> {
        let settings = request.settings();
        let mut source = self.open(settings.user_agent.as_deref())?;
        source.seek(SeekFrom::Start(settings.offset))?;
        deliver_chunks(request, &self.pool, &mut *source)
    }

    fn available_bytes(&self, position: u64) -> Option<u64> {
        let length = std::fs::metadata(&self.path).ok()?.len();
        Some(length.saturating_sub(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, TO_END};
    use crate::test_fixtures::{CountingBufferPool, EventRecorder, pattern_bytes, temp_pattern_file};

    fn backend(path: &Path, pool: &CountingBufferPool) -> LocalFileBackend {
        LocalFileBackend::new(path, pool.handle(), &ChannelConfig::for_testing())
    }

    #[test]
    fn test_ten_thousand_bytes_in_three_chunks() {
        let (_dir, path) = temp_pattern_file("data.bin", 10_000);
        let pool = CountingBufferPool::new();
        let channel = backend(&path, &pool).create_channel().unwrap();

        let request = channel.create_request();
        request.set_offset(0);
        request.set_length(10_000);
        request.set_max_chunk_size(4096);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();

        assert_eq!(
            recorder.success_ranges(),
            vec![(0, 4096), (4096, 4096), (8192, 1808)]
        );
        assert!(recorder.failures().is_empty());
        assert_eq!(recorder.bytes(), pattern_bytes(0, 10_000));
        assert_eq!(request.position(), 10_000);
        assert_eq!(channel.position(), 10_000);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unbounded_request_from_offset() {
        let (_dir, path) = temp_pattern_file("data.bin", 5000);
        let pool = CountingBufferPool::new();
        let channel = backend(&path, &pool).create_channel().unwrap();

        let request = channel.create_request();
        request.set_offset(1000);
        request.set_length(TO_END);
        assert_eq!(request.available_bytes(), Some(4000));

        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();

        assert_eq!(recorder.bytes(), pattern_bytes(1000, 5000));
        assert!(recorder.failures().is_empty());
        assert_eq!(request.remaining(), None);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_bounded_request_past_end_fails() {
        let (_dir, path) = temp_pattern_file("short.bin", 100);
        let pool = CountingBufferPool::new();
        let channel = backend(&path, &pool).create_channel().unwrap();

        let request = channel.create_request();
        request.set_offset(40);
        request.set_length(100);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();

        assert_eq!(recorder.total_bytes(), 60);
        let failures = recorder.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            *failures[0],
            ChannelError::PrematureEof {
                expected: 100,
                actual: 60
            }
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_destroy_cancels_running_request() {
        let (_dir, path) = temp_pattern_file("data.bin", 64 * 1024);
        let pool = CountingBufferPool::new();
        let channel = backend(&path, &pool).create_channel().unwrap();

        let request = channel.create_request();
        request.set_max_chunk_size(1024);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        let destroyer = Arc::clone(&channel);
        request.add_listener(Arc::new(move |event: crate::channel::RequestEvent| {
            if let crate::channel::RequestEvent::Success { offset, .. } = event
                && offset == 2048
            {
                destroyer.destroy();
            }
        }));
        request.run();

        assert_eq!(recorder.success_ranges().len(), 3);
        assert_eq!(recorder.failures().len(), 1);
        assert!(channel.is_destroyed());
        assert_eq!(pool.outstanding(), 0);

        // Requests created after destruction fail immediately.
        let late = channel.create_request();
        let late_recorder = EventRecorder::new();
        late.add_listener(late_recorder.listener());
        late.run();
        assert!(matches!(*late_recorder.failures()[0], ChannelError::Destroyed));
    }

    #[test]
    fn test_missing_file_cannot_open_channel() {
        let dir = tempfile::tempdir().unwrap();
        let pool = CountingBufferPool::new();
        let backend = backend(&dir.path().join("absent.bin"), &pool);

        assert!(matches!(backend.create_channel(), Err(ChannelError::Io(_))));
        assert_eq!(backend.length(), None);
        assert!(backend.identity().is_some());
    }

    #[test]
    fn test_user_agent_on_plain_file_is_unchanged() {
        let (_dir, path) = temp_pattern_file("video.mp4", 3000);
        let pool = CountingBufferPool::new();
        let channel = backend(&path, &pool).create_channel().unwrap();

        let request = channel.create_request();
        request.set_user_agent("test-player/1.0");
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();

        assert_eq!(recorder.bytes(), pattern_bytes(0, 3000));
        assert_eq!(pool.outstanding(), 0);
    }
}
