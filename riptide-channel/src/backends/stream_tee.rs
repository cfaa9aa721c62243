//! Live input stream teed to disk and read back by concurrent channels.
//!
//! The first channel against a target that is not yet on disk starts one
//! copy thread. The thread appends the source stream to `<final>._tmp_`
//! and wakes every waiting reader after each append. On end of stream the
//! working file is renamed over the final name and reopened read-only, so
//! readers carry on against the finished file.
//!
//! Context lifecycle: `Copying -> Finalized | Failed`. A target that already
//! exists starts out `Finalized` without a copy thread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::buffer::{BufferLease, PoolHandle, PooledBuffer};
use crate::channel::{
    Channel, ChannelBackend, ChannelError, ChannelResult, ChannelState, IdentityHash, Request,
    RequestCore, RequestReader,
};
use crate::config::{ChannelConfig, StreamTeeConfig};

/// Single-pass input feeding a tee.
pub type TeeSource = Box<dyn Read + Send>;

#[derive(Debug, Clone)]
enum TeePhase {
    Copying,
    Finalized,
    Failed(Arc<ChannelError>),
}

struct TeeShared {
    phase: TeePhase,
    /// Read handle: the working file while copying, the final file after.
    file: Option<File>,
    written: u64,
    channels: Vec<Weak<ChannelState>>,
    live_channels: usize,
    torn_down: bool,
}

/// State shared by the copy thread and every channel of one target.
struct TeeContext {
    final_path: PathBuf,
    temp_path: PathBuf,
    shared: Mutex<TeeShared>,
    wake: Condvar,
    wait_slice: Duration,
}

enum TeeRead {
    Data(PooledBuffer),
    Eof,
}

impl TeeContext {
    fn new(
        final_path: &Path,
        temp_path: &Path,
        phase: TeePhase,
        file: File,
        written: u64,
        wait_slice: Duration,
    ) -> Self {
        Self {
            final_path: final_path.to_path_buf(),
            temp_path: temp_path.to_path_buf(),
            shared: Mutex::new(TeeShared {
                phase,
                file: Some(file),
                written,
                channels: Vec::new(),
                live_channels: 0,
                torn_down: false,
            }),
            wake: Condvar::new(),
            wait_slice,
        }
    }

    /// Joins `channel` to this context unless it is torn down or failed.
    fn try_attach(&self, channel: &Arc<ChannelState>) -> bool {
        let mut shared = self.shared.lock();
        if shared.torn_down || matches!(shared.phase, TeePhase::Failed(_)) {
            return false;
        }
        shared.channels.push(Arc::downgrade(channel));
        shared.live_channels += 1;
        true
    }

    fn is_finalized(&self) -> bool {
        matches!(self.shared.lock().phase, TeePhase::Finalized)
    }

    fn written(&self) -> u64 {
        self.shared.lock().written
    }

    fn live_channels(&self) -> usize {
        self.shared.lock().live_channels
    }

    fn attach(&self, channel: &Arc<ChannelState>) {
        let mut shared = self.shared.lock();
        shared.channels.push(Arc::downgrade(channel));
        shared.live_channels += 1;
    }

    /// Drops one channel reference. The last channel of a finalized target
    /// tears the context down, leaving the finished file in place.
    fn detach(&self) {
        let mut shared = self.shared.lock();
        shared.live_channels = shared.live_channels.saturating_sub(1);
        shared.channels.retain(|channel| channel.strong_count() > 0);
        if shared.live_channels == 0 && matches!(shared.phase, TeePhase::Finalized) {
            Self::tear_down(&mut shared, &self.final_path);
        }
        self.wake.notify_all();
    }

    fn tear_down(shared: &mut TeeShared, target: &Path) {
        if !shared.torn_down {
            debug!("Tearing down tee context for {}", target.display());
            shared.torn_down = true;
            shared.file = None;
        }
    }

    /// Wakes blocked readers so they re-check cancellation.
    fn interrupt(&self) {
        let _shared = self.shared.lock();
        self.wake.notify_all();
    }

    fn appended(&self, count: usize) {
        let mut shared = self.shared.lock();
        shared.written += count as u64;
        trace!(written = shared.written, "Tee appended {} bytes", count);
        self.wake.notify_all();
    }

    /// Renames the working file over the final name and switches readers
    /// to the finished file.
    fn finalize(&self, writer: File) {
        let mut shared = self.shared.lock();
        let flushed = writer.sync_all();
        drop(writer);
        if shared.torn_down {
            let _ = fs::remove_file(&self.temp_path);
            return;
        }

        shared.file = None;
        let reopened = flushed.and_then(|()| {
            if self.final_path.exists() {
                fs::remove_file(&self.final_path)?;
            }
            fs::rename(&self.temp_path, &self.final_path)?;
            File::open(&self.final_path)
        });

        match reopened {
            Ok(file) => {
                info!(
                    "Tee finalized {} ({} bytes)",
                    self.final_path.display(),
                    shared.written
                );
                shared.file = Some(file);
                shared.phase = TeePhase::Finalized;
                if shared.live_channels == 0 {
                    Self::tear_down(&mut shared, &self.final_path);
                }
                self.wake.notify_all();
            }
            Err(e) => self.fail_locked(&mut shared, ChannelError::Io(e)),
        }
    }

    fn abort(&self, error: ChannelError) {
        let mut shared = self.shared.lock();
        if !shared.torn_down {
            self.fail_locked(&mut shared, error);
        }
    }

    /// Fails every live channel with the same error and deletes the partial
    /// output.
    fn fail_locked(&self, shared: &mut MutexGuard<'_, TeeShared>, error: ChannelError) {
        error!("Tee for {} failed: {}", self.final_path.display(), error);
        let error = Arc::new(error);
        shared.phase = TeePhase::Failed(Arc::clone(&error));
        shared.file = None;
        if let Err(e) = fs::remove_file(&self.temp_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            error!("Could not delete partial file {}: {}", self.temp_path.display(), e);
        }
        for channel in shared.channels.iter().filter_map(Weak::upgrade) {
            channel.fail(Arc::clone(&error));
        }
        self.wake.notify_all();
    }

    /// Explicit teardown: readers see their channels destroyed and any
    /// partial output is deleted.
    fn reset(&self) {
        let mut shared = self.shared.lock();
        let finished = matches!(shared.phase, TeePhase::Finalized);
        Self::tear_down(&mut shared, &self.final_path);
        if !finished {
            let _ = fs::remove_file(&self.temp_path);
        }
        for channel in shared.channels.drain(..).filter_map(|weak| weak.upgrade()) {
            channel.destroy();
        }
        self.wake.notify_all();
    }

    fn is_torn_down(&self) -> bool {
        self.shared.lock().torn_down
    }

    /// Reads up to `wanted` bytes at `position`, waiting for the copy
    /// thread while the position is past the written prefix.
    fn read_chunk(
        &self,
        request: &RequestCore,
        pool: &PoolHandle,
        position: u64,
        wanted: usize,
    ) -> ChannelResult<TeeRead> {
        let mut shared = self.shared.lock();
        let mut reported_blocked = false;
        loop {
            request.check_live()?;
            if let TeePhase::Failed(error) = &shared.phase {
                return Err(ChannelError::Shared(Arc::clone(error)));
            }
            if shared.torn_down {
                return Err(ChannelError::Destroyed);
            }

            if position < shared.written {
                let len = (shared.written - position).min(wanted as u64) as usize;
                let file = shared.file.as_mut().ok_or(ChannelError::Destroyed)?;
                let mut lease = BufferLease::new(pool, len);
                file.seek(SeekFrom::Start(position))?;
                file.read_exact(&mut lease)?;
                return Ok(TeeRead::Data(lease.freeze()));
            }
            if matches!(shared.phase, TeePhase::Finalized) {
                return Ok(TeeRead::Eof);
            }

            if !reported_blocked {
                reported_blocked = true;
                MutexGuard::unlocked(&mut shared, || request.emit_blocked(position));
                continue;
            }
            self.wake.wait_for(&mut shared, self.wait_slice);
        }
    }
}

/// Copies the source into the working file until end of stream or error.
fn copy_source(
    context: Arc<TeeContext>,
    mut source: TeeSource,
    mut writer: File,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    loop {
        if context.is_torn_down() {
            debug!("Tee copy stopped for {}", context.final_path.display());
            drop(writer);
            let _ = fs::remove_file(&context.temp_path);
            return;
        }

        match source.read(&mut buffer) {
            Ok(0) => {
                context.finalize(writer);
                return;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]) {
                    context.abort(e.into());
                    return;
                }
                context.appended(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                context.abort(e.into());
                return;
            }
        }
    }
}

/// Backend serving a target populated live from a single-pass stream.
pub struct StreamTeeBackend {
    final_path: PathBuf,
    temp_path: PathBuf,
    identity: IdentityHash,
    pool: PoolHandle,
    config: StreamTeeConfig,
    default_max_chunk: u32,
    source: Mutex<Option<TeeSource>>,
    context: Mutex<Option<Arc<TeeContext>>>,
}

impl StreamTeeBackend {
    pub fn new(
        final_path: impl AsRef<Path>,
        source: impl Read + Send + 'static,
        pool: PoolHandle,
        config: &ChannelConfig,
    ) -> Self {
        let final_path = final_path.as_ref().to_path_buf();
        let mut temp_name = final_path.as_os_str().to_os_string();
        temp_name.push(config.stream_tee.temp_suffix);

        Self {
            identity: IdentityHash::for_path(&final_path),
            temp_path: PathBuf::from(temp_name),
            final_path,
            pool,
            config: config.stream_tee.clone(),
            default_max_chunk: config.request.default_max_chunk,
            source: Mutex::new(Some(Box::new(source))),
            context: Mutex::new(None),
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Whether the target is fully materialized under its final name.
    pub fn is_complete(&self) -> bool {
        match self.context.lock().as_ref() {
            Some(context) if !context.is_torn_down() => context.is_finalized(),
            _ => self.final_path.is_file(),
        }
    }

    /// Bytes of the target available on disk so far.
    pub fn bytes_written(&self) -> u64 {
        match self.context.lock().as_ref() {
            Some(context) if !context.is_torn_down() => context.written(),
            _ => fs::metadata(&self.final_path).map(|m| m.len()).unwrap_or(0),
        }
    }

    /// Channels currently attached to the active context.
    pub fn live_channels(&self) -> usize {
        self.context
            .lock()
            .as_ref()
            .filter(|context| !context.is_torn_down())
            .map_or(0, |context| context.live_channels())
    }

    /// Tears the active context down. Attached channels are destroyed and a
    /// partially written file is deleted.
    pub fn reset(&self) {
        if let Some(context) = self.context.lock().take() {
            info!("Resetting tee for {}", self.final_path.display());
            context.reset();
        }
    }

    /// Starts a context with `channel` already counted, before the copy
    /// thread can reach end of stream.
    fn start_context(&self, channel: &Arc<ChannelState>) -> ChannelResult<Arc<TeeContext>> {
        if self.final_path.is_file() {
            let file = File::open(&self.final_path)?;
            let length = file.metadata()?.len();
            debug!("Serving completed target {}", self.final_path.display());
            let context = Arc::new(TeeContext::new(
                &self.final_path,
                &self.temp_path,
                TeePhase::Finalized,
                file,
                length,
                self.config.wait_slice,
            ));
            context.attach(channel);
            return Ok(context);
        }

        let source = self.source.lock().take().ok_or(ChannelError::SourceExhausted)?;
        let writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)?;
        let reader = File::open(&self.temp_path)?;
        let context = Arc::new(TeeContext::new(
            &self.final_path,
            &self.temp_path,
            TeePhase::Copying,
            reader,
            0,
            self.config.wait_slice,
        ));
        context.attach(channel);

        let copier = Arc::clone(&context);
        let buffer_size = self.config.copy_buffer_size;
        std::thread::Builder::new()
            .name("riptide-tee-copy".to_string())
            .spawn(move || copy_source(copier, source, writer, buffer_size))?;
        info!(
            "Started tee of live stream into {}",
            self.temp_path.display()
        );
        Ok(context)
    }
}

impl ChannelBackend for StreamTeeBackend {
    fn identity(&self) -> Option<IdentityHash> {
        Some(self.identity)
    }

    fn length(&self) -> Option<u64> {
        self.is_complete().then(|| self.bytes_written())
    }

    /// # Errors
    ///
    /// - `ChannelError::SourceExhausted` - If the source was consumed by an earlier, failed context
    /// - `ChannelError::Io` - If the working file cannot be created or the copy thread cannot start
    fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>> {
        let state = ChannelState::new();
        let context = {
            let mut slot = self.context.lock();
            match slot.as_ref() {
                Some(context) if context.try_attach(&state) => Arc::clone(context),
                _ => {
                    let context = self.start_context(&state)?;
                    *slot = Some(Arc::clone(&context));
                    context
                }
            }
        };

        Ok(Arc::new(StreamTeeChannel {
            state,
            reader: Arc::new(TeeReader {
                context,
                pool: Arc::clone(&self.pool),
            }),
            identity: self.identity,
            default_max_chunk: self.default_max_chunk,
            detached: AtomicBool::new(false),
        }))
    }
}

/// Channel reading from a tee context.
///
/// Dropping the channel destroys it.
pub struct StreamTeeChannel {
    state: Arc<ChannelState>,
    reader: Arc<TeeReader>,
    identity: IdentityHash,
    default_max_chunk: u32,
    detached: AtomicBool,
}

impl Channel for StreamTeeChannel {
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
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.reader.context.detach();
        }
    }
}

impl Drop for StreamTeeChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct TeeReader {
    context: Arc<TeeContext>,
    pool: PoolHandle,
}

impl RequestReader for TeeReader {
    fn read(&self, request: &RequestCore) -> ChannelResult<()> {
        let settings = request.settings();
        let mut position = settings.offset;
        loop {
            request.check_live()?;
            let wanted = settings.next_chunk_len(position);
            if wanted == 0 {
                return Ok(());
            }

            match self.context.read_chunk(request, &self.pool, position, wanted)? {
                TeeRead::Data(buffer) => {
                    let len = buffer.len() as u64;
                    request.emit_success(buffer, position)?;
                    position += len;
                }
                TeeRead::Eof if settings.is_unbounded() => return Ok(()),
                TeeRead::Eof => return Err(settings.premature_eof(position)),
            }
        }
    }

    fn interrupt(&self) {
        self.context.interrupt();
    }

    fn available_bytes(&self, position: u64) -> Option<u64> {
        Some(self.context.written().saturating_sub(position))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::channel::TO_END;
    use crate::test_fixtures::{CountingBufferPool, EventRecorder, pattern_bytes};

    /// Source fed chunk by chunk from the test; ends when the sender drops.
    struct FeedSource {
        receiver: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for FeedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.receiver.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn feed() -> (mpsc::Sender<Vec<u8>>, FeedSource) {
        let (sender, receiver) = mpsc::channel();
        (
            sender,
            FeedSource {
                receiver,
                pending: Vec::new(),
            },
        )
    }

    /// Delivers its data, then fails once the test triggers it.
    struct BrokenSource {
        data: Option<Vec<u8>>,
        trigger: mpsc::Receiver<()>,
    }

    impl Read for BrokenSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(data) = self.data.take() {
                buf[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
            let _ = self.trigger.recv();
            Err(io::Error::other("source broke"))
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn spawn_read(channel: Arc<dyn Channel>, offset: u64, length: u64) -> thread::JoinHandle<EventRecorder> {
        thread::spawn(move || {
            let request = channel.create_request();
            request.set_offset(offset);
            request.set_length(length);
            let recorder = EventRecorder::new();
            request.add_listener(recorder.listener());
            request.run();
            recorder
        })
    }

    #[test]
    fn test_reader_blocks_until_bytes_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("live.bin");
        let pool = CountingBufferPool::new();
        let (sender, source) = feed();
        let backend = StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());

        sender.send(pattern_bytes(0, 1000)).unwrap();
        let channel = backend.create_channel().unwrap();
        let reader = spawn_read(Arc::clone(&channel), 0, 3000);

        thread::sleep(Duration::from_millis(100));
        assert!(!reader.is_finished());

        sender.send(pattern_bytes(1000, 3000)).unwrap();
        let recorder = reader.join().unwrap();
        assert!(recorder.failures().is_empty(), "{:?}", recorder.failures());
        assert_eq!(recorder.bytes(), pattern_bytes(0, 3000));
        assert!(!recorder.blocked_offsets().is_empty());

        drop(sender);
        wait_until(|| backend.is_complete());
        assert!(target.exists());
        assert!(!backend.temp_path().exists());
        assert_eq!(fs::read(&target).unwrap(), pattern_bytes(0, 3000));
        assert_eq!(backend.length(), Some(3000));

        // A reader after finalization sees the same bytes without waiting.
        let late = spawn_read(backend.create_channel().unwrap(), 0, TO_END).join().unwrap();
        assert_eq!(late.bytes(), pattern_bytes(0, 3000));
        assert!(late.blocked_offsets().is_empty());
        assert!(late.failures().is_empty());

        drop(channel);
        assert_eq!(backend.live_channels(), 0);
        assert!(target.exists());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_two_channels_share_one_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shared.bin");
        let pool = CountingBufferPool::new();
        let (sender, source) = feed();
        let backend = StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());

        let first = spawn_read(backend.create_channel().unwrap(), 500, 5000);
        let second = spawn_read(backend.create_channel().unwrap(), 500, 5000);
        assert_eq!(backend.live_channels(), 2);

        for start in (0..6000).step_by(1500) {
            sender.send(pattern_bytes(start, start + 1500)).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        drop(sender);

        let first = first.join().unwrap();
        let second = second.join().unwrap();
        assert_eq!(first.bytes(), pattern_bytes(500, 5500));
        assert_eq!(first.bytes(), second.bytes());

        wait_until(|| backend.is_complete());
        assert_eq!(fs::read(&target).unwrap(), pattern_bytes(0, 6000));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_existing_target_served_without_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("done.bin");
        fs::write(&target, pattern_bytes(0, 2048)).unwrap();
        let pool = CountingBufferPool::new();
        let backend = StreamTeeBackend::new(
            &target,
            io::empty(),
            pool.handle(),
            &ChannelConfig::for_testing(),
        );

        assert!(backend.is_complete());
        let recorder = spawn_read(backend.create_channel().unwrap(), 0, TO_END).join().unwrap();

        assert!(recorder.failures().is_empty());
        assert_eq!(recorder.bytes(), pattern_bytes(0, 2048));
        assert!(!backend.temp_path().exists());
    }

    #[test]
    fn test_source_error_fails_all_channels_and_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("broken.bin");
        let pool = CountingBufferPool::new();
        let (trigger, armed) = mpsc::channel();
        let backend = StreamTeeBackend::new(
            &target,
            BrokenSource {
                data: Some(pattern_bytes(0, 100)),
                trigger: armed,
            },
            pool.handle(),
            &ChannelConfig::for_testing(),
        );

        let first = backend.create_channel().unwrap();
        let second = backend.create_channel().unwrap();
        let first_reader = spawn_read(Arc::clone(&first), 0, TO_END);
        let second_reader = spawn_read(Arc::clone(&second), 0, TO_END);
        wait_until(|| backend.bytes_written() == 100);
        trigger.send(()).unwrap();
        let first_events = first_reader.join().unwrap();
        let second_events = second_reader.join().unwrap();

        let first_failures = first_events.failures();
        let second_failures = second_events.failures();
        assert_eq!(first_failures.len(), 1);
        assert_eq!(second_failures.len(), 1);
        assert!(Arc::ptr_eq(&first_failures[0], &second_failures[0]));
        assert!(first_failures[0].to_string().contains("source broke"));

        assert!(first.is_destroyed());
        assert!(!backend.temp_path().exists());
        assert!(!target.exists());
        assert!(matches!(
            backend.create_channel().map(|_| ()),
            Err(ChannelError::SourceExhausted)
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_reset_destroys_channels_and_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("reset.bin");
        let pool = CountingBufferPool::new();
        let (sender, source) = feed();
        let backend = StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());

        let channel = backend.create_channel().unwrap();
        sender.send(pattern_bytes(0, 500)).unwrap();
        wait_until(|| backend.bytes_written() == 500);
        assert_eq!(channel.create_request().available_bytes(), Some(500));

        let reader = spawn_read(Arc::clone(&channel), 0, TO_END);
        thread::sleep(Duration::from_millis(50));
        backend.reset();

        let recorder = reader.join().unwrap();
        assert_eq!(recorder.failures().len(), 1);
        assert!(matches!(*recorder.failures()[0], ChannelError::Destroyed));
        assert!(channel.is_destroyed());
        assert!(!backend.temp_path().exists());
        assert!(!target.exists());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_short_source_never_destroys_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..200 {
            let target = dir.path().join(format!("short-{round}.bin"));
            let pool = CountingBufferPool::new();
            let backend = StreamTeeBackend::new(
                &target,
                io::Cursor::new(vec![7u8; 16]),
                pool.handle(),
                &ChannelConfig::for_testing(),
            );

            let channel = backend.create_channel().unwrap();
            assert_eq!(backend.live_channels(), 1);
            let request = channel.create_request();
            request.set_length(TO_END);
            let recorder = EventRecorder::new();
            request.add_listener(recorder.listener());
            request.run();

            assert!(recorder.failures().is_empty(), "round {round}: {:?}", recorder.failures());
            assert_eq!(recorder.bytes(), vec![7u8; 16]);
            wait_until(|| backend.is_complete());
            assert_eq!(backend.live_channels(), 1);

            drop(channel);
            assert_eq!(backend.live_channels(), 0);
            assert_eq!(pool.outstanding(), 0);
        }
    }

    #[test]
    fn test_cancel_wakes_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cancel.bin");
        let pool = CountingBufferPool::new();
        let (_sender, source) = feed();
        let backend = StreamTeeBackend::new(&target, source, pool.handle(), &ChannelConfig::for_testing());
        let channel = backend.create_channel().unwrap();

        let request = channel.create_request();
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        let running = request.clone();
        let handle = thread::spawn(move || running.run());

        wait_until(|| !recorder.blocked_offsets().is_empty());
        request.cancel();
        handle.join().unwrap();

        assert!(recorder.failures()[0].is_cancellation());
        backend.reset();
    }
}
