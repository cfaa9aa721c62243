//! Masked channels and the pull bridge stacked on every backend kind.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use riptide_channel::test_fixtures::{CountingBufferPool, pattern_bytes, temp_pattern_file};
use riptide_channel::{
    Channel, ChannelBackend, ChannelConfig, ChannelError, DelegateMaskBackend, LocalFileBackend,
    RemoteUrlBackend, StreamTeeBackend,
};

use crate::support::{SERVED_LEN, feed, start_server};

#[test]
fn test_pull_reader_over_remote_resource() {
    let server = start_server();
    let pool = CountingBufferPool::new();
    let remote = RemoteUrlBackend::new(&server.url("/data.bin"), pool.handle(), &ChannelConfig::for_testing())
        .unwrap()
        .with_length(SERVED_LEN);
    let inner_identity = remote.identity().unwrap();

    let masked = DelegateMaskBackend::new(Arc::new(remote));
    assert_eq!(masked.identity(), Some(inner_identity.masked()));
    assert_ne!(masked.identity(), Some(inner_identity));

    let channel = masked.open().unwrap();
    assert_eq!(channel.identity(), inner_identity.masked());

    let mut reader = channel.pull_reader();
    assert_eq!(reader.len(), Some(SERVED_LEN));
    reader.seek(SeekFrom::End(-1000)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, pattern_bytes(SERVED_LEN - 1000, SERVED_LEN));
    assert_eq!(reader.position(), SERVED_LEN);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_pull_reader_blocks_on_live_stream() {
    let dir = tempfile::tempdir().unwrap();
    let pool = CountingBufferPool::new();
    let (sender, source) = feed();
    let tee = StreamTeeBackend::new(
        dir.path().join("live.bin"),
        source,
        pool.handle(),
        &ChannelConfig::for_testing(),
    );
    let channel = DelegateMaskBackend::new(Arc::new(tee)).open().unwrap();

    let reader = channel.pull_reader();
    let pending = thread::spawn(move || {
        let mut buf = vec![0u8; 3000];
        let read = reader.read_at(500, &mut buf);
        (read, buf)
    });

    sender.send(pattern_bytes(0, 2000)).unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(!pending.is_finished());

    sender.send(pattern_bytes(2000, 4000)).unwrap();
    let (read, buf) = pending.join().unwrap();
    assert_eq!(read.unwrap(), 3000);
    assert_eq!(buf, pattern_bytes(500, 3500));

    // Once the stream ends a read past the end comes back short.
    drop(sender);
    let mut tail = vec![0u8; 1000];
    let read = channel.pull_reader().read_at(3500, &mut tail).unwrap();
    assert_eq!(read, 500);
    assert_eq!(&tail[..500], pattern_bytes(3500, 4000).as_slice());
}

#[test]
fn test_destroying_masked_channel_destroys_inner() {
    let (_dir, path) = temp_pattern_file("inner.bin", 4096);
    let local = LocalFileBackend::new(&path, CountingBufferPool::new().handle(), &ChannelConfig::for_testing());
    let channel = DelegateMaskBackend::new(Arc::new(local)).open().unwrap();
    let reader = channel.pull_reader();

    channel.destroy();
    assert!(channel.is_destroyed());

    let mut buf = [0u8; 16];
    let error = reader.read_at(0, &mut buf).unwrap_err();
    assert!(matches!(error, ChannelError::Shared(ref inner) if matches!(**inner, ChannelError::Destroyed)));
}

proptest! {
    #[test]
    fn test_pull_reads_match_file_contents(
        reads in proptest::collection::vec((0u64..12_000, 1usize..6000), 1..12)
    ) {
        let (_dir, path) = temp_pattern_file("random.bin", 10_000);
        let local = LocalFileBackend::new(&path, CountingBufferPool::new().handle(), &ChannelConfig::for_testing());
        let channel = DelegateMaskBackend::new(Arc::new(local)).open().unwrap();
        let reader = channel.pull_reader();

        for (offset, len) in reads {
            let mut buf = vec![0u8; len];
            let read = reader.read_at(offset, &mut buf).unwrap();
            let start = offset.min(10_000);
            let end = (offset + len as u64).min(10_000);
            prop_assert_eq!(read as u64, end - start);
            let expected = pattern_bytes(start, end);
            prop_assert_eq!(&buf[..read], expected.as_slice());
        }
    }
}
