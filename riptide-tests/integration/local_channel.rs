//! Local file channels under concurrent use and fast-start serving.

use std::sync::Arc;
use std::thread;

use riptide_channel::test_fixtures::{
    CountingBufferPool, EventRecorder, pattern_bytes, temp_pattern_file,
};
use riptide_channel::{
    Channel, ChannelBackend, ChannelConfig, LocalFileBackend, RequestEvent, SharedBufferPool,
    TO_END,
};

use crate::support::{slow_start_movie, stco_entries};

fn read_range(channel: &Arc<dyn Channel>, offset: u64, length: u64) -> EventRecorder {
    let request = channel.create_request();
    request.set_offset(offset);
    request.set_length(length);
    let recorder = EventRecorder::new();
    request.add_listener(recorder.listener());
    request.run();
    recorder
}

#[test]
fn test_concurrent_requests_on_one_channel() {
    let (_dir, path) = temp_pattern_file("shared.bin", 256 * 1024);
    let pool = CountingBufferPool::new();
    let backend = LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let readers: Vec<_> = (0..8u64)
        .map(|i| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let offset = i * 32 * 1024;
                (offset, read_range(&channel, offset, 32 * 1024))
            })
        })
        .collect();

    for reader in readers {
        let (offset, recorder) = reader.join().unwrap();
        assert!(recorder.failures().is_empty());
        assert_eq!(recorder.bytes(), pattern_bytes(offset, offset + 32 * 1024));
        assert!(recorder.success_ranges().iter().all(|(_, len)| *len <= 4096));
    }
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_held_buffers_return_to_pool_when_dropped() {
    let (_dir, path) = temp_pattern_file("hold.bin", 10_000);
    let pool = CountingBufferPool::new();
    let backend = LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let held = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&held);
    let request = channel.create_request();
    request.add_listener(Arc::new(move |event: RequestEvent| {
        if let RequestEvent::Success { buffer, .. } = event {
            sink.lock().push(buffer);
        }
    }));
    request.run();

    assert_eq!(held.lock().len(), 3);
    assert_eq!(pool.outstanding(), 3);

    let last = held.lock().pop().unwrap();
    last.release();
    assert_eq!(pool.outstanding(), 2);

    held.lock().clear();
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_shared_pool_reuses_buffers_across_requests() {
    let (_dir, path) = temp_pattern_file("reuse.bin", 8192);
    let pool = Arc::new(SharedBufferPool::new(&Default::default()));
    let backend = LocalFileBackend::new(&path, pool.clone(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let first = read_range(&channel, 0, TO_END);
    assert_eq!(first.total_bytes(), 8192);
    let idle = pool.idle_buffers();
    assert!(idle >= 1);

    let second = read_range(&channel, 0, TO_END);
    assert_eq!(second.bytes(), pattern_bytes(0, 8192));
    assert_eq!(pool.idle_buffers(), idle);
}

#[test]
fn test_media_player_gets_fast_start_order() {
    let movie = slow_start_movie(6000);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.mp4");
    std::fs::write(&path, &movie.bytes).unwrap();

    let pool = CountingBufferPool::new();
    let backend = LocalFileBackend::new(&path, pool.handle(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let request = channel.create_request();
    request.set_user_agent("VLC/3.0.20 LibVLC/3.0.20");
    let recorder = EventRecorder::new();
    request.add_listener(recorder.listener());
    request.run();

    let logical = recorder.bytes();
    assert!(recorder.failures().is_empty());
    assert_eq!(logical.len(), movie.bytes.len());

    let moov = &logical[movie.ftyp_len..movie.ftyp_len + movie.moov_len];
    assert_eq!(&moov[4..8], b"moov");
    let patched = stco_entries(moov);
    for (patched, original) in patched.iter().zip(&movie.sample_offsets) {
        assert_eq!(*patched, original + movie.moov_len as u32);
        let (p, o) = (*patched as usize, *original as usize);
        assert_eq!(&logical[p..p + 16], &movie.bytes[o..o + 16]);
    }

    // Without a user agent the physical layout is served untouched.
    let plain = read_range(&channel, 0, TO_END);
    assert_eq!(plain.bytes(), movie.bytes);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_fast_start_ranged_read_matches_full_read() {
    let movie = slow_start_movie(9000);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.m4v");
    std::fs::write(&path, &movie.bytes).unwrap();

    let backend =
        LocalFileBackend::new(&path, SharedBufferPool::shared(), &ChannelConfig::for_testing());
    let channel = backend.create_channel().unwrap();

    let read = |offset: u64, length: u64| {
        let request = channel.create_request();
        request.set_user_agent("mpv");
        request.set_offset(offset);
        request.set_length(length);
        let recorder = EventRecorder::new();
        request.add_listener(recorder.listener());
        request.run();
        recorder.bytes()
    };

    let full = read(0, TO_END);
    let middle = read(20, 5000);
    assert_eq!(middle, full[20..5020]);
}
