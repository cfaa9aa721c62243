//! Fixtures shared across the integration suites.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use riptide_channel::test_fixtures::pattern_bytes;
use riptide_channel::{BlockId, OutboundQueue, PieceMessage};

/// Length of the file every fixture server route serves.
pub const SERVED_LEN: u64 = 20_000;

/// Polls `condition` until it holds, panicking after two seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Source stream fed chunk by chunk from the test thread. Ends when the
/// sender is dropped.
pub struct FeedSource {
    chunks: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    at: usize,
}

pub fn feed() -> (mpsc::Sender<Vec<u8>>, FeedSource) {
    let (sender, chunks) = mpsc::channel();
    (
        sender,
        FeedSource {
            chunks,
            current: Vec::new(),
            at: 0,
        },
    )
}

impl Read for FeedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.at == self.current.len() {
            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.at = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.at);
        buf[..n].copy_from_slice(&self.current[self.at..self.at + n]);
        self.at += n;
        Ok(n)
    }
}

pub fn atom(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn chunk_offsets(entries: &[u32]) -> Vec<u8> {
    let mut body = vec![0, 0, 0, 0];
    body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        body.extend_from_slice(&entry.to_be_bytes());
    }
    atom(b"stco", &body)
}

/// A media file with its index after the sample data.
pub struct SlowStartMovie {
    pub bytes: Vec<u8>,
    pub ftyp_len: usize,
    pub moov_len: usize,
    /// Physical offsets the index points at, inside the mdat payload.
    pub sample_offsets: Vec<u32>,
}

pub fn slow_start_movie(payload_len: usize) -> SlowStartMovie {
    let ftyp = atom(b"ftyp", b"isom\0\0\0\0");
    let payload: Vec<u8> = (0..payload_len).map(|i| (i * 7 % 256) as u8).collect();
    let mdat = atom(b"mdat", &payload);

    let data_start = (ftyp.len() + 8) as u32;
    let sample_offsets = vec![data_start, data_start + payload_len as u32 / 2];
    let stbl = atom(b"stbl", &chunk_offsets(&sample_offsets));
    let trak = atom(b"trak", &atom(b"mdia", &atom(b"minf", &stbl)));
    let mut moov_body = atom(b"mvhd", &[0u8; 12]);
    moov_body.extend_from_slice(&trak);
    let moov = atom(b"moov", &moov_body);

    let ftyp_len = ftyp.len();
    let moov_len = moov.len();
    let mut bytes = ftyp;
    bytes.extend_from_slice(&mdat);
    bytes.extend_from_slice(&moov);
    SlowStartMovie {
        bytes,
        ftyp_len,
        moov_len,
        sample_offsets,
    }
}

/// Reads the `stco` entries of a serialized moov atom.
pub fn stco_entries(moov: &[u8]) -> Vec<u32> {
    let at = moov
        .windows(4)
        .position(|window| window == b"stco")
        .expect("moov has a chunk offset table");
    let count = u32::from_be_bytes(moov[at + 8..at + 12].try_into().unwrap()) as usize;
    (0..count)
        .map(|i| {
            let start = at + 12 + i * 4;
            u32::from_be_bytes(moov[start..start + 4].try_into().unwrap())
        })
        .collect()
}

/// Local HTTP server on its own runtime serving a pattern file.
pub struct FixtureServer {
    pub base: String,
    pub mirror_hits: Arc<AtomicUsize>,
    _runtime: tokio::runtime::Runtime,
}

impl FixtureServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = match end {
        "" => SERVED_LEN - 1,
        end => end.parse().ok()?,
    };
    Some((start, end.min(SERVED_LEN - 1)))
}

async fn serve_pattern(headers: HeaderMap) -> Response {
    match parse_range(&headers) {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{SERVED_LEN}"),
            )],
            pattern_bytes(start, end + 1),
        )
            .into_response(),
        None => (StatusCode::OK, pattern_bytes(0, SERVED_LEN)).into_response(),
    }
}

pub fn start_server() -> FixtureServer {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mirror_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&mirror_hits);

    let app = Router::new()
        .route("/mirror/data.bin", get(serve_pattern))
        .route(
            "/data.bin",
            get(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                async {
                    (
                        StatusCode::FOUND,
                        [(header::LOCATION, "/mirror/data.bin")],
                    )
                        .into_response()
                }
            }),
        );

    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let address = listener.local_addr().unwrap();
    runtime.spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FixtureServer {
        base: format!("http://{address}"),
        mirror_hits,
        _runtime: runtime,
    }
}

/// Outbound queue handing every message to the test thread.
pub struct ForwardingOutbound {
    sender: mpsc::Sender<PieceMessage>,
}

impl ForwardingOutbound {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PieceMessage>) {
        let (sender, receiver) = mpsc::channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl OutboundQueue for ForwardingOutbound {
    fn enqueue(&self, message: PieceMessage) {
        let _ = self.sender.send(message);
    }

    fn withdraw(&self, _id: BlockId) -> bool {
        false
    }
}
