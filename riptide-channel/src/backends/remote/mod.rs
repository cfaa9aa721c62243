//! HTTP(S) range requests against a remote resource.
//!
//! Each request opens one HTTP exchange, follows 301/302 redirects itself
//! with loop detection, retries once after installing a certificate when
//! TLS verification fails, and streams the body in pooled chunks.

pub mod redirect;

use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{CONNECTION, LOCATION, RANGE, USER_AGENT};
use reqwest::{Certificate, StatusCode};
use tracing::{debug, info, trace, warn};
use url::{Host, Url};

pub use redirect::RedirectCache;

use crate::buffer::{BufferLease, PoolHandle};
use crate::channel::{
    Channel, ChannelBackend, ChannelError, ChannelResult, ChannelState, IdentityHash, Request,
    RequestCore, RequestReader, RequestSettings,
};
use crate::config::{ChannelConfig, RemoteConfig};

/// Supplies an extra trusted certificate when TLS verification of `url`
/// fails. Consulted at most once per request.
pub trait CertificateInstaller: Send + Sync {
    fn install(&self, url: &Url) -> Option<Certificate>;
}

impl<F> CertificateInstaller for F
where
    F: Fn(&Url) -> Option<Certificate> + Send + Sync,
{
    fn install(&self, url: &Url) -> Option<Certificate> {
        self(url)
    }
}

/// Backend serving a remote HTTP(S) resource.
pub struct RemoteUrlBackend {
    url: Url,
    identity: IdentityHash,
    pool: PoolHandle,
    config: RemoteConfig,
    default_max_chunk: u32,
    length: Option<u64>,
    redirects: Arc<RedirectCache>,
    installer: Option<Arc<dyn CertificateInstaller>>,
    clients: Arc<HttpClients>,
}

impl RemoteUrlBackend {
    /// # Errors
    ///
    /// - `ChannelError::InvalidUrl` - If `url` cannot be parsed
    pub fn new(url: &str, pool: PoolHandle, config: &ChannelConfig) -> ChannelResult<Self> {
        let url = Url::parse(url)?;
        Ok(Self {
            identity: IdentityHash::for_url(&url),
            url,
            pool,
            config: config.remote.clone(),
            default_max_chunk: config.request.default_max_chunk,
            length: None,
            redirects: Arc::new(RedirectCache::new()),
            installer: None,
            clients: Arc::new(HttpClients::new(config.remote.clone())),
        })
    }

    /// Declares the resource length reported by [`ChannelBackend::length`].
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Shares a redirect cache with other backends for the same resource.
    pub fn with_redirect_cache(mut self, cache: Arc<RedirectCache>) -> Self {
        self.redirects = cache;
        self
    }

    pub fn with_certificate_installer(mut self, installer: Arc<dyn CertificateInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn redirect_cache(&self) -> &Arc<RedirectCache> {
        &self.redirects
    }
}

impl ChannelBackend for RemoteUrlBackend {
    fn identity(&self) -> Option<IdentityHash> {
        Some(self.identity)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn create_channel(&self) -> ChannelResult<Arc<dyn Channel>> {
        debug!("Opening remote channel on {}", self.url);
        Ok(Arc::new(RemoteUrlChannel {
            state: ChannelState::new(),
            reader: Arc::new(RemoteUrlReader {
                url: self.url.clone(),
                pool: Arc::clone(&self.pool),
                config: self.config.clone(),
                redirects: Arc::clone(&self.redirects),
                installer: self.installer.clone(),
                clients: Arc::clone(&self.clients),
            }),
            identity: self.identity,
            default_max_chunk: self.default_max_chunk,
        }))
    }
}

/// Channel over a remote resource.
pub struct RemoteUrlChannel {
    state: Arc<ChannelState>,
    reader: Arc<RemoteUrlReader>,
    identity: IdentityHash,
    default_max_chunk: u32,
}

impl Channel for RemoteUrlChannel {
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

/// Blocking HTTP clients, rebuilt when a new root certificate is trusted.
struct HttpClients {
    config: RemoteConfig,
    roots: Mutex<Vec<Certificate>>,
    strict: Mutex<Option<Client>>,
    relaxed: Mutex<Option<Client>>,
}

impl HttpClients {
    fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            roots: Mutex::new(Vec::new()),
            strict: Mutex::new(None),
            relaxed: Mutex::new(None),
        }
    }

    /// Client for `url`. Hosts given as IP literals use a client that
    /// accepts certificates issued for IP addresses only.
    fn client(&self, url: &Url) -> ChannelResult<Client> {
        let relaxed = matches!(url.host(), Some(Host::Ipv4(_) | Host::Ipv6(_)));
        let slot = if relaxed { &self.relaxed } else { &self.strict };

        let mut slot = slot.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .danger_accept_invalid_hostnames(relaxed);
        for root in self.roots.lock().iter() {
            builder = builder.add_root_certificate(root.clone());
        }
        let client = builder.build()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    fn trust(&self, certificate: Certificate) {
        self.roots.lock().push(certificate);
        *self.strict.lock() = None;
        *self.relaxed.lock() = None;
    }
}

/// `Range` header value, or `None` when the whole resource is wanted.
fn range_header(settings: &RequestSettings) -> Option<String> {
    match settings.end() {
        Some(end) => Some(format!("bytes={}-{}", settings.offset, end - 1)),
        None if settings.offset > 0 => Some(format!("bytes={}-", settings.offset)),
        None => None,
    }
}

/// Whether a transport error was caused by certificate verification.
fn is_certificate_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.to_string().to_lowercase().contains("certificate") {
            return true;
        }
        current = err.source();
    }
    false
}

enum BodyRead {
    Filled(usize),
    Stalled(io::Error),
    Ended,
}

/// Fills `buf` from the body. A read that would block or time out before
/// any byte arrived is a stall rather than an error.
///
/// The blocking reqwest body reports a read that outlives the client read
/// timeout as `TimedOut`. Non-blocking body readers report `WouldBlock`.
fn read_body_chunk<R: Read + ?Sized>(body: &mut R, buf: &mut [u8]) -> io::Result<BodyRead> {
    let mut filled = 0;
    while filled < buf.len() {
        match body.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(BodyRead::Ended),
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(if filled == 0 {
                    BodyRead::Stalled(e)
                } else {
                    BodyRead::Filled(filled)
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(BodyRead::Filled(filled))
}

/// Streams a response body through `request`, starting at the request
/// offset. Stalls are reported as blocked events.
///
/// A timeout before the first byte fails the request. Once data has been
/// delivered, up to `max_stalls` consecutive timeouts are reported as
/// blocked and the read carries on.
fn stream_body<R: Read + ?Sized>(
    request: &RequestCore,
    pool: &PoolHandle,
    body: &mut R,
    max_stalls: u32,
) -> ChannelResult<()> {
    let settings = request.settings();
    let mut position = settings.offset;
    let mut stalls = 0;
    loop {
        request.check_live()?;

        let wanted = settings.next_chunk_len(position);
        if wanted == 0 {
            return Ok(());
        }

        let mut lease = BufferLease::new(pool, wanted);
        match read_body_chunk(body, &mut lease)? {
            BodyRead::Filled(filled) => {
                stalls = 0;
                lease.truncate(filled);
                request.emit_success(lease.freeze(), position)?;
                position += filled as u64;
            }
            BodyRead::Stalled(error) if error.kind() == io::ErrorKind::TimedOut => {
                stalls += 1;
                if position == settings.offset || stalls > max_stalls {
                    debug!(position, stalls, "Body read timed out");
                    return Err(error.into());
                }
                trace!(position, stalls, "Body read timed out, waiting for more");
                request.emit_blocked(position);
            }
            BodyRead::Stalled(_) => {
                trace!(position, "Body stalled");
                request.emit_blocked(position);
            }
            BodyRead::Ended if settings.is_unbounded() => return Ok(()),
            BodyRead::Ended => return Err(settings.premature_eof(position)),
        }
    }
}

struct RemoteUrlReader {
    url: Url,
    pool: PoolHandle,
    config: RemoteConfig,
    redirects: Arc<RedirectCache>,
    installer: Option<Arc<dyn CertificateInstaller>>,
    clients: Arc<HttpClients>,
}

impl RemoteUrlReader {
    /// Runs the HTTP exchange starting at `start`, returning the URL that
    /// finally served the body.
    fn fetch(&self, request: &RequestCore, settings: &RequestSettings, start: Url) -> ChannelResult<Url> {
        let range = range_header(settings);
        let user_agent = settings
            .user_agent
            .clone()
            .unwrap_or_else(|| self.config.user_agent.to_string());

        let mut url = start;
        let mut visited = HashSet::from([url.to_string()]);
        let mut hops = 0;
        let mut certificate_retried = false;

        loop {
            request.check_live()?;

            let client = self.clients.client(&url)?;
            let mut builder = client
                .get(url.clone())
                .header(CONNECTION, "keep-alive")
                .header(USER_AGENT, user_agent.as_str());
            if let Some(range) = &range {
                builder = builder.header(RANGE, range.as_str());
            }

            let response = match builder.send() {
                Ok(response) => response,
                Err(error) if is_certificate_error(&error) => {
                    if !certificate_retried
                        && let Some(installer) = &self.installer
                        && let Some(certificate) = installer.install(&url)
                    {
                        warn!("Certificate rejected for {}, retrying with installed certificate", url);
                        certificate_retried = true;
                        self.clients.trust(certificate);
                        continue;
                    }
                    return Err(ChannelError::CertificateRejected {
                        url: url.to_string(),
                    });
                }
                Err(error) => return Err(error.into()),
            };

            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::ACCEPTED | StatusCode::PARTIAL_CONTENT => {
                    let mut body = response;
                    if status == StatusCode::OK && range.is_some() && settings.offset > 0 {
                        // Server ignored the range and sent the whole resource.
                        let skipped =
                            io::copy(&mut (&mut body).take(settings.offset), &mut io::sink())?;
                        if skipped < settings.offset {
                            return Err(settings.premature_eof(settings.offset));
                        }
                    }
                    stream_body(request, &self.pool, &mut body, self.config.max_body_stalls)?;
                    return Ok(url);
                }
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| ChannelError::UnexpectedStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        })?;
                    let next = url.join(location)?;
                    hops += 1;
                    if hops > self.config.max_redirects || !visited.insert(next.to_string()) {
                        warn!("Redirect loop at {} after {} hops", next, hops);
                        return Err(ChannelError::RedirectLoop {
                            url: next.to_string(),
                            hops,
                        });
                    }
                    debug!("Following redirect {} -> {}", url, next);
                    url = next;
                }
                other => {
                    return Err(ChannelError::UnexpectedStatus {
                        status: other.as_u16(),
                        url: url.to_string(),
                    });
                }
            }
        }
    }
}

impl RequestReader for RemoteUrlReader {
    fn read(&self, request: &RequestCore) -> ChannelResult<()> {
        let settings = request.settings();
        if settings.next_chunk_len(settings.offset) == 0 {
            return Ok(());
        }

        let start = self.redirects.resolve(&self.url);
        let from_cache = start != self.url;
        if from_cache {
            trace!("Starting at cached redirect {}", start);
        }

        match self.fetch(request, &settings, start) {
            Ok(final_url) => {
                self.redirects.record_success(&self.url, &final_url);
                Ok(())
            }
            Err(error) => {
                let consumer_ended =
                    error.is_cancellation() || matches!(error, ChannelError::Destroyed | ChannelError::Shared(_));
                if from_cache
                    && !consumer_ended
                    && self
                        .redirects
                        .record_failure(&self.url, self.config.redirect_failure_limit)
                {
                    info!("Next request for {} starts from the original URL", self.url);
                }
                Err(error)
            }
        }
    }
}
