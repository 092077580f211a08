use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::auth::{Upstream, UpstreamScheme};
use crate::config::ServerSettings;
use crate::dialer::CONNECT_TIMEOUT;

/// TCP keep-alive applied to pooled client connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// How often the cache sweeper wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Idle age past which a cached transport is evicted.
pub const SWEEP_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Chrome opens far more connections per host than other clients; give its
/// transports more idle-pool headroom.
const CHROME_MIN_IDLE_PER_HOST: usize = 20;
const CHROME_MIN_IDLE_TOTAL: usize = 200;

const CHROME_USER_AGENT_PATTERNS: &[&str] = &["chrome/", "chromium/", "crios/", "edg/"];

/// Detects Chrome/Chromium-family clients from the User-Agent header.
pub fn is_chrome_browser(user_agent: &str) -> bool {
    let lower = user_agent.to_ascii_lowercase();
    CHROME_USER_AGENT_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Connection-pool knobs shared by every transport this process builds.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub expect_continue_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl From<&ServerSettings> for TransportSettings {
    fn from(server: &ServerSettings) -> Self {
        Self {
            max_idle_conns: server.max_idle_conns,
            max_idle_conns_per_host: server.max_idle_conns_per_host,
            idle_conn_timeout: Duration::from_secs(server.idle_conn_timeout),
            tls_handshake_timeout: Duration::from_secs(server.tls_handshake_timeout),
            expect_continue_timeout: Duration::from_secs(server.expect_continue_timeout),
            read_buffer_size: server.read_buffer_size,
            write_buffer_size: server.write_buffer_size,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid upstream proxy address: {0}")]
    ProxyAddress(#[from] url::ParseError),
    #[error("failed to build transport: {0}")]
    Client(#[from] reqwest::Error),
}

fn base_builder(settings: &TransportSettings) -> reqwest::ClientBuilder {
    // Compression stays off (the crate is built without the compression
    // features) and upstream TLS verification stays on.
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(settings.idle_conn_timeout)
        .pool_max_idle_per_host(settings.max_idle_conns_per_host)
        .redirect(reqwest::redirect::Policy::none())
}

/// Pooled transport for direct round-trips from this proxy's own network.
pub fn direct_client(settings: &TransportSettings) -> Result<reqwest::Client, TransportError> {
    Ok(base_builder(settings).build()?)
}

/// Direct transport tuned for Chrome's aggressive multi-tab connection
/// behaviour.
pub fn chrome_client(settings: &TransportSettings) -> Result<reqwest::Client, TransportError> {
    let mut tuned = settings.clone();
    tuned.max_idle_conns_per_host = tuned.max_idle_conns_per_host.max(CHROME_MIN_IDLE_PER_HOST);
    tuned.max_idle_conns = tuned.max_idle_conns.max(CHROME_MIN_IDLE_TOTAL);
    Ok(base_builder(&tuned).build()?)
}

/// Pooled transport forwarding everything through the given upstream proxy.
pub fn upstream_client(
    upstream: &Upstream,
    settings: &TransportSettings,
) -> Result<reqwest::Client, TransportError> {
    let proxy = match upstream.scheme {
        UpstreamScheme::Http => {
            let mut proxy =
                reqwest::Proxy::all(format!("http://{}:{}", upstream.host, upstream.port))?;
            if let Some(credentials) = &upstream.credentials {
                proxy = proxy.basic_auth(&credentials.username, &credentials.password);
            }
            proxy
        }
        UpstreamScheme::Socks5 => {
            // socks5h: the upstream resolves target hostnames, not us
            let mut url = Url::parse(&format!("socks5h://{}:{}", upstream.host, upstream.port))?;
            if let Some(credentials) = &upstream.credentials {
                url.set_username(&credentials.username).ok();
                url.set_password(Some(&credentials.password)).ok();
            }
            reqwest::Proxy::all(url)?
        }
    };

    Ok(base_builder(settings).proxy(proxy).build()?)
}

struct CacheEntry {
    client: reqwest::Client,
    /// Milliseconds since the cache was created; a relaxed atomic keeps the
    /// read path lock-free.
    last_used_ms: AtomicU64,
}

/// Cache of upstream transports keyed by `scheme:host:port`.
///
/// Entries are reused across requests to amortise connection setup and
/// evicted by the sweeper once idle. Concurrent creation for the same key
/// is allowed; the transports are functionally equivalent, so the last
/// writer wins.
pub struct TransportCache {
    settings: TransportSettings,
    entries: DashMap<String, CacheEntry>,
    started: Instant,
}

impl TransportCache {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Returns the cached transport for this upstream, building one on the
    /// first use of a `(scheme, host, port)` triple.
    pub fn get(&self, upstream: &Upstream) -> Result<reqwest::Client, TransportError> {
        let key = upstream.cache_key();
        if let Some(entry) = self.entries.get(&key) {
            entry.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
            debug!(cache_key = %key, "using cached transport");
            return Ok(entry.client.clone());
        }

        debug!(
            cache_key = %key,
            has_auth = upstream.credentials.is_some(),
            "creating new upstream transport"
        );
        let client = upstream_client(upstream, &self.settings)?;
        self.entries.insert(
            key,
            CacheEntry {
                client: client.clone(),
                last_used_ms: AtomicU64::new(self.now_ms()),
            },
        );
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes entries idle for longer than `max_age`, returning how many
    /// were evicted. Dropping the cache's clone of a transport closes its
    /// idle pooled connections once in-flight borrows are done.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = self.now_ms();
        let mut evicted = 0;
        self.entries.retain(|key, entry| {
            let idle_ms = now.saturating_sub(entry.last_used_ms.load(Ordering::Relaxed));
            if Duration::from_millis(idle_ms) > max_age {
                debug!(cache_key = %key, idle_ms, "removing stale transport from cache");
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    #[cfg(test)]
    fn age_entry(&self, key: &str, age: Duration) {
        if let Some(entry) = self.entries.get(key) {
            let aged = self.now_ms().saturating_sub(age.as_millis() as u64);
            entry.last_used_ms.store(aged, Ordering::Relaxed);
        }
    }
}

/// Handle to the background sweep task; dropping it leaves the task
/// running, shutdown is explicit.
pub struct Sweeper {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Sweeper {
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Starts the periodic cache sweep. Runs until [`Sweeper::shutdown`].
pub fn spawn_sweeper(
    cache: std::sync::Arc<TransportCache>,
    interval: Duration,
    max_age: Duration,
) -> Sweeper {
    let token = CancellationToken::new();
    let sweep_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so the first sweep
        // happens one full interval after startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = sweep_token.cancelled() => {
                    debug!("transport cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = cache.sweep(max_age);
                    if evicted > 0 {
                        info!(evicted, remaining = cache.len(), "transport cache sweep completed");
                    }
                }
            }
        }
    });
    info!(?interval, ?max_age, "transport cache sweeper started");
    Sweeper { token, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UpstreamCredentials;
    use std::sync::Arc;

    fn settings() -> TransportSettings {
        TransportSettings::from(&ServerSettings::default())
    }

    fn upstream(scheme: UpstreamScheme, port: u16) -> Upstream {
        Upstream {
            scheme,
            host: "127.0.0.1".into(),
            port,
            credentials: Some(UpstreamCredentials {
                username: "alice".into(),
                password: "s3cret".into(),
            }),
        }
    }

    #[test]
    fn chrome_detection_matches_known_agents() {
        assert!(is_chrome_browser(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36"
        ));
        assert!(is_chrome_browser("Mozilla/5.0 CriOS/119.0 Mobile"));
        assert!(is_chrome_browser("Mozilla/5.0 Edg/120.0"));
        assert!(is_chrome_browser("chromium/121.0"));
        assert!(!is_chrome_browser("Mozilla/5.0 (X11; Linux) Firefox/121.0"));
        assert!(!is_chrome_browser(""));
    }

    #[tokio::test]
    async fn transports_build_for_both_schemes() {
        let settings = settings();
        direct_client(&settings).expect("direct client");
        chrome_client(&settings).expect("chrome client");
        upstream_client(&upstream(UpstreamScheme::Http, 8080), &settings).expect("http upstream");
        upstream_client(&upstream(UpstreamScheme::Socks5, 1080), &settings)
            .expect("socks5 upstream");
    }

    #[tokio::test]
    async fn cache_reuses_entries_per_key() {
        let cache = TransportCache::new(settings());
        let upstream_a = upstream(UpstreamScheme::Http, 8080);

        cache.get(&upstream_a).expect("first build");
        cache.get(&upstream_a).expect("cache hit");
        assert_eq!(cache.len(), 1);

        // same endpoint, different scheme is a different transport
        cache
            .get(&upstream(UpstreamScheme::Socks5, 8080))
            .expect("second build");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_entries() {
        let cache = TransportCache::new(settings());
        let stale = upstream(UpstreamScheme::Http, 8080);
        let fresh = upstream(UpstreamScheme::Http, 8081);
        cache.get(&stale).expect("build stale");
        cache.get(&fresh).expect("build fresh");

        cache.age_entry(&stale.cache_key(), SWEEP_MAX_AGE + Duration::from_secs(1));
        let evicted = cache.sweep(SWEEP_MAX_AGE);

        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        // the surviving entry is still served from cache
        cache.get(&fresh).expect("cache hit");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn touching_an_entry_resets_its_idle_age() {
        let cache = TransportCache::new(settings());
        let upstream_a = upstream(UpstreamScheme::Http, 8080);
        cache.get(&upstream_a).expect("build");
        cache.age_entry(&upstream_a.cache_key(), SWEEP_MAX_AGE + Duration::from_secs(1));

        // a read refreshes last_used, so the sweep keeps the entry
        cache.get(&upstream_a).expect("cache hit");
        assert_eq!(cache.sweep(SWEEP_MAX_AGE), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let cache = Arc::new(TransportCache::new(settings()));
        let sweeper = spawn_sweeper(cache, Duration::from_millis(10), SWEEP_MAX_AGE);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // must resolve promptly rather than waiting for the next tick
        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .expect("sweeper shut down in time");
    }
}
