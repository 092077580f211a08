use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

mod connect;
mod handler;
mod mitm;

pub use connect::ConnectBindings;
pub use mitm::MitmAuthority;

use crate::auth::{self, Upstream};
use crate::config::Config;
use crate::routing::Classifier;
use crate::transport::{self, TransportCache, TransportSettings, SWEEP_INTERVAL, SWEEP_MAX_AGE};

/// Deadline for in-flight connections after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Slow clients may not hold a connection open while composing headers.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on buffered request head bytes.
const MAX_HEADER_BYTES: usize = 1 << 20;

pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// Everything a request needs, shared across all connections. Built once
/// at startup; only the transport cache and CONNECT bindings mutate.
pub struct ProxyState {
    pub classifier: Classifier,
    pub direct: reqwest::Client,
    pub chrome: reqwest::Client,
    pub transports: Arc<TransportCache>,
    pub bindings: Arc<ConnectBindings>,
    pub mitm: Option<Arc<MitmAuthority>>,
    pub tunnel_read_buffer: usize,
    pub tunnel_write_buffer: usize,
}

/// Builds the process-wide proxy state from the loaded configuration.
/// Failures here are fatal: a misconfigured CA or transport must not start
/// serving.
pub fn build_state(config: &Config, ad_domains: Vec<String>) -> anyhow::Result<Arc<ProxyState>> {
    let classifier = Classifier::new(
        &config.direct_extensions,
        &config.direct_domains,
        ad_domains,
        config.ad_blocking.enabled,
    );

    let settings = TransportSettings::from(&config.server);
    let direct =
        transport::direct_client(&settings).context("failed to build direct transport")?;
    let chrome =
        transport::chrome_client(&settings).context("failed to build Chrome transport")?;
    debug!(
        max_idle_conns = settings.max_idle_conns,
        max_idle_conns_per_host = settings.max_idle_conns_per_host,
        idle_conn_timeout = ?settings.idle_conn_timeout,
        tls_handshake_timeout = ?settings.tls_handshake_timeout,
        expect_continue_timeout = ?settings.expect_continue_timeout,
        "created direct and Chrome transports"
    );

    let mitm = if config.server.https_mitm {
        let authority = match (&config.server.ca_cert, &config.server.ca_key) {
            (Some(cert), Some(key)) => {
                let authority = MitmAuthority::from_pem_files(cert, key)
                    .context("failed to load CA certificate")?;
                info!(cert = %cert.display(), "loaded custom CA certificate");
                authority
            }
            _ => {
                let authority =
                    MitmAuthority::generate().context("failed to generate CA certificate")?;
                info!("using generated CA certificate for HTTPS interception");
                warn!("clients must trust the proxy CA certificate to avoid TLS errors");
                authority
            }
        };
        Some(Arc::new(authority))
    } else {
        info!("HTTPS MITM disabled, tunneling HTTPS connections without interception");
        None
    };

    Ok(Arc::new(ProxyState {
        classifier,
        direct,
        chrome,
        transports: Arc::new(TransportCache::new(settings)),
        bindings: Arc::new(ConnectBindings::default()),
        mitm,
        tunnel_read_buffer: config.server.read_buffer_size,
        tunnel_write_buffer: config.server.write_buffer_size,
    }))
}

/// Accept loop. Runs until `shutdown` fires, then drains in-flight
/// connections within [`SHUTDOWN_GRACE`] and stops the cache sweeper.
pub async fn start(
    state: Arc<ProxyState>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let sweeper = transport::spawn_sweeper(state.transports.clone(), SWEEP_INTERVAL, SWEEP_MAX_AGE);
    let tracker = TaskTracker::new();

    info!(
        address = %listener.local_addr().context("listener has no local address")?,
        mode = "smart_proxy_auth",
        "proxy server listening"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, client_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!("failed to accept connection: {err}");
                continue;
            }
        };

        let state = state.clone();
        tracker.spawn(async move {
            serve_connection(state, socket, client_addr).await;
        });
    }

    info!("shutting down proxy server");
    sweeper.shutdown().await;
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            pending = tracker.len(),
            "graceful shutdown deadline reached, dropping remaining connections"
        );
    }

    Ok(())
}

async fn serve_connection(
    state: Arc<ProxyState>,
    socket: tokio::net::TcpStream,
    client_addr: SocketAddr,
) {
    let io = TokioIo::new(socket);
    let service = service_fn(move |req| dispatch(state.clone(), req, client_addr));

    let connection = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .max_buf_size(MAX_HEADER_BYTES)
        .serve_connection(io, service)
        .with_upgrades();

    if let Err(err) = connection.await {
        debug!(%client_addr, "connection ended with error: {err}");
    }
}

async fn dispatch(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    debug!(
        method = %req.method(),
        uri = %req.uri(),
        %client_addr,
        user_agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
        "incoming request"
    );

    if req.method() == Method::CONNECT {
        connect::handle_connect(state, req, client_addr).await
    } else {
        handler::handle_request(state, req, None, "http").await
    }
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

pub(crate) fn auth_required_response() -> Response<ProxyBody> {
    let mut response = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    response.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"SmartProxy\""),
    );
    response
}

pub(crate) fn bad_auth_response() -> Response<ProxyBody> {
    text_response(StatusCode::BAD_REQUEST, "Invalid authentication")
}

pub(crate) fn upstream_rejected_response(reason: &crate::auth::UpstreamError) -> Response<ProxyBody> {
    text_response(
        StatusCode::FORBIDDEN,
        &format!("Account password authentication failed: {reason}"),
    )
}

pub(crate) fn upstream_failed_response() -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, "Upstream connection failed")
}

/// Shared auth flow for CONNECT and plain requests: 407 without
/// credentials, 400 for malformed ones, 403 when the upstream payload does
/// not parse. On success the caller gets the decoded [`Upstream`].
pub(crate) fn authenticate(headers: &HeaderMap) -> Result<Upstream, Response<ProxyBody>> {
    let (username, password) =
        match auth::basic_credentials(headers.get(http::header::PROXY_AUTHORIZATION)) {
            Ok(pair) => pair,
            Err(auth::AuthError::Missing) => {
                debug!("no authentication provided, responding 407");
                return Err(auth_required_response());
            }
            Err(err) => {
                debug!("invalid authentication: {err}, responding 400");
                return Err(bad_auth_response());
            }
        };

    match auth::parse_upstream(&username, &password) {
        Ok(upstream) => Ok(upstream),
        Err(err) => {
            error!("failed to parse upstream from credentials: {err}");
            Err(upstream_rejected_response(&err))
        }
    }
}
