use std::time::Duration;

use bytes::Bytes;
use fast_socks5::client::{Config as SocksConfig, Socks5Stream};
use http::{header, Method, Request, StatusCode};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::auth::{encode_basic, Upstream};

/// Connect timeout applied to every outbound dial.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// This is a workaround for the restriction `only auto traits can be used
/// as additional traits in a trait object`
pub trait OutboundStreamIo: AsyncRead + AsyncWrite + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + std::fmt::Debug> OutboundStreamIo for T {}

/// A raw byte-stream connection to (or towards) the target.
pub type OutboundStream = Box<dyn OutboundStreamIo + Send + Unpin>;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CONNECT request: {0}")]
    Request(#[from] http::Error),
    #[error("HTTP exchange with upstream proxy failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("upstream proxy CONNECT failed with status {0}")]
    ConnectRejected(StatusCode),
    #[error("SOCKS5 error: {0}")]
    Socks(#[from] fast_socks5::SocksError),
}

async fn tcp_connect(addr: &str) -> Result<TcpStream, DialError> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| DialError::Timeout(addr.to_string()))?
        .map_err(DialError::Io)
}

/// Dials the target directly from this proxy's own network.
pub async fn dial_direct(target: &str) -> Result<OutboundStream, DialError> {
    debug!(target, "dialing direct");
    let stream = tcp_connect(target).await?;
    Ok(Box::new(stream))
}

/// Dials the target through an upstream HTTP proxy using CONNECT.
///
/// hyper treats CONNECT as having no body and will not read past the
/// response headers, so the upgraded stream is exactly the raw tunnel.
pub async fn dial_http_proxy(
    upstream: &Upstream,
    target: &str,
) -> Result<OutboundStream, DialError> {
    let proxy_addr = upstream.authority();
    debug!(
        proxy = %proxy_addr,
        target,
        has_auth = upstream.credentials.is_some(),
        "dialing through HTTP proxy"
    );

    let socket = tcp_connect(&proxy_addr).await?;
    let io = TokioIo::new(socket);
    // naive chained proxies are sometimes case-sensitive about headers
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .title_case_headers(true)
        .handshake(io)
        .await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!("upstream CONNECT connection ended: {err}");
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(header::HOST, target);
    if let Some(credentials) = &upstream.credentials {
        request = request.header(
            header::PROXY_AUTHORIZATION,
            format!(
                "Basic {}",
                encode_basic(&credentials.username, &credentials.password)
            ),
        );
    }
    let request = request.body(Empty::<Bytes>::new())?;

    let mut response = sender.send_request(request).await?;
    if response.status() != StatusCode::OK {
        debug!(status = %response.status(), "upstream proxy rejected CONNECT");
        return Err(DialError::ConnectRejected(response.status()));
    }

    let upgraded = hyper::upgrade::on(&mut response).await?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

/// Dials the target through an upstream SOCKS5 proxy, with RFC 1929
/// user/pass sub-negotiation when credentials are present.
pub async fn dial_socks5(
    upstream: &Upstream,
    target_host: &str,
    target_port: u16,
) -> Result<OutboundStream, DialError> {
    let proxy_addr = upstream.authority();
    debug!(
        proxy = %proxy_addr,
        target_host,
        target_port,
        has_auth = upstream.credentials.is_some(),
        "dialing through SOCKS5 proxy"
    );

    let config = SocksConfig::default();
    let connected = timeout(CONNECT_TIMEOUT, async {
        match &upstream.credentials {
            Some(credentials) => {
                Socks5Stream::connect_with_password(
                    proxy_addr.as_str(),
                    target_host.to_string(),
                    target_port,
                    credentials.username.clone(),
                    credentials.password.clone(),
                    config,
                )
                .await
            }
            None => {
                Socks5Stream::connect(
                    proxy_addr.as_str(),
                    target_host.to_string(),
                    target_port,
                    config,
                )
                .await
            }
        }
    })
    .await;

    let stream = match connected {
        Ok(result) => result?,
        Err(_) => return Err(DialError::Timeout(upstream.authority())),
    };

    Ok(Box::new(stream))
}
