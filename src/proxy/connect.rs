use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::header::{HeaderValue, CONNECTION};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional_with_sizes;
use tracing::debug;

use super::{empty_body, mitm, ProxyBody, ProxyState};
use crate::auth::{Upstream, UpstreamScheme};
use crate::dialer::{self, DialError, OutboundStream};
use crate::routing::host_without_port;

/// Tunnel bindings auto-expire so abandoned CONNECTs cannot grow the maps
/// without bound.
const BINDING_TTL: Duration = Duration::from_secs(5 * 60);

/// Maps an authenticated upstream to the tunnel that will be dialed for
/// it. Keyed both by target address and, for frameworks that only surface
/// the client socket identity at dial time, by remote address.
#[derive(Default)]
pub struct ConnectBindings {
    by_target: DashMap<String, Upstream>,
    by_remote: DashMap<String, Upstream>,
}

impl ConnectBindings {
    /// Records both bindings and schedules their expiry. Re-binding the
    /// same key is an idempotent overwrite; the last writer wins.
    pub fn bind(self: &Arc<Self>, target: String, remote: String, upstream: Upstream) {
        self.by_target.insert(target.clone(), upstream.clone());
        self.by_remote.insert(remote.clone(), upstream);

        let bindings = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(BINDING_TTL).await;
            bindings.by_target.remove(&target);
            bindings.by_remote.remove(&remote);
        });
    }

    pub fn for_target(&self, target: &str) -> Option<Upstream> {
        self.by_target.get(target).map(|entry| entry.value().clone())
    }

    pub fn for_remote(&self, remote: &str) -> Option<Upstream> {
        self.by_remote.get(remote).map(|entry| entry.value().clone())
    }
}

/// CONNECT entry point: authenticate, bind the upstream to the target,
/// then either MITM the tunnel or open a raw byte pipe.
pub(crate) async fn handle_connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let upstream = match super::authenticate(req.headers()) {
        Ok(upstream) => upstream,
        Err(response) => return Ok(response),
    };

    let Some(authority) = req.uri().authority().cloned() else {
        debug!("CONNECT without authority, terminating connection");
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(response);
    };

    // CONNECT targets without an explicit port mean HTTPS
    let target = if authority.port_u16().is_some() {
        authority.to_string()
    } else {
        format!("{authority}:443")
    };

    debug!(
        host = %authority,
        upstream_type = upstream.scheme.as_str(),
        upstream_host = %upstream.host,
        %client_addr,
        mitm = state.mitm.is_some(),
        "CONNECT authentication successful"
    );

    if let Some(ca) = state.mitm.clone() {
        let host = authority.host().to_ascii_lowercase();
        let mitm_state = state.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(err) =
                        mitm::serve_intercepted(mitm_state, ca, upgraded, upstream, host).await
                    {
                        debug!("MITM session ended with error: {err}");
                    }
                }
                Err(err) => debug!("CONNECT upgrade error: {err}"),
            }
        });
    } else {
        let remote = client_addr.to_string();
        state
            .bindings
            .bind(target.clone(), remote.clone(), upstream);

        let tunnel_state = state.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    match dial_outbound(&tunnel_state, &target, &remote).await {
                        Ok(mut outbound) => {
                            match copy_bidirectional_with_sizes(
                                &mut client,
                                &mut *outbound,
                                tunnel_state.tunnel_read_buffer,
                                tunnel_state.tunnel_write_buffer,
                            )
                            .await
                            {
                                Ok((to_target, from_target)) => {
                                    debug!(%target, to_target, from_target, "tunnel closed")
                                }
                                Err(err) => debug!(%target, "tunnel error: {err}"),
                            }
                        }
                        Err(err) => debug!(%target, "tunnel dial failed: {err}"),
                    }
                }
                Err(err) => debug!("CONNECT upgrade error: {err}"),
            }
        });
    }

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

/// Picks the outbound dialer for a tunnel: CDN hosts go direct, bound
/// targets use their upstream, and an expired or missing binding falls
/// back to a direct dial.
async fn dial_outbound(
    state: &ProxyState,
    target: &str,
    remote: &str,
) -> Result<OutboundStream, DialError> {
    let host = host_without_port(target).to_ascii_lowercase();

    if state.classifier.is_cdn(&host) {
        debug!(%host, "using direct connection for CDN domain");
        return dialer::dial_direct(target).await;
    }

    let upstream = state
        .bindings
        .for_target(target)
        .or_else(|| state.bindings.for_remote(remote));
    let Some(upstream) = upstream else {
        debug!(%target, "no upstream bound for target, using direct connection");
        return dialer::dial_direct(target).await;
    };

    match upstream.scheme {
        UpstreamScheme::Http => dialer::dial_http_proxy(&upstream, target).await,
        UpstreamScheme::Socks5 => {
            let port = target
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse().ok())
                .unwrap_or(443);
            dialer::dial_socks5(&upstream, &host, port).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UpstreamCredentials;

    fn upstream(port: u16) -> Upstream {
        Upstream {
            scheme: UpstreamScheme::Http,
            host: "10.0.0.1".into(),
            port,
            credentials: Some(UpstreamCredentials {
                username: "alice".into(),
                password: "s3cret".into(),
            }),
        }
    }

    #[tokio::test]
    async fn bindings_resolve_by_target_and_remote() {
        let bindings = Arc::new(ConnectBindings::default());
        bindings.bind(
            "example.com:443".into(),
            "127.0.0.1:50000".into(),
            upstream(8080),
        );

        assert_eq!(
            bindings.for_target("example.com:443"),
            Some(upstream(8080))
        );
        assert_eq!(
            bindings.for_remote("127.0.0.1:50000"),
            Some(upstream(8080))
        );
        assert_eq!(bindings.for_target("other.com:443"), None);
    }

    #[tokio::test]
    async fn rebinding_overwrites_previous_upstream() {
        let bindings = Arc::new(ConnectBindings::default());
        bindings.bind("example.com:443".into(), "r1".into(), upstream(8080));
        bindings.bind("example.com:443".into(), "r1".into(), upstream(9090));

        assert_eq!(
            bindings.for_target("example.com:443"),
            Some(upstream(9090))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bindings_expire_after_ttl() {
        let bindings = Arc::new(ConnectBindings::default());
        bindings.bind("example.com:443".into(), "r1".into(), upstream(8080));

        // just before the deadline the binding is still live
        tokio::time::sleep(BINDING_TTL - Duration::from_secs(1)).await;
        assert!(bindings.for_target("example.com:443").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(bindings.for_target("example.com:443"), None);
        assert_eq!(bindings.for_remote("r1"), None);
    }
}
