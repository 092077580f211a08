use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body as _, Frame, Incoming};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use super::{empty_body, upstream_failed_response, ProxyBody, ProxyState};
use crate::auth::Upstream;
use crate::routing::{host_without_port, RouteDecision};
use crate::transport::is_chrome_browser;

/// Hop-by-hop headers are stripped in both directions per RFC 9110.
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove("trailers");
}

/// Plain-request path: authenticate (unless the MITM CONNECT already bound
/// an upstream), short-circuit ad hosts, then round-trip through the
/// direct or upstream transport.
pub(crate) async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    bound: Option<Upstream>,
    scheme: &'static str,
) -> Result<Response<ProxyBody>, Infallible> {
    let start = Instant::now();

    let upstream = match bound {
        // authenticated during the CONNECT phase
        Some(upstream) => upstream,
        None => match super::authenticate(req.headers()) {
            Ok(upstream) => upstream,
            Err(response) => return Ok(response),
        },
    };

    // absolute-form requests carry the authority in the URI; origin-form
    // (MITM inner) requests carry it in the Host header
    let authority = req
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        });
    let Some(authority) = authority else {
        debug!("request without target host, terminating connection");
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(response);
    };

    let host = host_without_port(&authority).to_ascii_lowercase();
    let url = if req.uri().scheme().is_some() {
        req.uri().to_string()
    } else {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{scheme}://{authority}{path_and_query}")
    };

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let is_chrome = is_chrome_browser(user_agent);

    let client = match state.classifier.classify(&host, req.uri().path(), upstream) {
        RouteDecision::AdBlocked => {
            debug!(%host, method = %req.method(), "blocking ad domain request");
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::NO_CONTENT;
            return Ok(response);
        }
        RouteDecision::Direct => {
            if is_chrome {
                debug!(%url, "using Chrome-optimized transport for direct connection");
                state.chrome.clone()
            } else {
                debug!(%url, "using direct connection");
                state.direct.clone()
            }
        }
        RouteDecision::ViaUpstream(upstream) => {
            debug!(
                upstream_type = upstream.scheme.as_str(),
                upstream_host = %upstream.host,
                upstream_port = upstream.port,
                %url,
                "using upstream proxy"
            );
            match state.transports.get(&upstream) {
                Ok(client) => client,
                Err(err) => {
                    error!("failed to get upstream transport: {err}");
                    return Ok(upstream_failed_response());
                }
            }
        }
    };

    let response = round_trip(client, req, url).await;
    debug!(duration = ?start.elapsed(), "request routing completed");
    Ok(response)
}

async fn round_trip(
    client: reqwest::Client,
    req: Request<Incoming>,
    url: String,
) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let method = parts.method;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // the URL already carries the authority; let the client re-derive Host
    headers.remove(header::HOST);

    // body-less requests stay body-less; everything else streams through
    let body = if body.is_end_stream() {
        reqwest::Body::default()
    } else {
        reqwest::Body::wrap_stream(BodyStream::new(body).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(err) => Some(Err(err)),
            }
        }))
    };

    let started = Instant::now();
    let upstream_response = match client
        .request(method.clone(), url.as_str())
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            debug!(%method, %url, duration = ?started.elapsed(), "upstream request failed: {err}");
            return upstream_failed_response();
        }
    };

    debug!(
        status = upstream_response.status().as_u16(),
        method = %method,
        url = %url,
        content_length = upstream_response.content_length().unwrap_or(0),
        content_type = upstream_response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(""),
        duration = ?started.elapsed(),
        "upstream request completed"
    );

    let mut response = Response::new(empty_body());
    *response.status_mut() = upstream_response.status();
    for (name, value) in upstream_response.headers() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    strip_hop_by_hop(response.headers_mut());

    // pump the upstream body through a bounded channel; the channel keeps
    // backpressure while giving hyper a body it can hold across threads
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<bytes::Bytes>, std::io::Error>>(32);
    tokio::spawn(async move {
        let mut body = upstream_response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let frame = chunk.map(Frame::data).map_err(std::io::Error::other);
            if tx.send(frame).await.is_err() {
                // client went away
                break;
            }
        }
    });
    *response.body_mut() = BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)));

    response
}
