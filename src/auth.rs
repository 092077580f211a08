use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::HeaderValue;
use thiserror::Error;
use tracing::debug;

/// Transport scheme of an upstream proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamScheme {
    Http,
    Socks5,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCredentials {
    pub username: String,
    pub password: String,
}

/// A concrete forwarder derived from the client's proxy credentials,
/// immutable for the lifetime of the request that carried them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<UpstreamCredentials>,
}

impl Upstream {
    /// `host:port` form used when dialing the upstream itself.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key under which transports for this upstream are pooled.
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Failures extracting the Basic credential pair from the
/// `Proxy-Authorization` header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("proxy authentication required")]
    Missing,
    #[error("authorization scheme is not Basic")]
    NotBasic,
    #[error("invalid base64 in authorization header")]
    InvalidBase64,
    #[error("invalid credential format")]
    InvalidCredentials,
}

/// Failures turning a credential pair into an [`Upstream`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("invalid schema: {0}, must be http or socks5")]
    InvalidScheme(String),
    #[error("failed to decode password: invalid base64")]
    InvalidPayload,
    #[error("upstream payload is not valid UTF-8")]
    NotUtf8,
    #[error("invalid upstream format, expected host:port")]
    InvalidFormat,
    #[error("invalid upstream port: {0}")]
    InvalidPort(String),
}

/// Some clients wrap base64 at 76 columns; strip anything resembling
/// whitespace before decoding.
fn strip_ascii_whitespace(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | ' ' | '\t'))
        .collect()
}

/// Extracts the `(user, pass)` pair from a `Proxy-Authorization` header.
/// Both halves must be non-empty.
pub fn basic_credentials(header: Option<&HeaderValue>) -> Result<(String, String), AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    let value = header.to_str().map_err(|_| AuthError::NotBasic)?;
    let token = value.strip_prefix("Basic ").ok_or(AuthError::NotBasic)?;

    let token = strip_ascii_whitespace(token);
    let decoded = BASE64.decode(&token).map_err(|_| AuthError::InvalidBase64)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;

    let (user, pass) = decoded
        .split_once(':')
        .ok_or(AuthError::InvalidCredentials)?;
    if user.is_empty() || pass.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }

    Ok((user.to_string(), pass.to_string()))
}

/// Parses the upstream descriptor from a Basic credential pair: the user
/// names the scheme, the password is `base64(host:port[:user:pass])`.
pub fn parse_upstream(username: &str, password: &str) -> Result<Upstream, UpstreamError> {
    let schema = username.to_ascii_lowercase();
    let scheme = match schema.as_str() {
        "http" => UpstreamScheme::Http,
        "socks5" => UpstreamScheme::Socks5,
        _ => return Err(UpstreamError::InvalidScheme(schema)),
    };

    let payload = strip_ascii_whitespace(password);
    debug!(
        schema = schema.as_str(),
        payload_len = payload.len(),
        head = payload.get(..payload.len().min(20)).unwrap_or(""),
        tail = payload.get(payload.len().saturating_sub(20)..).unwrap_or(""),
        "parsing upstream from credentials"
    );

    let decoded = BASE64
        .decode(&payload)
        .map_err(|_| UpstreamError::InvalidPayload)?;
    let decoded = String::from_utf8(decoded).map_err(|_| UpstreamError::NotUtf8)?;

    // The fourth field absorbs any remaining colons so passwords may
    // contain them.
    let parts: Vec<&str> = decoded.splitn(4, ':').collect();
    if parts.len() < 2 {
        return Err(UpstreamError::InvalidFormat);
    }

    let port: u16 = parts[1]
        .parse()
        .map_err(|_| UpstreamError::InvalidPort(parts[1].to_string()))?;
    if port == 0 {
        return Err(UpstreamError::InvalidPort(parts[1].to_string()));
    }

    let credentials = if parts.len() >= 4 {
        Some(UpstreamCredentials {
            username: parts[2].to_string(),
            password: parts[3].to_string(),
        })
    } else {
        None
    };

    Ok(Upstream {
        scheme,
        host: parts[0].to_string(),
        port,
        credentials,
    })
}

/// Encodes a `user:pass` pair as a Basic authorization token.
pub fn encode_basic(username: &str, password: &str) -> String {
    BASE64.encode(format!("{username}:{password}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).expect("valid header value")
    }

    #[test]
    fn missing_header_is_rejected() {
        assert_eq!(basic_credentials(None), Err(AuthError::Missing));
    }

    #[test]
    fn non_basic_scheme_is_rejected() {
        let value = header("Bearer abcdef");
        assert_eq!(basic_credentials(Some(&value)), Err(AuthError::NotBasic));
    }

    #[test]
    fn empty_user_or_password_is_rejected() {
        let value = header(&format!("Basic {}", BASE64.encode("user:")));
        assert_eq!(
            basic_credentials(Some(&value)),
            Err(AuthError::InvalidCredentials)
        );
        let value = header(&format!("Basic {}", BASE64.encode(":pass")));
        assert_eq!(
            basic_credentials(Some(&value)),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn basic_credentials_round_trip() {
        let token = encode_basic("socks5", "cGF5bG9hZA==");
        let value = header(&format!("Basic {token}"));
        let (user, pass) = basic_credentials(Some(&value)).expect("valid credentials");
        assert_eq!(user, "socks5");
        assert_eq!(pass, "cGF5bG9hZA==");
    }

    #[test]
    fn password_keeps_colons_after_first_split() {
        let value = header(&format!("Basic {}", BASE64.encode("http:a:b:c")));
        let (user, pass) = basic_credentials(Some(&value)).expect("valid credentials");
        assert_eq!(user, "http");
        assert_eq!(pass, "a:b:c");
    }

    #[test]
    fn parses_upstream_without_credentials() {
        let upstream =
            parse_upstream("http", &BASE64.encode("proxy.example.com:8080")).expect("parses");
        assert_eq!(upstream.scheme, UpstreamScheme::Http);
        assert_eq!(upstream.host, "proxy.example.com");
        assert_eq!(upstream.port, 8080);
        assert_eq!(upstream.credentials, None);
        assert_eq!(upstream.cache_key(), "http:proxy.example.com:8080");
    }

    #[test]
    fn parses_upstream_with_credentials() {
        let upstream =
            parse_upstream("SOCKS5", &BASE64.encode("10.0.0.1:1080:alice:s3cret")).expect("parses");
        assert_eq!(upstream.scheme, UpstreamScheme::Socks5);
        assert_eq!(upstream.host, "10.0.0.1");
        assert_eq!(upstream.port, 1080);
        assert_eq!(
            upstream.credentials,
            Some(UpstreamCredentials {
                username: "alice".into(),
                password: "s3cret".into(),
            })
        );
    }

    #[test]
    fn upstream_password_absorbs_trailing_colons() {
        let upstream =
            parse_upstream("http", &BASE64.encode("host:80:user:pa:ss:word")).expect("parses");
        let credentials = upstream.credentials.expect("credentials present");
        assert_eq!(credentials.username, "user");
        assert_eq!(credentials.password, "pa:ss:word");
    }

    #[test]
    fn line_wrapped_base64_is_accepted() {
        let encoded = BASE64.encode("1.2.3.4:8080");
        let (head, tail) = encoded.split_at(8);
        let wrapped = format!("{head}\r\n {tail}\t");
        let upstream = parse_upstream("http", &wrapped).expect("parses despite whitespace");
        assert_eq!(upstream.host, "1.2.3.4");
        assert_eq!(upstream.port, 8080);
        assert_eq!(upstream, parse_upstream("http", &encoded).expect("parses"));
    }

    #[test]
    fn invalid_scheme_is_rejected() {
        let err = parse_upstream("ftp", &BASE64.encode("host:80")).unwrap_err();
        assert_eq!(err, UpstreamError::InvalidScheme("ftp".into()));
        assert_eq!(
            err.to_string(),
            "invalid schema: ftp, must be http or socks5"
        );
    }

    #[test]
    fn single_field_payload_is_rejected() {
        let err = parse_upstream("http", &BASE64.encode("justahost")).unwrap_err();
        assert_eq!(err, UpstreamError::InvalidFormat);
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = parse_upstream("http", &BASE64.encode("host:notaport")).unwrap_err();
        assert_eq!(err, UpstreamError::InvalidPort("notaport".into()));
        let err = parse_upstream("http", &BASE64.encode("host:0")).unwrap_err();
        assert_eq!(err, UpstreamError::InvalidPort("0".into()));
        let err = parse_upstream("http", &BASE64.encode("host:65536")).unwrap_err();
        assert_eq!(err, UpstreamError::InvalidPort("65536".into()));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert_eq!(
            parse_upstream("http", "!!not-base64!!").unwrap_err(),
            UpstreamError::InvalidPayload
        );
    }
}
