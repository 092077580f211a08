use std::collections::HashSet;

use tracing::debug;

use crate::auth::Upstream;

/// Where a request is sent once classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Short-circuit with an empty response, never dialed.
    AdBlocked,
    /// Dial the target from this proxy's own network.
    Direct,
    /// Forward through the upstream carried by the request's credentials.
    ViaUpstream(Upstream),
}

/// Routing inputs, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Classifier {
    static_exts: HashSet<String>,
    cdn_patterns: Vec<String>,
    ad_domains: HashSet<String>,
    ad_block: bool,
}

impl Classifier {
    pub fn new(
        extensions: &[String],
        cdn_patterns: &[String],
        ad_domains: Vec<String>,
        ad_block: bool,
    ) -> Self {
        Self {
            static_exts: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            cdn_patterns: cdn_patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
            ad_domains: ad_domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            ad_block,
        }
    }

    /// Whether the URL path names a static file, judged solely by the
    /// suffix after the last `.` of the path (query and fragment excluded
    /// by the caller handing us a bare path).
    pub fn is_static(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        let Some(last_dot) = lower.rfind('.') else {
            return false;
        };
        if last_dot + 1 >= lower.len() {
            return false;
        }
        self.static_exts.contains(&lower[last_dot..])
    }

    /// CDN match is substring, not suffix: patterns like `cdn.` are meant
    /// to hit anywhere in the host.
    pub fn is_cdn(&self, host: &str) -> bool {
        let lower = host.to_ascii_lowercase();
        self.cdn_patterns
            .iter()
            .any(|pattern| lower.contains(pattern.as_str()))
    }

    /// Exact match on the host or on any suffix formed by dropping leading
    /// labels, so `a.b.example.com` hits an entry for `example.com`.
    pub fn is_ad_domain(&self, host: &str) -> bool {
        if !self.ad_block || self.ad_domains.is_empty() {
            return false;
        }
        let lower = host.to_ascii_lowercase();
        let mut candidate = lower.as_str();
        loop {
            if self.ad_domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return false,
            }
        }
    }

    /// The ad check runs first so a blocked host can never leak out via
    /// the direct path.
    pub fn classify(&self, host: &str, path: &str, upstream: Upstream) -> RouteDecision {
        if self.is_ad_domain(host) {
            debug!(host, "domain blocked by ad list");
            return RouteDecision::AdBlocked;
        }
        if self.is_static(path) || self.is_cdn(host) {
            debug!(host, path, "direct connection for static file or CDN");
            return RouteDecision::Direct;
        }
        RouteDecision::ViaUpstream(upstream)
    }
}

/// Strips an optional `:port` suffix, tolerating bracketed IPv6 literals.
pub fn host_without_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host
        }
        _ => authority,
    }
}
