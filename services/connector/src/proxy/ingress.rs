//! Ingress rules and matching.
//!
//! Rules map a hostname/path pattern to an upstream target:
//! - Rules are evaluated in declaration order; the first match wins
//! - Hostnames are matched case-insensitively with the trailing dot trimmed
//! - A hostname may start with `*.` to match any subdomain (not the apex)
//! - Paths are regular expressions matched against the request path
//! - An empty rule set matches nothing
//!
//! The rule set is immutable once built; request tasks share it behind an
//! `Arc`.

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IngressError;

/// Service string that routes to the built-in hello-world origin.
pub const HELLO_WORLD_SERVICE: &str = "hello_world";

/// Prefix of service strings that answer with a fixed status.
pub const HTTP_STATUS_PREFIX: &str = "http_status:";

/// One ingress rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service: String,
}

/// Where a matched request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Proxy to an HTTP(S) origin.
    Http(Url),
    /// Built-in hello-world origin, resolved to `Http` once it is running.
    HelloWorld,
    /// Answer with a fixed status and no body.
    Status(u16),
}

impl UpstreamTarget {
    /// Parses a service string: `http(s)://...`, `hello_world`, or
    /// `http_status:<code>`.
    pub fn parse(service: &str) -> Result<Self, String> {
        let service = service.trim();

        if service == HELLO_WORLD_SERVICE {
            return Ok(Self::HelloWorld);
        }

        if let Some(code) = service.strip_prefix(HTTP_STATUS_PREFIX) {
            let code: u16 = code
                .parse()
                .map_err(|_| format!("'{code}' is not a status code"))?;
            if !(100..=999).contains(&code) {
                return Err(format!("status code {code} out of range"));
            }
            return Ok(Self::Status(code));
        }

        let url = Url::parse(service).map_err(|e| e.to_string())?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(Self::Http(url)),
            "http" | "https" => Err("origin URL has no host".to_string()),
            other => Err(format!("unsupported scheme '{other}'")),
        }
    }
}

/// Hostname side of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stored as the suffix including the leading dot, e.g. `.example.com`.
    Wildcard(String),
}

impl HostPattern {
    fn parse(index: usize, raw: &str) -> Result<Self, IngressError> {
        let normalized = normalize_hostname(raw);
        let invalid = |reason| IngressError::InvalidHostname {
            index,
            hostname: raw.to_string(),
            reason,
        };

        if normalized.is_empty() {
            return Err(invalid("hostname is empty"));
        }

        match normalized.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') && suffix.len() > 1 => {
                if suffix.contains('*') {
                    return Err(invalid("only a single leading wildcard is allowed"));
                }
                Ok(Self::Wildcard(suffix.to_string()))
            }
            Some(_) => Err(invalid("wildcard must be followed by '.'")),
            None if normalized.contains('*') => {
                Err(invalid("wildcard is only allowed as the first label"))
            }
            None => Ok(Self::Exact(normalized)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == host,
            Self::Wildcard(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_lowercase().trim_end_matches('.').to_string()
}

/// A validated ingress rule.
#[derive(Debug, Clone)]
pub struct IngressRule {
    pub hostname: Option<HostPattern>,
    pub path: Option<Regex>,
    pub target: UpstreamTarget,
}

impl IngressRule {
    /// Catch-all rule routing everything to `target`.
    pub fn catch_all(target: UpstreamTarget) -> Self {
        Self {
            hostname: None,
            path: None,
            target,
        }
    }

    fn from_config(index: usize, config: &RuleConfig) -> Result<Self, IngressError> {
        let hostname = config
            .hostname
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .map(|h| HostPattern::parse(index, h))
            .transpose()?;

        let path = config
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|source| IngressError::InvalidPath { index, source })?;

        let target =
            UpstreamTarget::parse(&config.service).map_err(|reason| IngressError::InvalidService {
                index,
                service: config.service.clone(),
                reason,
            })?;

        Ok(Self {
            hostname,
            path,
            target,
        })
    }

    /// Whether this rule accepts the (normalized) host and path.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = self.hostname.as_ref().is_none_or(|p| p.matches(host));
        let path_ok = self.path.as_ref().is_none_or(|re| re.is_match(path));
        host_ok && path_ok
    }
}

/// Result of matching a request against the rule set.
#[derive(Debug, Clone, Copy)]
pub enum MatchResult<'a> {
    Matched { index: usize, rule: &'a IngressRule },
    NoMatch,
}

/// Ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct Ingress {
    rules: Vec<IngressRule>,
}

impl Ingress {
    /// Rule set that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a rule set from config, validating every rule.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self, IngressError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| IngressRule::from_config(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Single catch-all rule.
    pub fn single(target: UpstreamTarget) -> Self {
        Self {
            rules: vec![IngressRule::catch_all(target)],
        }
    }

    /// First rule accepting `host` and `path`.
    pub fn matches(&self, host: &str, path: &str) -> MatchResult<'_> {
        let host = normalize_hostname(host);

        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(&host, path) {
                debug!(rule = index, host = %host, path = %path, "Ingress rule matched");
                return MatchResult::Matched { index, rule };
            }
        }

        MatchResult::NoMatch
    }

    /// Whether any rule targets the built-in hello-world origin.
    pub fn uses_hello_world(&self) -> bool {
        self.rules
            .iter()
            .any(|r| r.target == UpstreamTarget::HelloWorld)
    }

    /// Points every hello-world rule at the running origin.
    pub fn resolve_hello_world(mut self, origin: &Url) -> Self {
        for rule in &mut self.rules {
            if rule.target == UpstreamTarget::HelloWorld {
                rule.target = UpstreamTarget::Http(origin.clone());
            }
        }
        self
    }

    pub fn rules(&self) -> &[IngressRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(hostname: Option<&str>, path: Option<&str>, service: &str) -> RuleConfig {
        RuleConfig {
            hostname: hostname.map(str::to_string),
            path: path.map(str::to_string),
            service: service.to_string(),
        }
    }

    fn matched_index(ingress: &Ingress, host: &str, path: &str) -> Option<usize> {
        match ingress.matches(host, path) {
            MatchResult::Matched { index, .. } => Some(index),
            MatchResult::NoMatch => None,
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM"), "example.com");
        assert_eq!(normalize_hostname("example.com."), "example.com");
    }

    #[test]
    fn test_empty_ingress_matches_nothing() {
        let ingress = Ingress::empty();
        assert!(matched_index(&ingress, "example.com", "/").is_none());
        assert!(matched_index(&ingress, "", "/test").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let ingress = Ingress::from_config(&[
            rule(Some("api.example.com"), Some("^/v1"), "http://127.0.0.1:8001"),
            rule(Some("api.example.com"), None, "http://127.0.0.1:8002"),
            rule(None, None, "http_status:404"),
        ])
        .unwrap();

        assert_eq!(matched_index(&ingress, "api.example.com", "/v1/users"), Some(0));
        assert_eq!(matched_index(&ingress, "API.example.com.", "/v2"), Some(1));
        assert_eq!(matched_index(&ingress, "www.example.com", "/v1"), Some(2));
    }

    #[test]
    fn test_wildcard_hostname() {
        let ingress =
            Ingress::from_config(&[rule(Some("*.example.com"), None, "http://127.0.0.1:9000")])
                .unwrap();

        assert_eq!(matched_index(&ingress, "a.example.com", "/"), Some(0));
        assert_eq!(matched_index(&ingress, "a.b.example.com", "/"), Some(0));
        assert_eq!(matched_index(&ingress, "example.com", "/"), None);
        assert_eq!(matched_index(&ingress, "badexample.com", "/"), None);
    }

    #[test]
    fn test_path_regex_is_unanchored() {
        let ingress =
            Ingress::from_config(&[rule(None, Some(r"\.(jpg|png)$"), "http_status:418")]).unwrap();

        assert_eq!(matched_index(&ingress, "x", "/static/cat.png"), Some(0));
        assert_eq!(matched_index(&ingress, "x", "/index.html"), None);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(matches!(
            Ingress::from_config(&[rule(None, Some("("), "http_status:404")]),
            Err(IngressError::InvalidPath { index: 0, .. })
        ));
        assert!(matches!(
            Ingress::from_config(&[rule(Some("a.*.com"), None, "http_status:404")]),
            Err(IngressError::InvalidHostname { .. })
        ));
        assert!(matches!(
            Ingress::from_config(&[
                rule(None, None, "http_status:404"),
                rule(None, None, "ftp://files.example.com")
            ]),
            Err(IngressError::InvalidService { index: 1, .. })
        ));
        assert!(matches!(
            Ingress::from_config(&[rule(None, None, "http_status:42")]),
            Err(IngressError::InvalidService { .. })
        ));
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            UpstreamTarget::parse("hello_world").unwrap(),
            UpstreamTarget::HelloWorld
        );
        assert_eq!(
            UpstreamTarget::parse("http_status:503").unwrap(),
            UpstreamTarget::Status(503)
        );
        match UpstreamTarget::parse("http://localhost:8080/app").unwrap() {
            UpstreamTarget::Http(url) => assert_eq!(url.port(), Some(8080)),
            other => panic!("Expected Http, got {:?}", other),
        }
        assert!(UpstreamTarget::parse("localhost:8080").is_err());
    }

    #[test]
    fn test_resolve_hello_world() {
        let ingress = Ingress::single(UpstreamTarget::HelloWorld);
        assert!(ingress.uses_hello_world());

        let origin = Url::parse("http://127.0.0.1:34567").unwrap();
        let ingress = ingress.resolve_hello_world(&origin);
        assert!(!ingress.uses_hello_world());
        assert_eq!(ingress.rules()[0].target, UpstreamTarget::Http(origin));
    }
}
