//! Request routing for streams arriving over edge connections.
//!
//! ## Architecture
//!
//! ```text
//! Edge -> Connection -> RequestRouter -> Ingress -> UpstreamClient -> Origin
//!                             |
//!                             +-> synthesized status (no match / http_status)
//! ```

pub mod ingress;
mod router;
mod upstream;

pub use ingress::{
    normalize_hostname, HostPattern, Ingress, IngressRule, MatchResult, RuleConfig, UpstreamTarget,
};
pub use router::{RequestRouter, ResponseSink, MAX_CHUNK};
pub use upstream::{response_headers, upstream_url, UpstreamClient};
