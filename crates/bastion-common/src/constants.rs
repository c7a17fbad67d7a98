//! Shared constants for Bastion components.

/// Name of the cookie carrying the signed session token.
pub const COOKIE_NAME: &str = "techaro.lol-anubis-auth";

/// Name of the probe cookie carrying the outstanding challenge ID. If a
/// client blocks this cookie the challenge page cannot recover state.
pub const TEST_COOKIE_NAME: &str =
    "techaro.lol-anubis-cookie-test-if-you-block-this-anubis-wont-work";

/// Session cookie lifetime (7 days).
pub const COOKIE_DEFAULT_EXPIRATION_SECS: u64 = 7 * 24 * 3600;

/// Grace window for session cookies whose originating rule no longer
/// exists after a policy reload.
pub const COOKIE_RULE_GRACE_SECS: i64 = 3600;

/// Location of all gatekeeper-owned assets and endpoints.
pub const STATIC_PATH: &str = "/.within.website/x/cmd/anubis/";

/// Location of all gatekeeper API endpoints.
pub const API_PREFIX: &str = "/.within.website/x/cmd/anubis/api/";

/// Default number of leading zero nibbles a solution digest must have.
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// Outstanding challenge lifetime (30 minutes). Must exceed the
/// legitimate solve window.
pub const CHALLENGE_TTL_SECS: u64 = 1800;

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8923";

/// Default metrics listen address
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9090";

/// Default upstream target
pub const DEFAULT_TARGET: &str = "http://localhost:3923";

/// Sentinel cookie-domain value that derives the effective domain from
/// the request host.
pub const DYNAMIC_COOKIE_DOMAIN: &str = "DYNAMIC_SECOND_LEVEL_DOMAIN";

/// Public suffixes that span more than one label. Hosts under these are
/// scoped at the label before the suffix rather than the last two labels.
pub const MULTI_LABEL_SUFFIXES: &[&str] = &["ts.net", "co.uk", "com.au", "github.io"];

/// Default PROXY protocol header read timeout (seconds).
pub const PROXY_HEADER_TIMEOUT_SECS: u64 = 5;

/// Interval between decaying-map cleanup sweeps (seconds).
pub const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Debounce applied to file-watcher reloads (milliseconds).
pub const WATCH_DEBOUNCE_MILLIS: u64 = 100;

/// DNS lookup timeout (seconds).
pub const DNS_TIMEOUT_SECS: u64 = 10;

/// Time limit for external ASN/GeoIP checkers (milliseconds).
/// Implementations must resolve or give up within this window.
pub const REMOTE_CHECK_TIMEOUT_MILLIS: u64 = 500;

/// Store key prefixes
pub mod store_keys {
    /// Outstanding challenge records: challenge:{id}
    pub const CHALLENGE_PREFIX: &str = "challenge";

    /// Spent-challenge markers: spent:{id}
    pub const SPENT_PREFIX: &str = "spent";

    /// Forward DNS cache: forwardDNS:{host}
    pub const FORWARD_DNS_PREFIX: &str = "forwardDNS";

    /// Reverse DNS cache: reverseDNS:{addr}
    pub const REVERSE_DNS_PREFIX: &str = "reverseDNS";
}

/// HTTP header names
pub mod headers {
    /// Derived real client address
    pub const X_REAL_IP: &str = "X-Real-Ip";

    /// Standard forwarding chain
    pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
}
