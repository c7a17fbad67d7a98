//! # Bastion
//!
//! Transparent reverse-proxy gatekeeper. Inspects each request, runs a
//! configurable policy, and either proxies it upstream, denies it, or
//! interposes a browser-side proof-of-work challenge whose completion
//! issues a signed session cookie.
//!
//! ## Architecture
//! ```text
//! LB (PROXY proto) → Bastion → Upstream origin
//!                       ↓
//!             Memory or Redis (challenge state)
//! ```

use clap::Parser;

pub mod challenge;
pub mod config;
pub mod cookie;
pub mod decaymap;
pub mod dns;
pub mod ingress;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod proxyproto;
pub mod routes;
pub mod state;
pub mod store;
pub mod watcher;

/// Bastion - reverse proxy gatekeeper
#[derive(Parser, Debug, Default)]
#[command(name = "bastion")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/bastion.toml")]
    pub config: String,

    /// Network address to bind HTTP to (overrides config)
    #[arg(long, env = "BIND")]
    pub bind: Option<String>,

    /// Network address to bind metrics to (overrides config)
    #[arg(long, env = "METRICS_BIND")]
    pub metrics_bind: Option<String>,

    /// Target to reverse proxy to (overrides config)
    #[arg(long, env = "TARGET")]
    pub target: Option<String>,

    /// Full path to the policy document (defaults to a built-in policy)
    #[arg(long, env = "POLICY_FNAME")]
    pub policy_fname: Option<String>,

    /// Difficulty of the challenge (leading zero nibbles)
    #[arg(long, env = "DIFFICULTY")]
    pub difficulty: Option<u32>,

    /// Cookie domain, or DYNAMIC_SECOND_LEVEL_DOMAIN
    #[arg(long, env = "COOKIE_DOMAIN")]
    pub cookie_domain: Option<String>,

    /// Path prefix all gatekeeper endpoints live under
    #[arg(long, env = "BASE_PREFIX")]
    pub base_prefix: Option<String>,

    /// Strip the base prefix from paths before matching and proxying
    #[arg(long, default_value = "false")]
    pub strip_base_prefix: bool,

    /// Parse PROXY protocol headers on incoming connections
    #[arg(long, default_value = "false")]
    pub proxy_protocol_enable: bool,

    /// Redis URL for shared challenge state (overrides config)
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// 32-byte Ed25519 private key file for session token signing
    #[arg(long, env = "ED25519_PRIVATE_KEY_FNAME")]
    pub ed25519_private_key_fname: Option<String>,

    /// JSON file restricting which targets may be proxied
    #[arg(long, env = "ALLOWED_TARGETS_FNAME")]
    pub allowed_targets_fname: Option<String>,

    /// Replace empty X-Real-Ip headers with this value. Debug only.
    #[arg(long, env = "DEBUG_X_REAL_IP_DEFAULT")]
    pub debug_x_real_ip_default: Option<String>,

    /// Serve a robots.txt that disallows all robots
    #[arg(long, default_value = "false")]
    pub serve_robots_txt: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    pub json_logs: bool,
}
