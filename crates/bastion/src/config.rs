//! Configuration management.

use anyhow::{Context, Result};
use bastion_common::constants::{
    CLEANUP_INTERVAL_SECS, COOKIE_DEFAULT_EXPIRATION_SECS, DEFAULT_DIFFICULTY,
    DEFAULT_LISTEN_ADDR, DEFAULT_METRICS_ADDR, DEFAULT_TARGET, PROXY_HEADER_TIMEOUT_SECS,
};
use serde::Deserialize;
use std::path::Path;

/// Application configuration. Loaded from a TOML file when one exists,
/// then overridden by CLI flags and environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Metrics listen address; empty disables the metrics listener
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,

    /// Upstream origin to reverse proxy to
    #[serde(default = "default_target")]
    pub target: String,

    /// Policy document path (built-in policy when unset)
    #[serde(default)]
    pub policy_fname: Option<String>,

    /// Default challenge difficulty (leading zero nibbles)
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,

    /// Cookie domain, or DYNAMIC_SECOND_LEVEL_DOMAIN to derive from the
    /// request host
    #[serde(default)]
    pub cookie_domain: Option<String>,

    #[serde(default)]
    pub cookie_secure: bool,

    #[serde(default)]
    pub cookie_partitioned: bool,

    /// Session cookie lifetime in seconds
    #[serde(default = "default_cookie_expiration")]
    pub cookie_expiration_secs: u64,

    /// Path prefix all gatekeeper endpoints live under
    #[serde(default)]
    pub base_prefix: String,

    /// Remove the base prefix from paths before matching and proxying
    #[serde(default)]
    pub strip_base_prefix: bool,

    /// Parse PROXY protocol headers on incoming connections
    #[serde(default)]
    pub proxy_protocol_enable: bool,

    /// PROXY protocol header read timeout in seconds
    #[serde(default = "default_proxy_header_timeout")]
    pub proxy_header_timeout_secs: u64,

    /// Speak PROXY protocol (1 or 2) on the upstream dial
    #[serde(default)]
    pub proxy_protocol_out_version: Option<u8>,

    /// Substitute for an empty X-Real-Ip header. Debug only.
    #[serde(default)]
    pub debug_x_real_ip_default: Option<String>,

    /// JSON file restricting which targets may be proxied
    #[serde(default)]
    pub allowed_targets_fname: Option<String>,

    /// 32-byte Ed25519 private key file (ephemeral key when unset)
    #[serde(default)]
    pub ed25519_private_key_fname: Option<String>,

    /// Redis URL for shared challenge state (in-memory store when unset)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Serve a deny-all robots.txt
    #[serde(default)]
    pub serve_robots_txt: bool,

    /// Forward DNS cache TTL in seconds
    #[serde(default = "default_dns_ttl")]
    pub forward_dns_ttl_secs: u64,

    /// Reverse DNS cache TTL in seconds
    #[serde(default = "default_dns_ttl")]
    pub reverse_dns_ttl_secs: u64,

    /// Interval between decaying-map cleanup sweeps in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

// Default value functions
fn default_bind() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}
fn default_metrics_bind() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}
fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}
fn default_difficulty() -> u32 {
    DEFAULT_DIFFICULTY
}
fn default_cookie_expiration() -> u64 {
    COOKIE_DEFAULT_EXPIRATION_SECS
}
fn default_proxy_header_timeout() -> u64 {
    PROXY_HEADER_TIMEOUT_SECS
}
fn default_dns_ttl() -> u64 {
    3600
}
fn default_cleanup_interval() -> u64 {
    CLEANUP_INTERVAL_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_bind: default_metrics_bind(),
            target: default_target(),
            policy_fname: None,
            difficulty: default_difficulty(),
            cookie_domain: None,
            cookie_secure: false,
            cookie_partitioned: false,
            cookie_expiration_secs: default_cookie_expiration(),
            base_prefix: String::new(),
            strip_base_prefix: false,
            proxy_protocol_enable: false,
            proxy_header_timeout_secs: default_proxy_header_timeout(),
            proxy_protocol_out_version: None,
            debug_x_real_ip_default: None,
            allowed_targets_fname: None,
            ed25519_private_key_fname: None,
            redis_url: None,
            serve_robots_txt: false,
            forward_dns_ttl_secs: default_dns_ttl(),
            reverse_dns_ttl_secs: default_dns_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &crate::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref bind) = args.bind {
            config.bind = bind.clone();
        }
        if let Some(ref metrics_bind) = args.metrics_bind {
            config.metrics_bind = metrics_bind.clone();
        }
        if let Some(ref target) = args.target {
            config.target = target.clone();
        }
        if let Some(ref policy_fname) = args.policy_fname {
            config.policy_fname = Some(policy_fname.clone());
        }
        if let Some(difficulty) = args.difficulty {
            config.difficulty = difficulty;
        }
        if let Some(ref cookie_domain) = args.cookie_domain {
            config.cookie_domain = Some(cookie_domain.clone());
        }
        if let Some(ref base_prefix) = args.base_prefix {
            config.base_prefix = base_prefix.clone();
        }
        if args.strip_base_prefix {
            config.strip_base_prefix = true;
        }
        if args.proxy_protocol_enable {
            config.proxy_protocol_enable = true;
        }
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = Some(redis_url.clone());
        }
        if let Some(ref key_fname) = args.ed25519_private_key_fname {
            config.ed25519_private_key_fname = Some(key_fname.clone());
        }
        if let Some(ref targets_fname) = args.allowed_targets_fname {
            config.allowed_targets_fname = Some(targets_fname.clone());
        }
        if let Some(ref debug_default) = args.debug_x_real_ip_default {
            config.debug_x_real_ip_default = Some(debug_default.clone());
        }
        if args.serve_robots_txt {
            config.serve_robots_txt = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(version) = self.proxy_protocol_out_version {
            anyhow::ensure!(
                version == 1 || version == 2,
                "proxy_protocol_out_version must be 1 or 2, got {version}"
            );
        }
        if !self.base_prefix.is_empty() {
            anyhow::ensure!(
                self.base_prefix.starts_with('/'),
                "base_prefix must start with a slash"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bind, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.difficulty, DEFAULT_DIFFICULTY);
        assert_eq!(config.cookie_expiration_secs, 7 * 24 * 3600);
        assert!(!config.strip_base_prefix);
    }

    #[test]
    fn test_validate_rejects_bad_proxy_version() {
        let config = AppConfig {
            proxy_protocol_out_version: Some(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_base_prefix() {
        let config = AppConfig {
            base_prefix: "app".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.toml");
        std::fs::write(
            &path,
            r#"
bind = "127.0.0.1:4000"
target = "http://origin:8080"
difficulty = 6
cookie_secure = true
base_prefix = "/gate"
forward_dns_ttl_secs = 120
"#,
        )
        .unwrap();

        let args = crate::Args {
            target: Some("http://cli-wins:9090".to_string()),
            ..Default::default()
        };
        let config = AppConfig::load(path.to_str().unwrap(), &args).unwrap();

        // File values land...
        assert_eq!(config.bind, "127.0.0.1:4000");
        assert_eq!(config.difficulty, 6);
        assert!(config.cookie_secure);
        assert_eq!(config.base_prefix, "/gate");
        assert_eq!(config.forward_dns_ttl_secs, 120);
        // ...CLI flags beat the file...
        assert_eq!(config.target, "http://cli-wins:9090");
        // ...and everything unmentioned keeps its default.
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_ADDR);
        assert_eq!(config.cookie_expiration_secs, COOKIE_DEFAULT_EXPIRATION_SECS);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let args = crate::Args::default();
        let config = AppConfig::load("/definitely/not/here.toml", &args).unwrap();
        assert_eq!(config.bind, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.target, DEFAULT_TARGET);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.toml");
        std::fs::write(&path, "base_prefix = \"gate\"\n").unwrap();

        let args = crate::Args::default();
        assert!(AppConfig::load(path.to_str().unwrap(), &args).is_err());
    }
}
