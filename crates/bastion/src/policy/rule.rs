//! Compiled policy rules and their matchers.

use bastion_common::{Action, ChallengeSpec};
use cel_interpreter::Program;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixSet;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::dns::DnsCache;
use crate::policy::cel::{eval_bot_expression, RegexCache};
use crate::policy::providers::RemoteChecker;
use crate::policy::RequestMetadata;

/// How the expressions in a rule combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    All,
    Any,
}

#[derive(Debug)]
pub struct CompiledExpression {
    pub source: String,
    pub program: Program,
}

#[derive(Debug)]
pub struct ExpressionList {
    pub mode: JoinMode,
    pub items: Vec<CompiledExpression>,
}

/// Mixed IPv4/IPv6 prefix set. Both families live in their own trie so
/// membership checks stay logarithmic no matter how many prefixes a rule
/// carries. Built once at policy load.
#[derive(Debug)]
pub struct CidrSet {
    v4: PrefixSet<Ipv4Net>,
    v6: PrefixSet<Ipv6Net>,
    sources: Vec<String>,
}

impl CidrSet {
    pub fn from_strs(cidrs: &[String]) -> Result<Self, String> {
        let mut v4 = PrefixSet::new();
        let mut v6 = PrefixSet::new();
        let mut sources = Vec::with_capacity(cidrs.len());

        for raw in cidrs {
            let net: IpNet = raw
                .parse()
                .map_err(|e| format!("invalid CIDR {raw:?}: {e}"))?;
            match net {
                IpNet::V4(net) => {
                    v4.insert(net);
                }
                IpNet::V6(net) => {
                    v6.insert(net);
                }
            }
            sources.push(net.to_string());
        }

        sources.sort();

        Ok(Self { v4, v6, sources })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => self.v4.get_lpm(&Ipv4Net::from(addr)).is_some(),
            IpAddr::V6(addr) => self.v6.get_lpm(&Ipv6Net::from(addr)).is_some(),
        }
    }

    /// Canonical prefix list, sorted, for rule hashing.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

/// An ordered matching entity from the policy document, fully compiled.
pub struct Bot {
    pub name: String,
    pub action: Action,
    pub challenge: Option<ChallengeSpec>,
    pub weight_adjust: Option<i64>,
    pub user_agent: Option<Regex>,
    pub path: Option<Regex>,
    pub cidrs: Option<CidrSet>,
    pub expressions: Option<ExpressionList>,
    pub fcrdns: Option<Regex>,
    pub remote_checkers: Vec<Arc<dyn RemoteChecker>>,
    /// Stable fingerprint over the rule identity, used in logs and bound
    /// to issued session cookies.
    pub hash: String,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let checker_hashes: Vec<String> = self.remote_checkers.iter().map(|c| c.hash()).collect();
        f.debug_struct("Bot")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("challenge", &self.challenge)
            .field("weight_adjust", &self.weight_adjust)
            .field("user_agent", &self.user_agent)
            .field("path", &self.path)
            .field("cidrs", &self.cidrs)
            .field("expressions", &self.expressions)
            .field("fcrdns", &self.fcrdns)
            .field("remote_checkers", &checker_hashes)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Bot {
    /// Stable SHA-256 over the canonical rendering of the rule identity.
    pub fn compute_hash(
        name: &str,
        path_rex: Option<&str>,
        user_agent_rex: Option<&str>,
        sorted_cidrs: &[String],
        cel_sources: &[String],
    ) -> String {
        let mut canonical = String::new();
        canonical.push_str(name);
        canonical.push_str("::");
        canonical.push_str(path_rex.unwrap_or_default());
        canonical.push_str("::");
        canonical.push_str(user_agent_rex.unwrap_or_default());
        canonical.push_str("::");
        for cidr in sorted_cidrs {
            canonical.push_str(cidr);
            canonical.push('\n');
        }
        canonical.push_str("::");
        canonical.push_str(&cel_sources.join("\n"));

        crate::policy::sha256_hex(canonical.as_bytes())
    }

    /// True iff every present matcher succeeds. A failing matcher
    /// short-circuits. External checker errors resolve to "no match".
    pub fn matches(
        &self,
        meta: &RequestMetadata,
        dns: &Arc<DnsCache>,
        regexes: &Arc<RegexCache>,
    ) -> bool {
        if let Some(rex) = &self.user_agent {
            if !rex.is_match(&meta.user_agent) {
                return false;
            }
        }

        if let Some(rex) = &self.path {
            if !rex.is_match(&meta.path) {
                return false;
            }
        }

        if let Some(cidrs) = &self.cidrs {
            if !cidrs.contains(meta.remote_addr) {
                return false;
            }
        }

        if let Some(list) = &self.expressions {
            let mut iter = list
                .items
                .iter()
                .map(|e| eval_bot_expression(&e.program, &e.source, meta, dns, regexes));
            let ok = match list.mode {
                JoinMode::All => iter.all(|v| v),
                JoinMode::Any => iter.any(|v| v),
            };
            if !ok {
                return false;
            }
        }

        if let Some(rex) = &self.fcrdns {
            if !dns.verify_fcrdns(meta.remote_addr, Some(rex)) {
                return false;
            }
        }

        for checker in &self.remote_checkers {
            match checker.check(meta) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    debug!(rule = %self.name, error = %e, "remote checker failed; treating as no match");
                    return false;
                }
            }
        }

        true
    }
}
