//! Policy document parsing, validation, and per-request evaluation.
//!
//! A policy document (JSON or YAML) declares an ordered list of bot rules
//! and an ordered list of weight thresholds. Parsing compiles every regex,
//! CIDR trie, and CEL program up front and reports every invalid rule in
//! one joined error; a policy never partially loads.

pub mod cel;
pub mod providers;
pub mod rule;
pub mod thresholds;

use bastion_common::{Action, BastionError, ChallengeSpec, Decision, StatusCodes};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use crate::dns::DnsCache;
use cel::RegexCache;
use providers::{AsnChecker, CountryChecker, Providers, RemoteChecker};
use rule::{Bot, CidrSet, CompiledExpression, ExpressionList, JoinMode};
use thresholds::CompiledThreshold;

/// Built-in policy used when no policy file is configured.
const DEFAULT_POLICY: &str = include_str!("../../data/bot_policies.yaml");

/// Lowercase hex SHA-256 of some bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Everything the evaluator needs to know about one request, extracted
/// once at ingress. The remote address comes from the X-Real-Ip header
/// the ingress middleware derived.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub remote_addr: IpAddr,
    pub method: String,
    pub host: String,
    pub path: String,
    pub user_agent: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl RequestMetadata {
    /// Extract metadata from request parts. Fails when the X-Real-Ip
    /// header is absent or unparseable, which means the ingress chain in
    /// front of the evaluator is misconfigured.
    pub fn from_request<B>(req: &axum::http::Request<B>) -> Result<Self, BastionError> {
        let real_ip = req
            .headers()
            .get(bastion_common::constants::headers::X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BastionError::Internal("[misconfiguration] X-Real-Ip header is not set".into())
            })?;

        let remote_addr: IpAddr = real_ip.parse().map_err(|_| {
            BastionError::Internal(format!(
                "[misconfiguration] {real_ip:?} is not an IP address"
            ))
        })?;

        let mut query = HashMap::new();
        if let Some(raw) = req.uri().query() {
            for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
                query.insert(k.into_owned(), v.into_owned());
            }
        }

        let mut headers = HashMap::new();
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(canonical_header_name(name.as_str()), value.to_string());
            }
        }

        let host = req
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();

        let user_agent = req
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            remote_addr,
            method: req.method().to_string(),
            host,
            path: req.uri().path().to_string(),
            user_agent,
            query,
            headers,
        })
    }
}

/// `x-forwarded-for` → `X-Forwarded-For`, the shape CEL policies match
/// header names against.
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper_next = c == '-';
    }
    out
}

// --- Document schema ---

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub bots: Vec<BotConfig>,

    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,

    #[serde(default)]
    pub dnsbl: bool,

    #[serde(default)]
    pub status_codes: StatusCodes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub name: String,

    pub user_agent_regex: Option<String>,
    pub path_regex: Option<String>,

    #[serde(default)]
    pub remote_addresses: Vec<String>,

    pub expression: Option<ExpressionOrList>,

    /// FCrDNS hostname pattern; the rule fires only when the client's
    /// reverse DNS is forward-confirmed and matches.
    pub fcrdns: Option<String>,

    /// Autonomous system numbers, resolved via the external ASN service.
    pub asns: Option<Vec<u32>>,

    /// Country codes, resolved via the external GeoIP service.
    pub geoip: Option<GeoIpRule>,

    pub action: Action,

    pub challenge: Option<ChallengeConfig>,

    pub weight: Option<WeightConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpRule {
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpressionOrList {
    Single(String),
    All { all: Vec<String> },
    Any { any: Vec<String> },
}

impl ExpressionOrList {
    fn sources(&self) -> Vec<String> {
        match self {
            Self::Single(src) => vec![src.clone()],
            Self::All { all } => all.clone(),
            Self::Any { any } => any.clone(),
        }
    }

    fn mode(&self) -> JoinMode {
        match self {
            Self::Any { .. } => JoinMode::Any,
            _ => JoinMode::All,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    pub algorithm: String,
    pub difficulty: Option<u32>,
    pub report_as: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightConfig {
    pub adjust: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub name: String,
    pub expression: String,
    pub action: Action,
    pub challenge: Option<ChallengeConfig>,
}

// --- Compilation ---

/// Services and defaults available while compiling a policy.
#[derive(Clone, Default)]
pub struct ParseContext {
    pub providers: Providers,
    pub default_difficulty: u32,
}

#[derive(Debug)]
pub struct CompiledPolicy {
    pub bots: Vec<Bot>,
    pub thresholds: Vec<CompiledThreshold>,
    pub default_difficulty: u32,
    pub dnsbl: bool,
    pub status_codes: StatusCodes,
    pub regexes: Arc<RegexCache>,
}

impl CompiledPolicy {
    /// Walk the rules in declared order, then the thresholds. Pure with
    /// respect to the policy and request except for DNS and external
    /// checkers; call from a blocking context.
    pub fn check(&self, meta: &RequestMetadata, dns: &Arc<DnsCache>) -> Decision {
        let mut weight: i64 = 0;

        for bot in &self.bots {
            if !bot.matches(meta, dns, &self.regexes) {
                continue;
            }

            match bot.action {
                Action::Weigh => {
                    weight += bot.weight_adjust.unwrap_or(0);
                }
                action => {
                    return Decision {
                        rule: bot.name.clone(),
                        action,
                        challenge: bot.challenge.clone(),
                        rule_hash: bot.hash.clone(),
                    };
                }
            }
        }

        for threshold in &self.thresholds {
            if threshold.applies(weight) {
                return Decision {
                    rule: threshold.name.clone(),
                    action: threshold.action,
                    challenge: threshold.challenge.clone(),
                    rule_hash: threshold.hash.clone(),
                };
            }
        }

        Decision::default_allow()
    }

    /// Whether any current rule or threshold carries this fingerprint.
    pub fn has_rule_hash(&self, hash: &str) -> bool {
        if hash.is_empty() {
            return false;
        }
        self.bots.iter().any(|b| b.hash == hash)
            || self.thresholds.iter().any(|t| t.hash == hash)
    }

    /// The challenge spec used when a decision carries none.
    pub fn default_challenge(&self) -> ChallengeSpec {
        ChallengeSpec {
            algorithm: "fast".to_string(),
            difficulty: self.default_difficulty,
            report_as: self.default_difficulty,
        }
    }

    /// (name, fingerprint) of every DENY rule, printed at startup so
    /// operators can correlate error pages with rules.
    pub fn rule_error_ids(&self) -> Vec<(String, String)> {
        self.bots
            .iter()
            .filter(|b| b.action == Action::Deny)
            .map(|b| (b.name.clone(), b.hash.clone()))
            .collect()
    }
}

fn fill_challenge(
    config: Option<&ChallengeConfig>,
    default_difficulty: u32,
) -> ChallengeSpec {
    match config {
        Some(c) => {
            let difficulty = c.difficulty.unwrap_or(default_difficulty);
            ChallengeSpec {
                algorithm: c.algorithm.clone(),
                difficulty,
                report_as: c.report_as.unwrap_or(difficulty),
            }
        }
        None => ChallengeSpec {
            algorithm: "fast".to_string(),
            difficulty: default_difficulty,
            report_as: default_difficulty,
        },
    }
}

fn compile_bot(config: &BotConfig, ctx: &ParseContext) -> Result<Bot, Vec<String>> {
    let mut errs = Vec::new();

    if config.name.is_empty() {
        errs.push("must set name".to_string());
    }

    let has_matcher = config.user_agent_regex.is_some()
        || config.path_regex.is_some()
        || !config.remote_addresses.is_empty()
        || config.expression.is_some()
        || config.fcrdns.is_some()
        || config.asns.is_some()
        || config.geoip.is_some();
    if !has_matcher {
        errs.push(
            "must set at least one of user_agent_regex, path_regex, remote_addresses, \
             expression, fcrdns"
                .to_string(),
        );
    }

    let user_agent = match &config.user_agent_regex {
        Some(src) => match Regex::new(src) {
            Ok(rex) => Some(rex),
            Err(e) => {
                errs.push(format!("invalid user agent regex: {e}"));
                None
            }
        },
        None => None,
    };

    let path = match &config.path_regex {
        Some(src) => match Regex::new(src) {
            Ok(rex) => Some(rex),
            Err(e) => {
                errs.push(format!("invalid path regex: {e}"));
                None
            }
        },
        None => None,
    };

    let cidrs = if config.remote_addresses.is_empty() {
        None
    } else {
        match CidrSet::from_strs(&config.remote_addresses) {
            Ok(set) => Some(set),
            Err(e) => {
                errs.push(e);
                None
            }
        }
    };

    let fcrdns = match &config.fcrdns {
        Some(src) => match Regex::new(src) {
            Ok(rex) => Some(rex),
            Err(e) => {
                errs.push(format!("invalid fcrdns pattern: {e}"));
                None
            }
        },
        None => None,
    };

    let regexes = RegexCache::new();
    let mut cel_sources = Vec::new();
    let expressions = match &config.expression {
        Some(list) => {
            let mut items = Vec::new();
            for src in list.sources() {
                if let Err(e) = regexes.preseed(&src) {
                    errs.push(e.to_string());
                }
                match cel::compile_bot_expression(&src) {
                    Ok(program) => {
                        cel_sources.push(src.clone());
                        items.push(CompiledExpression {
                            source: src,
                            program,
                        });
                    }
                    Err(e) => errs.push(e.to_string()),
                }
            }
            if items.is_empty() {
                None
            } else {
                Some(ExpressionList {
                    mode: list.mode(),
                    items,
                })
            }
        }
        None => None,
    };

    let mut remote_checkers: Vec<Arc<dyn RemoteChecker>> = Vec::new();
    if let Some(asns) = &config.asns {
        match &ctx.providers.asn {
            Some(provider) => {
                remote_checkers.push(Arc::new(AsnChecker::new(provider.clone(), asns)));
            }
            None => errs.push("asns matching requires an ASN service".to_string()),
        }
    }
    if let Some(geoip) = &config.geoip {
        match &ctx.providers.geoip {
            Some(provider) => {
                remote_checkers.push(Arc::new(CountryChecker::new(
                    provider.clone(),
                    &geoip.countries,
                )));
            }
            None => errs.push("geoip matching requires a GeoIP service".to_string()),
        }
    }

    let challenge = match config.action {
        Action::Challenge => {
            let spec = fill_challenge(config.challenge.as_ref(), ctx.default_difficulty);
            if crate::challenge::get(&spec.algorithm).is_none() {
                errs.push(format!(
                    "unknown challenge algorithm {:?}; registered: {:?}",
                    spec.algorithm,
                    crate::challenge::methods()
                ));
            }
            Some(spec)
        }
        _ => None,
    };

    if config.action == Action::Weigh && config.weight.is_none() {
        errs.push("WEIGH action requires a weight adjustment".to_string());
    }

    if !errs.is_empty() {
        return Err(errs);
    }

    let mut sorted_cidrs = config.remote_addresses.clone();
    sorted_cidrs.sort();

    let hash = Bot::compute_hash(
        &config.name,
        config.path_regex.as_deref(),
        config.user_agent_regex.as_deref(),
        &sorted_cidrs,
        &cel_sources,
    );

    Ok(Bot {
        name: config.name.clone(),
        action: config.action,
        challenge,
        weight_adjust: config.weight.as_ref().map(|w| w.adjust),
        user_agent,
        path,
        cidrs,
        expressions,
        fcrdns,
        remote_checkers,
        hash,
    })
}

fn compile_threshold(
    config: &ThresholdConfig,
    ctx: &ParseContext,
) -> Result<CompiledThreshold, Vec<String>> {
    let mut errs = Vec::new();

    if config.name.is_empty() {
        errs.push("must set name".to_string());
    }

    let program = match cel::compile_threshold_expression(&config.expression) {
        Ok(p) => Some(p),
        Err(e) => {
            errs.push(e.to_string());
            None
        }
    };

    let challenge = match config.action {
        Action::Challenge => match &config.challenge {
            Some(c) => {
                let spec = fill_challenge(Some(c), ctx.default_difficulty);
                if crate::challenge::get(&spec.algorithm).is_none() {
                    errs.push(format!("unknown challenge algorithm {:?}", spec.algorithm));
                }
                Some(spec)
            }
            None => {
                errs.push("a threshold with the CHALLENGE action must have challenge set"
                    .to_string());
                None
            }
        },
        Action::Weigh => {
            errs.push("thresholds cannot use the WEIGH action".to_string());
            None
        }
        _ => None,
    };

    match program {
        Some(program) if errs.is_empty() => {
            let hash = sha256_hex(
                format!("threshold::{}::{}", config.name, config.expression).as_bytes(),
            );
            Ok(CompiledThreshold {
                name: config.name.clone(),
                source: config.expression.clone(),
                program,
                action: config.action,
                challenge,
                hash,
            })
        }
        _ => Err(errs),
    }
}

/// Compile a parsed document. Collects every invalid entry before
/// failing so the operator sees the whole damage at once.
pub fn compile(doc: &PolicyDocument, ctx: &ParseContext) -> Result<CompiledPolicy, BastionError> {
    let mut errs: Vec<String> = Vec::new();

    if doc.bots.is_empty() {
        errs.push("must define at least one (1) bot rule".to_string());
    }

    let regexes = Arc::new(RegexCache::new());

    let mut bots = Vec::with_capacity(doc.bots.len());
    for bot in &doc.bots {
        match compile_bot(bot, ctx) {
            Ok(compiled) => bots.push(compiled),
            Err(bot_errs) => {
                let mut msg = format!("bot entry for {:?} is not valid:", bot.name);
                for e in bot_errs {
                    let _ = write!(msg, "\n  - {e}");
                }
                errs.push(msg);
            }
        }
    }

    let mut compiled_thresholds = Vec::with_capacity(doc.thresholds.len());
    for threshold in &doc.thresholds {
        match compile_threshold(threshold, ctx) {
            Ok(compiled) => compiled_thresholds.push(compiled),
            Err(threshold_errs) => {
                let mut msg = format!("threshold entry for {:?} is not valid:", threshold.name);
                for e in threshold_errs {
                    let _ = write!(msg, "\n  - {e}");
                }
                errs.push(msg);
            }
        }
    }

    // Seed the shared regex cache from every expression so check()
    // literals are compiled exactly once.
    for bot in &doc.bots {
        if let Some(list) = &bot.expression {
            for src in list.sources() {
                let _ = regexes.preseed(&src);
            }
        }
    }

    if !errs.is_empty() {
        return Err(BastionError::InvalidConfig(format!(
            "config is not valid:\n{}",
            errs.join("\n")
        )));
    }

    Ok(CompiledPolicy {
        bots,
        thresholds: compiled_thresholds,
        default_difficulty: ctx.default_difficulty,
        dnsbl: doc.dnsbl,
        status_codes: doc.status_codes,
        regexes,
    })
}

/// Parse a policy document from a string. JSON documents are detected by
/// the file name; everything else goes through the YAML parser (YAML is a
/// JSON superset, so either syntax works in a `.yaml` file).
pub fn parse_str(
    src: &str,
    fname: &str,
    ctx: &ParseContext,
) -> Result<CompiledPolicy, BastionError> {
    let doc: PolicyDocument = if fname.ends_with(".json") {
        serde_json::from_str(src)
            .map_err(|e| BastionError::InvalidConfig(format!("can't parse {fname}: {e}")))?
    } else {
        serde_yaml::from_str(src)
            .map_err(|e| BastionError::InvalidConfig(format!("can't parse {fname}: {e}")))?
    };

    compile(&doc, ctx)
}

/// Load a policy from a file, or the built-in default when `path` is
/// `None`.
pub fn load(path: Option<&Path>, ctx: &ParseContext) -> Result<CompiledPolicy, BastionError> {
    match path {
        Some(path) => {
            let src = std::fs::read_to_string(path).map_err(|e| {
                BastionError::InvalidConfig(format!("can't open {}: {e}", path.display()))
            })?;
            parse_str(&src, &path.to_string_lossy(), ctx)
        }
        None => parse_str(DEFAULT_POLICY, "builtin:bot_policies.yaml", ctx),
    }
}

/// Shared handle to the currently active policy. Reloads swap the inner
/// pointer under a short write lock; readers clone the `Arc` and keep
/// evaluating against the snapshot they grabbed.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<CompiledPolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: CompiledPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    pub fn current(&self) -> Arc<CompiledPolicy> {
        self.inner.read().clone()
    }

    pub fn swap(&self, policy: CompiledPolicy) {
        *self.inner.write() = Arc::new(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> ParseContext {
        ParseContext {
            providers: Providers::default(),
            default_difficulty: 4,
        }
    }

    fn empty_dns() -> Arc<DnsCache> {
        Arc::new(DnsCache::with_lookups(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(|_| Ok(Vec::new())),
            Arc::new(|_| Ok(Vec::new())),
        ))
    }

    fn meta(ua: &str, path: &str, addr: &str) -> RequestMetadata {
        RequestMetadata {
            remote_addr: addr.parse().unwrap(),
            method: "GET".to_string(),
            host: "example.com".to_string(),
            path: path.to_string(),
            user_agent: ua.to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_default_policy_parses() {
        let policy = load(None, &ctx()).unwrap();
        assert!(!policy.bots.is_empty());
    }

    #[test]
    fn test_empty_document_is_invalid() {
        let err = parse_str("{}", "x.yaml", &ctx()).unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn test_all_invalid_rules_are_reported() {
        let src = r#"
bots:
  - name: bad-regex
    user_agent_regex: "(unclosed"
    action: DENY
  - name: bad-cidr
    remote_addresses: ["10.0.0.0/33"]
    action: DENY
  - name: ""
    path_regex: "^/$"
    action: ALLOW
"#;
        let err = parse_str(src, "x.yaml", &ctx()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bad-regex"), "{msg}");
        assert!(msg.contains("bad-cidr"), "{msg}");
        assert!(msg.contains("must set name"), "{msg}");
    }

    #[test]
    fn test_json_and_yaml_are_interchangeable() {
        let yaml = "bots:\n  - name: x\n    path_regex: \"^/$\"\n    action: ALLOW\n";
        let json = r#"{"bots":[{"name":"x","path_regex":"^/$","action":"ALLOW"}]}"#;

        let from_yaml = parse_str(yaml, "p.yaml", &ctx()).unwrap();
        let from_json = parse_str(json, "p.json", &ctx()).unwrap();
        assert_eq!(from_yaml.bots[0].hash, from_json.bots[0].hash);
    }

    #[test]
    fn test_rule_order_and_short_circuit() {
        let src = r#"
bots:
  - name: first-deny
    user_agent_regex: "^DENY_ME$"
    action: DENY
  - name: never-reached
    user_agent_regex: "^DENY_ME$"
    action: ALLOW
"#;
        let policy = parse_str(src, "x.yaml", &ctx()).unwrap();
        let dns = empty_dns();

        let decision = policy.check(&meta("DENY_ME", "/", "1.2.3.4"), &dns);
        assert_eq!(decision.rule, "first-deny");
        assert_eq!(decision.action, Action::Deny);
        assert!(!decision.rule_hash.is_empty());
    }

    #[test]
    fn test_weight_accumulation_and_thresholds() {
        let src = r#"
bots:
  - name: suspicious-ua
    user_agent_regex: "curl"
    action: WEIGH
    weight:
      adjust: 10
  - name: suspicious-path
    path_regex: "^/admin"
    action: WEIGH
    weight:
      adjust: 10
  - name: nice-path
    path_regex: "^/blog"
    action: WEIGH
    weight:
      adjust: -5
thresholds:
  - name: heavy
    expression: weight >= 20
    action: DENY
  - name: medium
    expression: weight >= 10
    action: CHALLENGE
    challenge:
      algorithm: fast
"#;
        let policy = parse_str(src, "x.yaml", &ctx()).unwrap();
        let dns = empty_dns();

        let d = policy.check(&meta("curl/8", "/admin/panel", "1.1.1.1"), &dns);
        assert_eq!(d.action, Action::Deny);
        assert_eq!(d.rule, "heavy");

        let d = policy.check(&meta("curl/8", "/", "1.1.1.1"), &dns);
        assert_eq!(d.action, Action::Challenge);
        assert_eq!(d.rule, "medium");
        assert!(d.challenge.is_some());

        let d = policy.check(&meta("Mozilla/5.0", "/blog/post", "1.1.1.1"), &dns);
        assert_eq!(d.action, Action::Allow);
        assert_eq!(d.rule, "default");
    }

    #[test]
    fn test_and_composition_within_a_rule() {
        let src = r#"
bots:
  - name: both
    user_agent_regex: "bot"
    path_regex: "^/api"
    action: DENY
"#;
        let policy = parse_str(src, "x.yaml", &ctx()).unwrap();
        let dns = empty_dns();

        assert_eq!(
            policy.check(&meta("somebot", "/api/x", "1.1.1.1"), &dns).action,
            Action::Deny
        );
        assert_eq!(
            policy.check(&meta("somebot", "/web", "1.1.1.1"), &dns).action,
            Action::Allow
        );
        assert_eq!(
            policy.check(&meta("human", "/api/x", "1.1.1.1"), &dns).action,
            Action::Allow
        );
    }

    #[test]
    fn test_cidr_rule_matches_derived_ip() {
        let src = r#"
bots:
  - name: internal
    remote_addresses: ["1.2.3.0/24"]
    action: DENY
"#;
        let policy = parse_str(src, "x.yaml", &ctx()).unwrap();
        let dns = empty_dns();

        assert_eq!(
            policy.check(&meta("x", "/", "1.2.3.4"), &dns).action,
            Action::Deny
        );
        assert_eq!(
            policy.check(&meta("x", "/", "5.6.7.8"), &dns).action,
            Action::Allow
        );
    }

    #[test]
    fn test_challenge_rule_gets_default_difficulty() {
        let src = r#"
bots:
  - name: browsers
    user_agent_regex: "Mozilla"
    action: CHALLENGE
"#;
        for difficulty in 1..10 {
            let ctx = ParseContext {
                providers: Providers::default(),
                default_difficulty: difficulty,
            };
            let policy = parse_str(src, "x.yaml", &ctx).unwrap();
            let dns = empty_dns();

            let d = policy.check(&meta("Mozilla/5.0", "/", "1.1.1.1"), &dns);
            let spec = d.challenge.expect("challenge rule must carry a spec");
            assert_eq!(spec.difficulty, difficulty);
            assert_eq!(spec.report_as, difficulty);
        }
    }

    #[test]
    fn test_unknown_challenge_algorithm_is_invalid() {
        let src = r#"
bots:
  - name: browsers
    user_agent_regex: "Mozilla"
    action: CHALLENGE
    challenge:
      algorithm: definitely-not-registered
"#;
        let err = parse_str(src, "x.yaml", &ctx()).unwrap_err();
        assert!(err.to_string().contains("definitely-not-registered"));
    }

    #[test]
    fn test_challenge_threshold_requires_spec() {
        let src = r#"
bots:
  - name: x
    path_regex: "^/$"
    action: ALLOW
thresholds:
  - name: t
    expression: weight > 0
    action: CHALLENGE
"#;
        let err = parse_str(src, "x.yaml", &ctx()).unwrap_err();
        assert!(err.to_string().contains("must have challenge set"));
    }

    #[test]
    fn test_asn_rule_requires_provider() {
        let src = r#"
bots:
  - name: cloud
    asns: [13335]
    action: DENY
"#;
        assert!(parse_str(src, "x.yaml", &ctx()).is_err());

        let providers = Providers {
            asn: Some(Arc::new(providers::testsupport::StaticAsn(
                [("1.2.3.4".parse().unwrap(), 13335u32)].into_iter().collect(),
            ))),
            geoip: None,
        };
        let ctx = ParseContext {
            providers,
            default_difficulty: 4,
        };
        let policy = parse_str(src, "x.yaml", &ctx).unwrap();
        let dns = empty_dns();

        assert_eq!(
            policy.check(&meta("x", "/", "1.2.3.4"), &dns).action,
            Action::Deny
        );
        assert_eq!(
            policy.check(&meta("x", "/", "8.8.8.8"), &dns).action,
            Action::Allow
        );
    }

    #[test]
    fn test_failing_provider_means_no_match() {
        let src = r#"
bots:
  - name: cloud
    asns: [13335]
    action: DENY
"#;
        let providers = Providers {
            asn: Some(Arc::new(providers::testsupport::FailingAsn)),
            geoip: None,
        };
        let ctx = ParseContext {
            providers,
            default_difficulty: 4,
        };
        let policy = parse_str(src, "x.yaml", &ctx).unwrap();
        let dns = empty_dns();

        assert_eq!(
            policy.check(&meta("x", "/", "1.2.3.4"), &dns).action,
            Action::Allow
        );
    }

    #[test]
    fn test_expression_any_mode() {
        let src = r#"
bots:
  - name: either
    expression:
      any:
        - 'userAgent.contains("curl")'
        - 'path.startsWith("/api")'
    action: DENY
"#;
        let policy = parse_str(src, "x.yaml", &ctx()).unwrap();
        let dns = empty_dns();

        assert_eq!(
            policy.check(&meta("curl/8", "/web", "1.1.1.1"), &dns).action,
            Action::Deny
        );
        assert_eq!(
            policy.check(&meta("Mozilla", "/api/x", "1.1.1.1"), &dns).action,
            Action::Deny
        );
        assert_eq!(
            policy.check(&meta("Mozilla", "/web", "1.1.1.1"), &dns).action,
            Action::Allow
        );
    }

    #[test]
    fn test_policy_handle_swap() {
        let src_a = "bots:\n  - name: a\n    path_regex: \"^/$\"\n    action: ALLOW\n";
        let src_b = "bots:\n  - name: b\n    path_regex: \"^/$\"\n    action: ALLOW\n";

        let handle = PolicyHandle::new(parse_str(src_a, "a.yaml", &ctx()).unwrap());
        let hash_a = handle.current().bots[0].hash.clone();

        handle.swap(parse_str(src_b, "b.yaml", &ctx()).unwrap());
        assert!(!handle.current().has_rule_hash(&hash_a));
        assert_eq!(handle.current().bots[0].name, "b");
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("cf-worker"), "Cf-Worker");
        assert_eq!(canonical_header_name("x-real-ip"), "X-Real-Ip");
        assert_eq!(canonical_header_name("host"), "Host");
    }
}
