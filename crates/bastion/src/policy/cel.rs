//! CEL expression support for policy rules and thresholds.
//!
//! Expressions compile once at policy load. Compilation validates that a
//! program only references the variables its environment declares, so a
//! typo'd policy fails loudly at startup instead of at request time.
//! Regex patterns passed to `fcrdns.check(...)` as literals are compiled
//! during the same load pass and reused from a shared cache.

use bastion_common::BastionError;
use cel_interpreter::extractors::This;
use cel_interpreter::{Context, Program, Value};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::dns::DnsCache;
use crate::policy::RequestMetadata;

/// Variables exposed to rule expressions.
const BOT_VARIABLES: &[&str] = &[
    "remoteAddress",
    "host",
    "method",
    "userAgent",
    "path",
    "query",
    "headers",
    "fcrdns",
];

/// Variables exposed to threshold expressions.
const THRESHOLD_VARIABLES: &[&str] = &["weight"];

/// Matches regex literals inside `check("...")` / `check('...')` calls so
/// they can be compiled at policy load instead of per request.
static CHECK_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"check\(\s*(?:"([^"]*)"|'([^']*)')\s*\)"#).unwrap());

/// Shared pattern → compiled-regex table. Seeded at policy load; dynamic
/// patterns (built from request data at runtime) fall back to
/// compile-and-cache.
#[derive(Default, Debug)]
pub struct RegexCache {
    inner: Mutex<HashMap<String, Arc<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(rex) = self.inner.lock().get(pattern) {
            return Ok(rex.clone());
        }

        let rex = Arc::new(Regex::new(pattern)?);
        self.inner.lock().insert(pattern.to_string(), rex.clone());
        Ok(rex)
    }

    /// Compile every `check(...)` string literal found in an expression
    /// source. An invalid literal is a policy error.
    pub fn preseed(&self, source: &str) -> Result<(), BastionError> {
        for caps in CHECK_LITERAL.captures_iter(source) {
            let literal = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            self.get_or_compile(literal).map_err(|e| {
                BastionError::InvalidConfig(format!(
                    "invalid regex {literal:?} in expression {source:?}: {e}"
                ))
            })?;
        }
        Ok(())
    }
}

fn compile_with_variables(src: &str, allowed: &[&str]) -> Result<Program, BastionError> {
    let program = Program::compile(src).map_err(|e| {
        BastionError::InvalidConfig(format!("expression {src:?} does not compile: {e}"))
    })?;

    let references = program.references();
    for var in references.variables() {
        let name = var.to_string();
        if !allowed.iter().any(|a| *a == name) {
            return Err(BastionError::InvalidConfig(format!(
                "expression {src:?} references unknown variable {name:?}"
            )));
        }
    }

    Ok(program)
}

/// Compile a rule expression against the bot environment.
pub fn compile_bot_expression(src: &str) -> Result<Program, BastionError> {
    compile_with_variables(src, BOT_VARIABLES)
}

/// Compile a threshold expression against the `weight` environment.
pub fn compile_threshold_expression(src: &str) -> Result<Program, BastionError> {
    compile_with_variables(src, THRESHOLD_VARIABLES)
}

/// Evaluate a rule expression for one request. Any evaluation error
/// resolves to `false`; the policy never fails a request over a matcher.
pub fn eval_bot_expression(
    program: &Program,
    source: &str,
    meta: &RequestMetadata,
    dns: &Arc<DnsCache>,
    regexes: &Arc<RegexCache>,
) -> bool {
    let mut ctx = Context::default();

    ctx.add_variable_from_value("remoteAddress", meta.remote_addr.to_string());
    ctx.add_variable_from_value("host", meta.host.clone());
    ctx.add_variable_from_value("method", meta.method.clone());
    ctx.add_variable_from_value("userAgent", meta.user_agent.clone());
    ctx.add_variable_from_value("path", meta.path.clone());
    ctx.add_variable_from_value("query", meta.query.clone());
    ctx.add_variable_from_value("headers", meta.headers.clone());
    // The fcrdns resource is the client address; check() resolves it.
    ctx.add_variable_from_value("fcrdns", meta.remote_addr.to_string());

    let dns = dns.clone();
    let regexes = regexes.clone();
    ctx.add_function(
        "check",
        move |This(ip): This<Arc<String>>, pattern: Arc<String>| -> bool {
            let addr: IpAddr = match ip.parse() {
                Ok(addr) => addr,
                Err(_) => return false,
            };
            match regexes.get_or_compile(&pattern) {
                Ok(rex) => dns.verify_fcrdns(addr, Some(&rex)),
                Err(e) => {
                    debug!(pattern = %pattern, error = %e, "bad fcrdns pattern at runtime");
                    false
                }
            }
        },
    );

    match program.execute(&ctx) {
        Ok(Value::Bool(b)) => b,
        Ok(other) => {
            debug!(expression = %source, value = ?other, "expression is not a boolean");
            false
        }
        Err(e) => {
            debug!(expression = %source, error = %e, "expression evaluation failed");
            false
        }
    }
}

/// Evaluate a threshold expression against the accumulated weight.
pub fn eval_threshold_expression(program: &Program, source: &str, weight: i64) -> bool {
    let mut ctx = Context::default();
    ctx.add_variable_from_value("weight", weight);

    match program.execute(&ctx) {
        Ok(Value::Bool(b)) => b,
        Ok(other) => {
            debug!(expression = %source, value = ?other, "threshold is not a boolean");
            false
        }
        Err(e) => {
            debug!(expression = %source, error = %e, "threshold evaluation failed");
            false
        }
    }
}
