//! Challenge API endpoints.

use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bastion_common::constants::COOKIE_NAME;
use bastion_common::BastionError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{
    append_clear_cookie, cookie_path, error_page, evaluate, issue_challenge,
    serve_challenge_page,
};
use crate::challenge::{SubmissionParams, ValidateInput};
use crate::cookie::{self, SessionClaims};
use crate::metrics;
use crate::policy::RequestMetadata;
use crate::state::AppState;

/// POST make-challenge: returns `{id, challenge, difficulty}` JSON.
pub async fn make_challenge(State(state): State<AppState>, req: Request) -> Response {
    let policy = state.policy.current();

    let meta = match RequestMetadata::from_request(&req) {
        Ok(meta) => meta,
        Err(e) => {
            error!(error = %e, "can't derive request metadata");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    let decision = match evaluate(&state, &policy, &meta).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "policy evaluation failed");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    let spec = decision
        .challenge
        .clone()
        .unwrap_or_else(|| policy.default_challenge());

    let (artifact, _method) = match issue_challenge(&state, &spec, &decision, &meta).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "challenge issuance failed");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    let mut response = Json(&artifact).into_response();

    let domain = cookie::cookie_scope(state.config.cookie_domain.as_deref(), &meta.host);
    let test_cookie = cookie::build_cookie(
        bastion_common::constants::TEST_COOKIE_NAME,
        &artifact.id,
        &cookie_path(&state),
        domain.as_deref(),
        bastion_common::constants::CHALLENGE_TTL_SECS as i64,
        state.config.cookie_secure,
        false,
    );
    if let Ok(value) = HeaderValue::from_str(&test_cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    response
}

#[derive(Debug, Deserialize)]
pub struct PassChallengeQuery {
    pub id: Option<String>,
    pub response: Option<String>,
    pub nonce: Option<String>,
    #[serde(rename = "elapsedTime")]
    pub elapsed_time: Option<String>,
    pub redir: Option<String>,
}

/// Validate the post-solve redirect target. Only relative paths and
/// http(s) URLs pointing at the protected site are allowed; anything
/// else is a 400 and the value must never be reflected into a response.
pub fn validate_redirect(
    redir: &str,
    request_host: &str,
    cookie_domain: Option<&str>,
) -> Result<(), BastionError> {
    if redir.is_empty() {
        return Ok(());
    }

    if redir.starts_with('/') && !redir.starts_with("//") && !redir.starts_with("/\\") {
        return Ok(());
    }

    let url = url::Url::parse(redir)
        .map_err(|_| BastionError::InvalidInput("unparseable redirect".to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(BastionError::InvalidInput(
                "redirect scheme not allowed".to_string(),
            ))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| BastionError::InvalidInput("redirect has no host".to_string()))?;

    let request_host = request_host
        .rsplit_once(':')
        .map_or(request_host, |(h, _)| if h.contains(':') { request_host } else { h });

    if host == request_host {
        return Ok(());
    }

    if let Some(domain) = cookie_domain {
        if host == domain || host.ends_with(&format!(".{domain}")) {
            return Ok(());
        }
    }

    Err(BastionError::InvalidInput(
        "redirect host outside cookie scope".to_string(),
    ))
}

/// GET pass-challenge: verifies the submitted proof, issues the session
/// cookie, and redirects to the original destination.
pub async fn pass_challenge(
    State(state): State<AppState>,
    Query(params): Query<PassChallengeQuery>,
    req: Request,
) -> Response {
    let policy = state.policy.current();

    let meta = match RequestMetadata::from_request(&req) {
        Ok(meta) => meta,
        Err(e) => {
            error!(error = %e, "can't derive request metadata");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    let redir = params.redir.clone().unwrap_or_default();
    let scope = cookie::cookie_scope(state.config.cookie_domain.as_deref(), &meta.host);
    if let Err(e) = validate_redirect(&redir, &meta.host, scope.as_deref()) {
        debug!(error = %e, "rejecting redirect target");
        return error_page(&state, "Invalid redirect", None, 400);
    }

    let id = match params.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            // The page may have lost the ID; the probe cookie carries a
            // copy.
            match req
                .headers()
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|h| {
                    cookie::cookie_value(h, bastion_common::constants::TEST_COOKIE_NAME)
                }) {
                Some(id) => id.to_string(),
                None => return error_page(&state, "Missing challenge ID", None, 400),
            }
        }
    };

    let challenge = match state.challenges.get(&id).await {
        Ok(challenge) => challenge,
        Err(e) if e.should_reissue() => {
            debug!(id = %id, error = %e, "challenge gone; reissuing");
            return reissue(&state, &policy, &meta, &redir).await;
        }
        Err(e) => {
            error!(error = %e, "challenge lookup failed");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    if !challenge.belongs_to(&meta.remote_addr.to_string(), &meta.user_agent) {
        debug!(id = %id, "challenge does not belong to this client; reissuing");
        return reissue(&state, &policy, &meta, &redir).await;
    }

    let method = match crate::challenge::get(&challenge.method) {
        Some(method) => method,
        None => {
            error!(method = %challenge.method, "challenge method vanished");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    let nonce = match params.nonce.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<u64>() {
            Ok(nonce) => Some(nonce),
            Err(_) => return error_page(&state, "Invalid nonce", None, 400),
        },
    };
    let elapsed_time = params
        .elapsed_time
        .as_deref()
        .and_then(|raw| raw.parse::<f64>().ok());

    let submission = SubmissionParams {
        response: params.response.clone(),
        nonce,
        elapsed_time,
    };

    let result = method
        .validate(&ValidateInput {
            challenge: &challenge,
            params: &submission,
            store: &state.challenges,
        })
        .await;

    match result {
        Ok(()) => {
            if let Some(ms) = elapsed_time {
                metrics::CHALLENGE_TIME_TAKEN
                    .with_label_values(&[challenge.method.as_str()])
                    .observe(ms / 1000.0);
            }

            info!(id = %id, method = %challenge.method, "challenge passed");
            issue_session_cookie(&state, &challenge, &meta, &redir)
        }
        Err(e) if e.should_reissue() => {
            debug!(id = %id, error = %e, "stale submission; reissuing");
            reissue(&state, &policy, &meta, &redir).await
        }
        Err(BastionError::Failed(reason)) => {
            metrics::FAILED_VALIDATIONS.inc();
            debug!(id = %id, reason = %reason, "challenge failed");
            // Deliberately vague: don't tell solvers which part of the
            // proof was wrong.
            error_page(&state, "Invalid response", None, 403)
        }
        Err(e @ (BastionError::MissingField(_) | BastionError::InvalidFormat(_))) => {
            error_page(&state, &e.to_string(), None, 400)
        }
        Err(e) => {
            error!(error = %e, "challenge validation error");
            error_page(&state, "Internal server error", None, 500)
        }
    }
}

fn issue_session_cookie(
    state: &AppState,
    challenge: &crate::challenge::Challenge,
    meta: &RequestMetadata,
    redir: &str,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let scope = cookie::cookie_scope(state.config.cookie_domain.as_deref(), &meta.host);

    let claims = SessionClaims {
        sub: challenge.id.clone(),
        iat: now,
        exp: now + state.config.cookie_expiration_secs as i64,
        rule_hash: challenge.policy_rule_hash.clone(),
        scope: scope.clone().unwrap_or_default(),
    };

    let token = match state.signer.sign(&claims) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "can't sign session token");
            return error_page(state, "Internal server error", None, 500);
        }
    };

    let location = if redir.is_empty() { "/" } else { redir };
    let mut response = (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response();

    let auth_cookie = cookie::build_cookie(
        COOKIE_NAME,
        &token,
        &cookie_path(state),
        scope.as_deref(),
        state.config.cookie_expiration_secs as i64,
        state.config.cookie_secure,
        state.config.cookie_partitioned,
    );
    if let Ok(value) = HeaderValue::from_str(&auth_cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    // The probe cookie served its purpose.
    let clear = cookie::clear_cookie(
        bastion_common::constants::TEST_COOKIE_NAME,
        &cookie_path(state),
        scope.as_deref(),
    );
    if let Ok(value) = HeaderValue::from_str(&clear) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    response
}

/// Hand the client a brand-new challenge page (used when the previous
/// record expired, vanished, or was already spent).
async fn reissue(
    state: &AppState,
    policy: &Arc<crate::policy::CompiledPolicy>,
    meta: &RequestMetadata,
    redir: &str,
) -> Response {
    let decision = match evaluate(state, policy, meta).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "policy evaluation failed during reissue");
            return error_page(state, "Internal server error", None, 500);
        }
    };

    let mut response = serve_challenge_page(state, policy, &decision, meta, redir).await;
    append_clear_cookie(state, &meta.host, &mut response);
    response
}

/// GET test-error: always renders the error page, for integration
/// tests of the branded error path.
pub async fn test_error(State(state): State<AppState>) -> Response {
    error_page(&state, "This is a test error", Some("test"), 500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_validation_relative() {
        assert!(validate_redirect("", "example.com", None).is_ok());
        assert!(validate_redirect("/", "example.com", None).is_ok());
        assert!(validate_redirect("/deep/path?q=1", "example.com", None).is_ok());
        assert!(validate_redirect("//evil.com/x", "example.com", None).is_err());
    }

    #[test]
    fn test_redirect_validation_schemes() {
        for redir in [
            "javascript:alert(1)",
            "vbscript:msgbox(\"XSS\")",
            "data:text/html;base64,PHNjcmlwdD4=",
            "ftp://example.com/",
            "file:///etc/passwd",
        ] {
            assert!(
                validate_redirect(redir, "example.com", None).is_err(),
                "{redir} must be rejected"
            );
        }
    }

    #[test]
    fn test_redirect_validation_hosts() {
        assert!(validate_redirect("https://example.com/x", "example.com", None).is_ok());
        assert!(validate_redirect("http://example.com/x", "example.com:8080", None).is_ok());
        assert!(validate_redirect("https://evil.com/x", "example.com", None).is_err());

        // Hosts under the cookie scope are part of the protected site.
        assert!(validate_redirect(
            "https://blog.example.com/x",
            "www.example.com",
            Some("example.com")
        )
        .is_ok());
        assert!(validate_redirect(
            "https://blog.evil.com/x",
            "www.example.com",
            Some("example.com")
        )
        .is_err());
    }
}
