//! HTTP route handlers and router assembly.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bastion_common::constants::{API_PREFIX, TEST_COOKIE_NAME};
use bastion_common::escape::html_escape;
use bastion_common::{Action, BastionError, Decision};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::challenge::{ChallengeImpl, ClientArtifact, IssueInput};
use crate::cookie;
use crate::metrics;
use crate::policy::{CompiledPolicy, RequestMetadata};
use crate::proxyproto::ClientConn;
use crate::state::AppState;

mod challenge;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // API routes always live under the base prefix; the strip middleware
    // only rewrites the path the policy and the upstream see, never where
    // the gatekeeper's own endpoints are reachable.
    let route_prefix = state.config.base_prefix.trim_end_matches('/').to_string();
    let api = |endpoint: &str| format!("{route_prefix}{API_PREFIX}{endpoint}");

    let mut router = Router::new()
        .route(&api("make-challenge"), post(challenge::make_challenge))
        .route(&api("pass-challenge"), get(challenge::pass_challenge))
        .route(&api("test-error"), get(challenge::test_error))
        .route("/healthz", get(health::health_check));

    if state.config.serve_robots_txt {
        router = router
            .route("/robots.txt", get(health::robots_txt))
            .route("/.well-known/robots.txt", get(health::robots_txt));
    }

    router = router.fallback(maybe_proxy);

    // Middleware chain; the last layer added runs first, so these are
    // listed innermost-to-outermost.
    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::ingress::strip_base_prefix,
        ))
        .layer(axum::middleware::from_fn(crate::ingress::xff_update))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::ingress::default_x_real_ip,
        ))
        .layer(axum::middleware::from_fn(crate::ingress::xff_to_x_real_ip))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::ingress::proxy_proto_x_real_ip,
        ))
        .with_state(state)
}

/// Router for the dedicated metrics listener.
pub fn create_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(|| async { metrics::render() }))
        .route("/healthz", get(health::health_check))
        .with_state(state)
}

/// Evaluate the policy for one request. CEL programs and FCrDNS checks
/// may block on DNS, so the walk runs on the blocking pool.
pub(crate) async fn evaluate(
    state: &AppState,
    policy: &Arc<CompiledPolicy>,
    meta: &RequestMetadata,
) -> Result<Decision, BastionError> {
    let policy = policy.clone();
    let meta = meta.clone();
    let dns = state.dns.clone();

    tokio::task::spawn_blocking(move || policy.check(&meta, &dns))
        .await
        .map_err(|e| BastionError::Internal(format!("policy evaluation panicked: {e}")))
}

/// Gatekeeper decision point for everything that is not an API route:
/// session-cookie fast path, then policy evaluation, then proxy /
/// deny / challenge.
async fn maybe_proxy(State(state): State<AppState>, req: Request) -> Response {
    let policy = state.policy.current();

    let meta = match RequestMetadata::from_request(&req) {
        Ok(meta) => meta,
        Err(e) => {
            error!(error = %e, "can't derive request metadata");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    // Fast path: a valid session cookie bound to a still-current rule
    // skips evaluation entirely. A cookie whose rule vanished in a
    // policy reload is honored briefly, then cleared.
    let token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| cookie::cookie_value(h, bastion_common::constants::COOKIE_NAME))
        .map(str::to_string);

    let mut stale_cookie = false;
    if let Some(token) = token {
        match state.signer.verify(&token) {
            Ok(claims) => {
                let now = chrono::Utc::now().timestamp();
                if policy.has_rule_hash(&claims.rule_hash) || claims.within_rule_grace(now) {
                    debug!(sub = %claims.sub, "valid session cookie; proxying");
                    return forward_upstream(&state, req).await;
                }
                debug!(sub = %claims.sub, "session cookie bound to a vanished rule");
                stale_cookie = true;
            }
            Err(e) => {
                debug!(error = %e, "session cookie failed verification");
                stale_cookie = true;
            }
        }
    }

    let decision = match evaluate(&state, &policy, &meta).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, "policy evaluation failed");
            return error_page(&state, "Internal server error", None, 500);
        }
    };

    metrics::POLICY_RESULTS
        .with_label_values(&[decision.rule.as_str(), decision.action.as_str()])
        .inc();

    info!(
        rule = %decision.rule,
        action = %decision.action,
        path = %meta.path,
        ip = %meta.remote_addr,
        "policy decision"
    );

    let mut response = match decision.action {
        Action::Allow => forward_upstream(&state, req).await,
        Action::Deny => {
            info!(rule = %decision.rule, hash = %decision.rule_hash, "request denied");
            error_page(
                &state,
                "Access denied",
                Some(&decision.rule_hash),
                policy.status_codes.deny,
            )
        }
        Action::Challenge | Action::Weigh => {
            // Prefer the pre-strip URI so the post-solve redirect lands
            // on the URL the browser actually requested.
            let uri = req
                .extensions()
                .get::<axum::extract::OriginalUri>()
                .map(|original| original.0.clone())
                .unwrap_or_else(|| req.uri().clone());
            let redir = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            serve_challenge_page(&state, &policy, &decision, &meta, &redir).await
        }
    };

    if stale_cookie {
        append_clear_cookie(&state, &meta.host, &mut response);
    }

    response
}

/// Hand the request to the reverse proxy, mapping failures to the
/// branded error page.
pub(crate) async fn forward_upstream(state: &AppState, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<ClientConn>>()
        .map(|info| info.0.client_addr());

    match state.proxy.forward(req, client_addr).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "upstream request failed");
            error_page(state, "Upstream unavailable", None, e.status_code())
        }
    }
}

/// Issue a challenge for this request and render the interstitial page.
pub(crate) async fn serve_challenge_page(
    state: &AppState,
    policy: &Arc<CompiledPolicy>,
    decision: &Decision,
    meta: &RequestMetadata,
    redir: &str,
) -> Response {
    let spec = decision
        .challenge
        .clone()
        .unwrap_or_else(|| policy.default_challenge());

    let (artifact, method) = match issue_challenge(state, &spec, decision, meta).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "challenge issuance failed");
            return error_page(state, "Internal server error", None, 500);
        }
    };

    challenge_page(
        state,
        &artifact,
        method.name(),
        &meta.host,
        redir,
        policy.status_codes.challenge,
    )
}

/// Create, persist, and return a fresh challenge for this client.
pub(crate) async fn issue_challenge(
    state: &AppState,
    spec: &bastion_common::ChallengeSpec,
    decision: &Decision,
    meta: &RequestMetadata,
) -> Result<(ClientArtifact, Arc<dyn ChallengeImpl>), BastionError> {
    let method = crate::challenge::get(&spec.algorithm).ok_or_else(|| {
        BastionError::Internal(format!("challenge algorithm {:?} vanished", spec.algorithm))
    })?;

    let record = crate::challenge::Challenge::new(
        spec,
        &decision.rule_hash,
        &meta.remote_addr.to_string(),
        &meta.user_agent,
    );

    let artifact = method
        .issue(&IssueInput {
            challenge: &record,
            store: &state.challenges,
        })
        .await?;

    Ok((artifact, method))
}

pub(crate) fn cookie_path(state: &AppState) -> String {
    if state.config.base_prefix.is_empty() {
        "/".to_string()
    } else {
        format!("{}/", state.config.base_prefix.trim_end_matches('/'))
    }
}

/// Add Set-Cookie headers that delete both gatekeeper cookies.
pub(crate) fn append_clear_cookie(state: &AppState, host: &str, response: &mut Response) {
    let domain = cookie::cookie_scope(state.config.cookie_domain.as_deref(), host);
    let path = cookie_path(state);

    for name in [bastion_common::constants::COOKIE_NAME, TEST_COOKIE_NAME] {
        let value = cookie::clear_cookie(name, &path, domain.as_deref());
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

/// Render the branded error page.
pub(crate) fn error_page(
    _state: &AppState,
    message: &str,
    error_id: Option<&str>,
    status: u16,
) -> Response {
    let error_id_html = match error_id {
        Some(id) if !id.is_empty() => format!(
            r#"<p class="error-id">Error ID: <code>{}</code></p>"#,
            html_escape(&id[..id.len().min(8)])
        ),
        _ => String::new(),
    };

    let html = format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Oh noes!</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #1a1a2e;
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            color: #e0e0e0;
            margin: 0;
        }}
        .container {{
            background: rgba(255, 255, 255, 0.05);
            border-radius: 16px;
            padding: 40px;
            max-width: 480px;
            text-align: center;
            border: 1px solid rgba(255, 255, 255, 0.1);
        }}
        h1 {{ color: #ff6b6b; }}
        .error-id {{ color: #888; font-size: 0.85rem; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Oh noes!</h1>
        <p>{message}</p>
        {error_id_html}
        <p>If this keeps happening, contact the site administrator.</p>
    </div>
</body>
</html>"##,
        message = html_escape(message),
        error_id_html = error_id_html,
    );

    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Html(html),
    )
        .into_response()
}

/// Render the challenge interstitial. The page carries the challenge
/// parameters as JSON and a small inline solver for the SHA-256 method;
/// it also sets the probe cookie so state survives a page reload.
pub(crate) fn challenge_page(
    state: &AppState,
    artifact: &ClientArtifact,
    algorithm: &str,
    host: &str,
    redir: &str,
    status: u16,
) -> Response {
    let payload = serde_json::json!({
        "id": artifact.id,
        "challenge": artifact.challenge,
        "difficulty": artifact.difficulty,
        "algorithm": algorithm,
        "basePrefix": state.config.base_prefix,
        "redir": redir,
    });

    let html = format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Making sure you're not a bot!</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #1a1a2e;
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            color: #e0e0e0;
            margin: 0;
        }}
        .container {{
            background: rgba(255, 255, 255, 0.05);
            border-radius: 16px;
            padding: 40px;
            max-width: 480px;
            text-align: center;
            border: 1px solid rgba(255, 255, 255, 0.1);
        }}
        h1 {{ color: #4a9eff; }}
        #status {{ color: #888; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Making sure you're not a bot!</h1>
        <p>Your browser is solving a small puzzle to protect this site
        from scrapers. This should only take a moment.</p>
        <p id="status">Working&hellip;</p>
        <noscript><p>Sadly, you must enable JavaScript to pass this
        check.</p></noscript>
    </div>
    <script id="anubis_challenge" type="application/json">{payload}</script>
    <script>
    (async () => {{
        const cfg = JSON.parse(document.getElementById("anubis_challenge").textContent);
        if (cfg.algorithm !== "fast" || !window.crypto || !window.crypto.subtle) {{
            document.getElementById("status").textContent =
                "This browser cannot solve the challenge automatically.";
            return;
        }}
        const t0 = Date.now();
        const enc = new TextEncoder();
        let nonce = 0, hex = "";
        const target = "0".repeat(cfg.difficulty);
        for (;;) {{
            const buf = await crypto.subtle.digest("SHA-256", enc.encode(cfg.challenge + nonce));
            hex = Array.from(new Uint8Array(buf)).map(b => b.toString(16).padStart(2, "0")).join("");
            if (hex.startsWith(target)) break;
            nonce++;
        }}
        const q = new URLSearchParams({{
            id: cfg.id,
            response: hex,
            nonce: String(nonce),
            elapsedTime: String(Date.now() - t0),
            redir: cfg.redir,
        }});
        window.location.replace(cfg.basePrefix +
            "/.within.website/x/cmd/anubis/api/pass-challenge?" + q.toString());
    }})();
    </script>
</body>
</html>"##,
        payload = payload,
    );

    let mut response = (
        StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED),
        Html(html),
    )
        .into_response();

    // Probe cookie: lets the challenge page recover its state when the
    // main cookie is blocked.
    let domain = cookie::cookie_scope(state.config.cookie_domain.as_deref(), host);
    let test_cookie = cookie::build_cookie(
        TEST_COOKIE_NAME,
        &artifact.id,
        &cookie_path(state),
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
