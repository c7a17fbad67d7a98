//! Request ingress: real-IP derivation and base-prefix handling.
//!
//! The middleware chain runs in this order on every request:
//!
//! 1. PROXY-protocol source → X-Real-Ip (when PROXY parsing is enabled)
//! 2. leftmost X-Forwarded-For entry → X-Real-Ip (when absent)
//! 3. configured debug default → X-Real-Ip (test/debug only)
//! 4. append the immediate peer to X-Forwarded-For
//! 5. strip the configured base prefix off the path
//!
//! Everything downstream (policy evaluation, challenge issuance,
//! proxying) trusts X-Real-Ip as the derived client address.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HeaderValue;
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::Response;
use bastion_common::constants::headers::{X_FORWARDED_FOR, X_REAL_IP};
use tracing::debug;

use crate::proxyproto::ClientConn;
use crate::state::AppState;

/// 1. If the connection carried a PROXY header with a usable source
/// address, that address wins.
pub async fn proxy_proto_x_real_ip(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.config.proxy_protocol_enable {
        let source = req
            .extensions()
            .get::<ConnectInfo<ClientConn>>()
            .and_then(|info| info.0.proxy.as_ref())
            .and_then(|header| header.source);

        if let Some(source) = source {
            let ip = source.ip().to_string();
            debug!(ip = %ip, "setting X-Real-Ip from PROXY header");
            if let Ok(value) = HeaderValue::from_str(&ip) {
                req.headers_mut().insert(X_REAL_IP, value);
            }
        }
    }

    next.run(req).await
}

/// 2. Lift the leftmost X-Forwarded-For entry into X-Real-Ip when no
/// one upstream has set it yet.
pub async fn xff_to_x_real_ip(mut req: Request, next: Next) -> Response {
    if !req.headers().contains_key(X_REAL_IP) {
        let leftmost = req
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        if let Some(ip) = leftmost {
            if let Ok(value) = HeaderValue::from_str(&ip) {
                req.headers_mut().insert(X_REAL_IP, value);
            }
        }
    }

    next.run(req).await
}

/// 3. Debug aid: substitute a configured default when X-Real-Ip is
/// still empty. Only useful when running the gatekeeper directly on a
/// developer machine.
pub async fn default_x_real_ip(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !req.headers().contains_key(X_REAL_IP) {
        if let Some(default) = &state.config.debug_x_real_ip_default {
            if let Ok(value) = HeaderValue::from_str(default) {
                req.headers_mut().insert(X_REAL_IP, value);
            }
        }
    }

    next.run(req).await
}

/// Append an entry to an X-Forwarded-For value without ever producing
/// a double comma.
pub fn append_xff(existing: Option<&str>, peer: &str) -> String {
    match existing.map(|v| v.trim().trim_end_matches(',')) {
        None | Some("") => peer.to_string(),
        Some(existing) => format!("{existing}, {peer}"),
    }
}

/// 4. Record the immediate TCP peer in the forwarding chain before the
/// request moves on to the upstream.
pub async fn xff_update(mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<ClientConn>>()
        .map(|info| info.0.peer.ip().to_string());

    if let Some(peer) = peer {
        let existing = req
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let updated = append_xff(existing.as_deref(), &peer);
        if let Ok(value) = HeaderValue::from_str(&updated) {
            req.headers_mut().insert(X_FORWARDED_FOR, value);
        }
    }

    next.run(req).await
}

/// Strip `base` off the front of `path`. An exact match becomes `/`;
/// paths outside the prefix come back untouched.
pub fn strip_prefix_path(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }

    let base = base.trim_end_matches('/');
    match path.strip_prefix(base) {
        None => path.to_string(),
        Some("") | Some("/") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        // "/app" must not strip from "/application".
        Some(_) => path.to_string(),
    }
}

/// 5. Rewrite the request path with the base prefix removed. The
/// request is rebuilt rather than mutated in place: when nothing
/// changes the original moves on untouched.
pub async fn strip_base_prefix(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.strip_base_prefix || state.config.base_prefix.is_empty() {
        return next.run(req).await;
    }

    let path = req.uri().path();
    let stripped = strip_prefix_path(&state.config.base_prefix, path);
    if stripped == path {
        return next.run(req).await;
    }

    let path_and_query = match req.uri().query() {
        Some(q) => format!("{stripped}?{q}"),
        None => stripped,
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();
    let Ok(new_uri) = Uri::from_parts(parts) else {
        return next.run(req).await;
    };

    let (mut head, body) = req.into_parts();
    // Keep the client-facing URL around; redirects must send the
    // browser back to the prefixed path, not the one the upstream sees.
    head.extensions
        .insert(axum::extract::OriginalUri(head.uri.clone()));
    head.uri = new_uri;
    next.run(Request::from_parts(head, body)).await
}
