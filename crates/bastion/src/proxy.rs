//! Streaming reverse proxy to the upstream origin.
//!
//! Admitted requests are forwarded with hop-by-hop headers stripped and
//! the original Host preserved; response bodies stream straight through.
//! An optional allow-list restricts which upstream targets may be dialed
//! and reloads on file change. When PROXY protocol forwarding is
//! enabled, each upstream connection is dialed fresh with a PROXY header
//! carrying the derived client address.

use axum::body::Body;
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderMap, HeaderName, Request, Response, Uri};
use bastion_common::BastionError;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use notify::RecommendedWatcher;
use parking_lot::RwLock;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::proxyproto::encode_header;

/// Hop-by-hop headers that must not be forwarded between client and
/// upstream.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

/// Allow-list of upstream targets, reloaded on file change.
pub struct AllowedTargets {
    targets: RwLock<Vec<String>>,
    path: PathBuf,
}

#[derive(Deserialize)]
struct AllowedTargetsFile {
    allowed_targets: Vec<String>,
}

impl AllowedTargets {
    pub fn load(path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let list = Arc::new(Self {
            targets: RwLock::new(Vec::new()),
            path,
        });
        list.reload()?;
        Ok(list)
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(&self.path)?;
        let parsed: AllowedTargetsFile = serde_json::from_str(&raw)?;
        *self.targets.write() = parsed.allowed_targets;
        Ok(())
    }

    pub fn is_allowed(&self, target: &str) -> bool {
        self.targets.read().iter().any(|t| t == target)
    }

    /// Attach a debounced watcher; keep the handle alive.
    pub fn watch(self: &Arc<Self>) -> notify::Result<RecommendedWatcher> {
        let list = self.clone();
        let path = self.path.clone();
        crate::watcher::watch_file(&path, move || {
            if let Err(e) = list.reload() {
                error!(error = %e, "allowed targets reload failed; keeping previous list");
            }
        })
    }
}

pub struct ReverseProxy {
    target: String,
    scheme: Scheme,
    authority: Authority,
    client: Client<HttpConnector, Body>,
    allowed: Option<Arc<AllowedTargets>>,
    /// PROXY protocol version (1 or 2) to speak on the upstream dial
    proxy_protocol_out: Option<u8>,
}

impl ReverseProxy {
    pub fn new(
        target: &str,
        allowed: Option<Arc<AllowedTargets>>,
        proxy_protocol_out: Option<u8>,
    ) -> Result<Self, BastionError> {
        let uri: Uri = target.parse().map_err(|e| {
            BastionError::InvalidConfig(format!("invalid target {target:?}: {e}"))
        })?;

        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = uri.authority().cloned().ok_or_else(|| {
            BastionError::InvalidConfig(format!("target {target:?} has no host"))
        })?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            target: target.to_string(),
            scheme,
            authority,
            client,
            allowed,
            proxy_protocol_out,
        })
    }

    fn dial_addr(&self) -> String {
        match self.authority.port() {
            Some(_) => self.authority.to_string(),
            None => {
                let port = if self.scheme == Scheme::HTTPS { 443 } else { 80 };
                format!("{}:{port}", self.authority.host())
            }
        }
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, BastionError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| BastionError::Internal(format!("can't build upstream URI: {e}")))
    }

    /// Forward an admitted request and stream the response back.
    pub async fn forward(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, BastionError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.is_allowed(&self.target) {
                warn!(target = %self.target, "target is not in the allow list");
                return Err(BastionError::UpstreamUnavailable(format!(
                    "target {} not allowed",
                    self.target
                )));
            }
        }

        let (mut head, body) = req.into_parts();
        strip_hop_by_hop(&mut head.headers);

        match (self.proxy_protocol_out, client_addr) {
            (Some(version), Some(addr)) => {
                self.forward_with_proxy_header(head, body, version, addr)
                    .await
            }
            _ => {
                head.uri = self.upstream_uri(&head.uri)?;
                let req = Request::from_parts(head, body);

                let resp = self.client.request(req).await.map_err(|e| {
                    BastionError::UpstreamUnavailable(format!("{}: {e}", self.target))
                })?;

                let mut resp = resp.map(Body::new);
                strip_hop_by_hop(resp.headers_mut());
                Ok(resp)
            }
        }
    }

    /// Dial a fresh connection, emit the PROXY header, then run HTTP/1
    /// over it. No pooling: each upstream connection carries exactly one
    /// client's header.
    async fn forward_with_proxy_header(
        &self,
        mut head: axum::http::request::Parts,
        body: Body,
        version: u8,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, BastionError> {
        let mut stream = TcpStream::connect(self.dial_addr()).await.map_err(|e| {
            BastionError::UpstreamUnavailable(format!("dial {}: {e}", self.authority))
        })?;

        stream
            .write_all(&encode_header(version, client_addr))
            .await
            .map_err(|e| {
                BastionError::UpstreamUnavailable(format!("PROXY header write: {e}"))
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| BastionError::UpstreamUnavailable(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream connection ended");
            }
        });

        // HTTP/1 over a raw connection wants an origin-form URI plus a
        // Host header.
        let path_and_query = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        head.uri = path_and_query.parse().map_err(|e| {
            BastionError::Internal(format!("can't build origin-form URI: {e}"))
        })?;
        if !head.headers.contains_key(header::HOST) {
            if let Ok(value) = self.authority.as_str().parse() {
                head.headers.insert(header::HOST, value);
            }
        }

        let resp = sender
            .send_request(Request::from_parts(head, body))
            .await
            .map_err(|e| BastionError::UpstreamUnavailable(format!("{}: {e}", self.target)))?;

        let mut resp = resp.map(Body::new);
        strip_hop_by_hop(resp.headers_mut());
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::io::Write;

    #[test]
    fn test_is_hop_by_hop() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("keep-alive")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("host")));
    }

    #[test]
    fn test_upstream_uri_build() {
        let proxy = ReverseProxy::new("http://localhost:3000", None, None).unwrap();
        let uri = proxy
            .upstream_uri(&"/api/test?foo=bar".parse().unwrap())
            .unwrap();
        assert_eq!(uri.to_string(), "http://localhost:3000/api/test?foo=bar");

        let uri = proxy.upstream_uri(&"/".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://localhost:3000/");
    }

    #[test]
    fn test_rejects_target_without_host() {
        assert!(ReverseProxy::new("not a url", None, None).is_err());
        assert!(ReverseProxy::new("/just/a/path", None, None).is_err());
    }

    #[test]
    fn test_allowed_targets_load_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, r#"{"allowed_targets":["http://a:1"]}"#).unwrap();

        let list = AllowedTargets::load(path.clone()).unwrap();
        assert!(list.is_allowed("http://a:1"));
        assert!(!list.is_allowed("http://b:2"));

        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"allowed_targets":["http://b:2"]}}"#).unwrap();
        drop(f);
        list.reload().unwrap();
        assert!(!list.is_allowed("http://a:1"));
        assert!(list.is_allowed("http://b:2"));
    }

    #[test]
    fn test_allowed_targets_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(AllowedTargets::load(path).is_err());
    }

    #[tokio::test]
    async fn test_forward_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream = Router::new().route(
            "/hello",
            get(|headers: axum::http::HeaderMap| async move {
                let ua = headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("hi {ua}")
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let proxy = ReverseProxy::new(&format!("http://{addr}"), None, None).unwrap();

        let req = Request::builder()
            .uri("/hello")
            .header(header::USER_AGENT, "proxytest")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();

        let resp = proxy.forward(req, None).await.unwrap();
        assert_eq!(resp.status(), 200);

        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"hi proxytest");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502_class() {
        // A port from the discard range that nothing listens on.
        let proxy = ReverseProxy::new("http://127.0.0.1:9", None, None).unwrap();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let err = proxy.forward(req, None).await.unwrap_err();
        assert!(matches!(err, BastionError::UpstreamUnavailable(_)));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_allow_list_gates_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, r#"{"allowed_targets":[]}"#).unwrap();
        let list = AllowedTargets::load(path).unwrap();

        let proxy =
            ReverseProxy::new("http://127.0.0.1:9", Some(list), None).unwrap();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let err = proxy.forward(req, None).await.unwrap_err();
        assert!(matches!(err, BastionError::UpstreamUnavailable(_)));
    }
}
