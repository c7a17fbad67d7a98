//! Signed session tokens and cookie scoping.
//!
//! After a successful challenge the client receives a compact signed
//! envelope: three base64url segments (header JSON, payload JSON,
//! Ed25519 signature over the first two). The server holds a long-lived
//! keypair; verifiers only need the public key. Tokens whose header
//! declares anything but EdDSA are rejected outright.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bastion_common::constants::{
    COOKIE_RULE_GRACE_SECS, DYNAMIC_COOKIE_DOMAIN, MULTI_LABEL_SUFFIXES,
};
use bastion_common::BastionError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// What a session token binds together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Challenge ID the token was issued for
    pub sub: String,

    /// Issued at (unix seconds)
    pub iat: i64,

    /// Expires at (unix seconds)
    pub exp: i64,

    /// Fingerprint of the rule that issued the challenge
    #[serde(default)]
    pub rule_hash: String,

    /// Cookie domain the token was scoped to
    #[serde(default)]
    pub scope: String,
}

impl SessionClaims {
    /// Whether the originating rule may be missing from the current
    /// policy without invalidating the token. Fresh tokens get a grace
    /// window so a policy reload doesn't instantly log everyone out.
    pub fn within_rule_grace(&self, now: i64) -> bool {
        now - self.iat <= COOKIE_RULE_GRACE_SECS
    }
}

pub struct TokenSigner {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl TokenSigner {
    /// Load a 32-byte Ed25519 private key from a file, or generate an
    /// ephemeral one. Ephemeral keys invalidate all outstanding cookies
    /// on restart, which is fine for development and surprising in
    /// production, hence the warning.
    pub fn load_or_generate(path: Option<&Path>) -> Result<Self, BastionError> {
        let signing = match path {
            Some(path) => {
                let key_bytes = std::fs::read(path).map_err(|e| {
                    BastionError::InvalidConfig(format!(
                        "can't read signing key {}: {e}",
                        path.display()
                    ))
                })?;

                if key_bytes.len() != 32 {
                    return Err(BastionError::InvalidConfig(format!(
                        "signing key {} must be exactly 32 bytes, got {}",
                        path.display(),
                        key_bytes.len()
                    )));
                }

                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&key_bytes);
                SigningKey::from_bytes(&bytes)
            }
            None => {
                use rand_core::OsRng;
                warn!("using ephemeral signing key (cookies will not survive a restart)");
                SigningKey::generate(&mut OsRng)
            }
        };

        let verifying = signing.verifying_key();
        Ok(Self { signing, verifying })
    }

    /// Public key, base64url, for distribution to external verifiers.
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying.as_bytes())
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, BastionError> {
        let header = TokenHeader {
            alg: "EdDSA".to_string(),
            typ: "JWT".to_string(),
        };

        let header_json = serde_json::to_vec(&header)
            .map_err(|e| BastionError::Internal(format!("can't encode token header: {e}")))?;
        let payload_json = serde_json::to_vec(claims)
            .map_err(|e| BastionError::Internal(format!("can't encode token payload: {e}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&header_json),
            URL_SAFE_NO_PAD.encode(&payload_json)
        );
        let signature = self.signing.sign(signing_input.as_bytes());

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// Verify a token: structure, algorithm, signature, timestamps.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, BastionError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => {
                    return Err(BastionError::InvalidFormat(
                        "token must have exactly three segments".to_string(),
                    ))
                }
            };

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| BastionError::InvalidFormat("bad header encoding".to_string()))?;
        let header: TokenHeader = serde_json::from_slice(&header_json)
            .map_err(|_| BastionError::InvalidFormat("bad header JSON".to_string()))?;

        if header.alg != "EdDSA" {
            return Err(BastionError::InvalidFormat(format!(
                "unknown token algorithm {:?}",
                header.alg
            )));
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| BastionError::InvalidFormat("bad signature encoding".to_string()))?;
        if sig_bytes.len() != 64 {
            return Err(BastionError::InvalidFormat(
                "bad signature length".to_string(),
            ));
        }
        let mut sig_array = [0u8; 64];
        sig_array.copy_from_slice(&sig_bytes);
        let signature = Signature::from_bytes(&sig_array);

        let signing_input = format!("{header_b64}.{payload_b64}");
        self.verifying
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| BastionError::InvalidFormat("signature mismatch".to_string()))?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| BastionError::InvalidFormat("bad payload encoding".to_string()))?;
        let claims: SessionClaims = serde_json::from_slice(&payload_json)
            .map_err(|_| BastionError::InvalidFormat("bad payload JSON".to_string()))?;

        let now = chrono::Utc::now().timestamp();
        if now < claims.iat - 60 {
            return Err(BastionError::InvalidFormat(
                "token issued in the future".to_string(),
            ));
        }
        if now >= claims.exp {
            return Err(BastionError::Expired("token expired".to_string()));
        }

        Ok(claims)
    }
}

/// Derive the effective cookie domain for a request host. The
/// `DYNAMIC_SECOND_LEVEL_DOMAIN` sentinel keeps the last two labels of
/// the host, except under known multi-label public suffixes where one
/// extra label is kept; any other configured value is used verbatim.
/// `None` means no Domain attribute at all.
pub fn cookie_scope(configured: Option<&str>, host: &str) -> Option<String> {
    let configured = configured?;
    if configured != DYNAMIC_COOKIE_DOMAIN {
        return Some(configured.to_string());
    }

    let host = host.rsplit_once(':').map_or(host, |(h, _)| {
        // Only strip a real port; IPv6 literals keep their colons.
        if h.contains(':') {
            host
        } else {
            h
        }
    });

    if host.parse::<std::net::IpAddr>().is_ok() {
        return Some(host.to_string());
    }

    let labels: Vec<&str> = host.split('.').collect();

    for suffix in MULTI_LABEL_SUFFIXES {
        let suffix_labels = suffix.split('.').count();
        if labels.len() > suffix_labels && host.ends_with(&format!(".{suffix}")) {
            let keep = suffix_labels + 1;
            return Some(labels[labels.len() - keep..].join("."));
        }
    }

    if labels.len() <= 2 {
        return Some(host.to_string());
    }

    Some(labels[labels.len() - 2..].join("."))
}

/// Render a Set-Cookie header value.
pub fn build_cookie(
    name: &str,
    value: &str,
    path: &str,
    domain: Option<&str>,
    max_age: i64,
    secure: bool,
    partitioned: bool,
) -> String {
    let mut cookie = format!("{name}={value}; Path={path}; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if let Some(domain) = domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if secure {
        cookie.push_str("; Secure");
    }
    if partitioned {
        cookie.push_str("; Partitioned");
    }
    cookie
}

/// Render a Set-Cookie header value that deletes a cookie.
pub fn clear_cookie(name: &str, path: &str, domain: Option<&str>) -> String {
    build_cookie(name, "", path, domain, -1, false, false)
}

/// Pull one cookie's value out of a Cookie request header.
pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_common::constants::COOKIE_NAME;

    fn signer() -> TokenSigner {
        TokenSigner::load_or_generate(None).unwrap()
    }

    fn claims() -> SessionClaims {
        let now = chrono::Utc::now().timestamp();
        SessionClaims {
            sub: "some-challenge-id".to_string(),
            iat: now,
            exp: now + 600,
            rule_hash: "abcd1234".to_string(),
            scope: "example.com".to_string(),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = signer();
        let claims = claims();

        let token = signer.sign(&claims).unwrap();
        let got = signer.verify(&token).unwrap();

        assert_eq!(got.sub, claims.sub);
        assert_eq!(got.rule_hash, claims.rule_hash);
        assert_eq!(got.scope, claims.scope);
    }

    /// Any single-bit mutation of the encoded token must fail
    /// verification (or fail to decode at all).
    #[test]
    fn test_any_bit_flip_is_rejected() {
        let signer = signer();
        let token = signer.sign(&claims()).unwrap();
        let bytes = token.as_bytes();

        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut mutated = bytes.to_vec();
                mutated[i] ^= 1 << bit;
                let Ok(mutated) = String::from_utf8(mutated) else {
                    continue;
                };
                if mutated == token {
                    continue;
                }
                assert!(
                    signer.verify(&mutated).is_err(),
                    "bit {bit} of byte {i} flipped and the token still verified"
                );
            }
        }
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let signer = signer();
        let token = signer.sign(&claims()).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();

        let forged_header =
            URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        parts[0] = &forged_header;
        let forged = parts.join(".");

        let err = signer.verify(&forged).unwrap_err();
        assert!(matches!(err, BastionError::InvalidFormat(_)));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let signer = signer();
        let now = chrono::Utc::now().timestamp();
        let token = signer
            .sign(&SessionClaims {
                sub: "x".to_string(),
                iat: now - 700,
                exp: now - 100,
                rule_hash: String::new(),
                scope: String::new(),
            })
            .unwrap();

        let err = signer.verify(&token).unwrap_err();
        assert!(matches!(err, BastionError::Expired(_)));
    }

    #[test]
    fn test_different_key_is_rejected() {
        let a = signer();
        let b = signer();
        let token = a.sign(&claims()).unwrap();
        assert!(b.verify(&token).is_err());
    }

    #[test]
    fn test_cookie_scope_vectors() {
        for (host, want) in [
            ("xeiaso.net", "xeiaso.net"),
            ("blog.xeiaso.net", "xeiaso.net"),
            ("a.b.c.example.com", "example.com"),
            ("foo.shark-harmonic.ts.net", "shark-harmonic.ts.net"),
            ("deep.foo.shark-harmonic.ts.net", "shark-harmonic.ts.net"),
            ("www.bbc.co.uk", "bbc.co.uk"),
            ("localhost", "localhost"),
            ("127.0.0.1", "127.0.0.1"),
            ("blog.xeiaso.net:8443", "xeiaso.net"),
        ] {
            assert_eq!(
                cookie_scope(Some(DYNAMIC_COOKIE_DOMAIN), host).as_deref(),
                Some(want),
                "host {host}"
            );
        }
    }

    #[test]
    fn test_cookie_scope_verbatim_and_absent() {
        assert_eq!(
            cookie_scope(Some("techaro.lol"), "anything.example.com").as_deref(),
            Some("techaro.lol")
        );
        assert_eq!(cookie_scope(None, "example.com"), None);
    }

    #[test]
    fn test_build_and_clear_cookie() {
        let set = build_cookie(COOKIE_NAME, "tok", "/", Some("example.com"), 600, true, true);
        assert!(set.starts_with(&format!("{COOKIE_NAME}=tok")));
        assert!(set.contains("Max-Age=600"));
        assert!(set.contains("Domain=example.com"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains("SameSite=Lax"));
        assert!(set.contains("Secure"));
        assert!(set.contains("Partitioned"));

        let clear = clear_cookie(COOKIE_NAME, "/", None);
        assert!(clear.contains("Max-Age=-1"));
        assert!(!clear.contains("Domain="));
    }

    #[test]
    fn test_cookie_value_extraction() {
        let header = format!("a=1; {COOKIE_NAME}=the-token; b=2");
        assert_eq!(cookie_value(&header, COOKIE_NAME), Some("the-token"));
        assert_eq!(cookie_value(&header, "a"), Some("1"));
        assert_eq!(cookie_value(&header, "missing"), None);
    }
}
