//! RTSP authentication: Basic (RFC 7617) and Digest (RFC 2617, MD5).
//!
//! A 401 response carries a challenge:
//!
//! ```text
//! RTSP/1.0 401 Unauthorized
//! CSeq: 2
//! WWW-Authenticate: Digest realm="LIVE555 Streaming Media", nonce="c633aaf8b83127"
//! ```
//!
//! The session installs an [`AuthContext`] built from the challenge and the
//! URL's userinfo, and every subsequent request carries the generated
//! `Authorization` header. A challenge without a `nonce` downgrades to
//! Basic credentials.

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;

use crate::error::{AuthErrorKind, Result, RtspError};

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    /// Present for Digest; absent means the server accepts Basic.
    pub nonce: Option<String>,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Accepts `<scheme> key="value", key="value"` and extracts `realm` and
    /// `nonce`; other parameters (qop, opaque, algorithm) are ignored.
    /// Returns `None` when no `realm` can be found.
    pub fn parse(header_value: &str) -> Option<Self> {
        let (_scheme, params) = header_value.split_once(' ')?;

        let mut realm = None;
        let mut nonce = None;
        for field in params.split(',') {
            let field = field.trim();
            if let Some((key, value)) = field.split_once('=') {
                let value = value.trim().trim_matches('"');
                match key.trim() {
                    "realm" => realm = Some(value.to_string()),
                    "nonce" => nonce = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        realm.map(|realm| Challenge { realm, nonce })
    }
}

/// Generates `Authorization` header values for every request once a 401
/// challenge has been answered.
#[derive(Debug, Clone)]
pub struct AuthContext {
    username: String,
    password: String,
    challenge: Challenge,
}

impl AuthContext {
    /// Build from a challenge header and credentials. Fails when the
    /// challenge has no realm or no credentials are available.
    pub fn new(
        header_value: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let challenge = Challenge::parse(header_value).ok_or(RtspError::Auth {
            kind: AuthErrorKind::NoRealm,
        })?;

        let username = match username {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => {
                return Err(RtspError::Auth {
                    kind: AuthErrorKind::NoCredentials,
                })
            }
        };

        Ok(AuthContext {
            username,
            password: password.unwrap_or("").to_string(),
            challenge,
        })
    }

    /// The `Authorization` header value for one request.
    ///
    /// Digest (RFC 2617 §3.2.2, MD5, no qop):
    /// `HA1 = md5(user:realm:pass)`, `HA2 = md5(method:uri)`,
    /// `response = md5(HA1:nonce:HA2)`. `uri` is the session URL with
    /// userinfo stripped.
    pub fn authorization(&self, method: &str, uri: &str) -> String {
        match &self.challenge.nonce {
            None => {
                let creds = format!("{}:{}", self.username, self.password);
                format!("Basic {}", BASE64_STANDARD.encode(creds))
            }
            Some(nonce) => {
                let ha1 = md5_hex(&format!(
                    "{}:{}:{}",
                    self.username, self.challenge.realm, self.password
                ));
                let ha2 = md5_hex(&format!("{method}:{uri}"));
                let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.username, self.challenge.realm, nonce, uri, response
                )
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
