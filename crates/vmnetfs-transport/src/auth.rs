//! HTTP Basic and Digest (RFC 7616) authentication headers.
//!
//! Digest state is not cached across fetches: each call to
//! [`digest_header`] is given a freshly parsed [`DigestChallenge`] from
//! that fetch's own 401 response. A server that rotates nonces
//! aggressively can force an extra round trip per fetch; the retry loop
//! in [`crate::pool`] already tolerates that.

use base64::Engine as _;
use md5::{Digest as _, Md5};
use std::time::{SystemTime, UNIX_EPOCH};

/// Credentials configured for an origin.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

/// `Authorization: Basic <base64(user:pass)>`.
pub fn basic_header(username: &str, password: &str) -> String {
    let raw = format!("{username}:{password}");
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` if it is
    /// not a Digest challenge or is missing `realm`/`nonce`.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest ")?;
        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;

        for part in split_params(rest) {
            let (key, value) = part.split_once('=')?;
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "qop" => qop = Some(value.to_string()),
                "opaque" => opaque = Some(value.to_string()),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            qop,
            opaque,
        })
    }
}

/// Split a comma-separated `key=value` param list, respecting quotes.
fn split_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                cur.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }
    parts
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Build an `Authorization: Digest` header for one request against
/// `challenge`, using `qop=auth` with nonce-count `00000001` when the
/// server offered `qop`.
pub fn digest_header(
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
) -> String {
    let cnonce = cnonce(&challenge.nonce);
    let ha1 = md5_hex(&format!("{username}:{}:{password}", challenge.realm));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    const NC: &str = "00000001";

    let response = if challenge.qop.is_some() {
        md5_hex(&format!(
            "{ha1}:{}:{NC}:{cnonce}:auth:{ha2}",
            challenge.nonce
        ))
    } else {
        md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce))
    };

    let mut header = format!(
        "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
        challenge.realm, challenge.nonce
    );
    if challenge.qop.is_some() {
        header.push_str(&format!(", qop=auth, nc={NC}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    header
}

fn cnonce(nonce: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    md5_hex(&format!("{nanos}{nonce}"))[..8].to_string()
}
