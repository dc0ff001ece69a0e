//! AUTH mechanism vocabulary and payload codecs.
//!
//! The session engine drives the 334 dialogues; this module only
//! decodes what the client sends. Credentials are never verified
//! cryptographically. The asserted username is what matters, and the
//! pluggable [`Authenticator`](crate::extension::Authenticator)
//! decides its fate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

static XOAUTH2_USER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"user=([^,\x01]+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
    CramSha256,
    XOAuth2,
}

impl Mechanism {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "CRAM-SHA256" => Some(Self::CramSha256),
            "XOAUTH2" => Some(Self::XOAuth2),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::CramSha256 => "CRAM-SHA256",
            Self::XOAuth2 => "XOAUTH2",
        }
    }
}

pub fn decode_base64(text: &str) -> Option<Vec<u8>> {
    BASE64.decode(text.trim()).ok()
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// PLAIN payload: `authzid NUL authcid NUL password`. Returns the
/// asserted username (authcid) and the password.
pub fn parse_plain_response(decoded: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8(decoded.to_vec()).ok()?;
    let mut parts = text.splitn(3, '\0');
    let _authzid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    if username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

/// CRAM response: `username SP hexdigest`. The digest is not checked.
pub fn parse_cram_response(decoded: &[u8]) -> Option<String> {
    let text = String::from_utf8(decoded.to_vec()).ok()?;
    let mut parts = text.splitn(2, ' ');
    let username = parts.next()?;
    let _digest = parts.next()?;
    if username.is_empty() {
        return None;
    }
    Some(username.to_string())
}

/// XOAUTH2 payload carries `user=<name>` delimited by ^A (or comma in
/// sloppy clients).
pub fn parse_xoauth2_user(decoded: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(decoded);
    XOAUTH2_USER_RE
        .captures(&text)
        .map(|caps| caps[1].to_string())
}

/// The CRAM challenge string, RFC 2195 style: `<unix.pid@identity>`.
pub fn cram_challenge(identity: &str) -> String {
    format!(
        "<{}.{}@{}>",
        chrono::Utc::now().timestamp(),
        std::process::id(),
        identity,
    )
}

/// Copy of AUTH command arguments safe for logging: the credential
/// payload is replaced wholesale.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = args.to_vec();
    if out.len() > 1 {
        out[1] = "[redacted]".to_string();
    }
    out
}
