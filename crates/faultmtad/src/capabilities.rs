//! EHLO capability negotiation.
//!
//! The leftmost label of the EHLO hostname is a miniature
//! configuration language: dash-separated, case-insensitive tokens
//! that disable or tune the capabilities this session will advertise.
//! Unknown tokens are ignored; the command never fails on them.

use once_cell::sync::Lazy;
use regex::Regex;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"size(\d+)").unwrap());
static DLAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^dlay(\d+)$").unwrap());

pub const ADVERTISED_SIZE_MIN: u64 = 1000;
pub const ADVERTISED_SIZE_MAX: u64 = 10_000_000;
pub const COMMAND_DELAY_MAX_SECS: u64 = 605;

const ALL_AUTH_MECHANISMS: &str = "PLAIN LOGIN CRAM-MD5 CRAM-SHA256 XOAUTH2";

/// Which extensions this session advertises. Everything defaults to
/// off until an EHLO negotiates; a HELO-only session keeps the zero
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub size: bool,
    pub pipelining: bool,
    pub enhanced_status_codes: bool,
    pub smtputf8: bool,
    pub chunking: bool,
    pub starttls: bool,
    pub eight_bit_mime: bool,
}

/// The outcome of parsing one EHLO hostname label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub capabilities: Capabilities,
    /// `size<N>` value after clamping; `None` means the global default
    /// applies.
    pub advertised_size: Option<u64>,
    /// `dlay<N>` per-command delay in seconds, clamped.
    pub command_delay_secs: u64,
    /// AUTH line content, or `None` when `noauth` suppressed it.
    pub auth_mechanisms: Option<&'static str>,
    /// `reject`/`noehl` asked us to refuse the EHLO outright.
    pub rejected: bool,
}

/// Split the leftmost hostname label into lowercase dash-separated
/// parts.
pub fn parse_label(hostname: &str) -> Vec<String> {
    let label = hostname.split('.').next().unwrap_or(hostname);
    label
        .to_lowercase()
        .split('-')
        .map(|s| s.to_string())
        .collect()
}

fn has_part(parts: &[String], pattern: &str) -> bool {
    parts.iter().any(|p| p.contains(pattern))
}

fn parse_size_value(parts: &[String]) -> Option<u64> {
    for part in parts {
        if let Some(caps) = SIZE_RE.captures(part) {
            if let Ok(value) = caps[1].parse::<u64>() {
                if value == 0 {
                    continue;
                }
                return Some(value.clamp(ADVERTISED_SIZE_MIN, ADVERTISED_SIZE_MAX));
            }
        }
    }
    None
}

/// Parse a single label part as `dlay<N>`; anything else is 0.
pub fn parse_dlay_value(part: &str) -> u64 {
    DLAY_RE
        .captures(part)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .map(|v| v.min(COMMAND_DELAY_MAX_SECS))
        .unwrap_or(0)
}

/// Evaluate the parts against the default-on capability set.
/// `tls_active` suppresses STARTTLS advertising on its own.
pub fn negotiate(parts: &[String], tls_active: bool) -> Negotiated {
    if has_part(parts, "reject") || has_part(parts, "noehl") {
        return Negotiated {
            capabilities: Capabilities::default(),
            advertised_size: None,
            command_delay_secs: 0,
            auth_mechanisms: None,
            rejected: true,
        };
    }

    let capabilities = Capabilities {
        size: !has_part(parts, "nosize"),
        pipelining: !has_part(parts, "nopipelining"),
        enhanced_status_codes: !has_part(parts, "noenhancedstatuscodes"),
        smtputf8: !has_part(parts, "nosmtputf8"),
        chunking: !has_part(parts, "nochunking"),
        starttls: !has_part(parts, "nostarttls") && !tls_active,
        eight_bit_mime: !has_part(parts, "no8bit"),
    };

    let auth_mechanisms = if has_part(parts, "noauth") {
        None
    } else {
        // Restriction tokens: the last one mentioned wins.
        let mut chosen = ALL_AUTH_MECHANISMS;
        for part in parts {
            if part.contains("authplain") {
                chosen = "PLAIN";
            } else if part.contains("authlogin") {
                chosen = "LOGIN";
            } else if part.contains("authcram") {
                chosen = "CRAM-MD5 CRAM-SHA256";
            } else if part.contains("authoauth") {
                chosen = "XOAUTH2";
            }
        }
        Some(chosen)
    };

    let command_delay_secs = parts.iter().map(|p| parse_dlay_value(p)).max().unwrap_or(0);

    Negotiated {
        capabilities,
        advertised_size: parse_size_value(parts),
        command_delay_secs,
        auth_mechanisms,
        rejected: false,
    }
}

/// Assemble the EHLO multi-line reply. `extension_capabilities` are
/// the extra lines registered extensions advertise.
pub fn build_ehlo_lines(
    identity: &str,
    negotiated: &Negotiated,
    default_size: u64,
    extension_capabilities: &[String],
) -> Vec<String> {
    let mut lines = vec![format!("250-{identity}")];
    let caps = &negotiated.capabilities;

    if let Some(mechanisms) = negotiated.auth_mechanisms {
        lines.push(format!("250-AUTH {mechanisms}"));
    }
    if caps.eight_bit_mime {
        lines.push("250-8BITMIME".to_string());
    }
    if caps.size {
        let size = negotiated.advertised_size.unwrap_or(default_size);
        lines.push(format!("250-SIZE {size}"));
    }
    if caps.pipelining {
        lines.push("250-PIPELINING".to_string());
    }
    if caps.starttls {
        lines.push("250-STARTTLS".to_string());
    }
    if caps.chunking {
        lines.push("250-CHUNKING".to_string());
    }
    if caps.smtputf8 {
        lines.push("250-SMTPUTF8".to_string());
    }
    if caps.enhanced_status_codes {
        lines.push("250-ENHANCEDSTATUSCODES".to_string());
    }
    for capability in extension_capabilities {
        lines.push(format!("250-{capability}"));
    }
    lines.push("250 OK".to_string());
    lines
}
