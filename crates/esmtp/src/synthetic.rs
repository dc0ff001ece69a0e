//! The client-driven error grammar.
//!
//! A MAIL FROM local part can carry one or more verb-prefixed tokens
//! that schedule synthetic replies for later commands in the same
//! transaction: `data552@example.com` makes the next DATA fail with
//! 552, `rset421_4.3.2@example.com` makes the next RSET answer
//! `421 4.3.2 …` (and, being a 421, hang up). HELO/EHLO use a separate
//! pattern on the hostname argument: `ehlo502.example.com`.

use crate::reply::{EnhancedStatusCode, SyntheticReply};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static ENHANCED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z]+)(\d{3})_(\d+)\.(\d+)\.(\d+)@").unwrap());
static BASIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z]+)(\d{3})@").unwrap());
static HELO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:helo|ehlo)(\d{3})\.").unwrap());

/// The commands a MAIL FROM local part can schedule a reply for.
/// `Mail` fires immediately (the MAIL FROM itself is rejected); `Rcpt`
/// is matched against each recipient address rather than the sender;
/// the rest are deferred until their command executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredVerb {
    Mail,
    Rcpt,
    Data,
    Bdat,
    Rset,
    Noop,
    StartTls,
    Quit,
    Auth,
}

impl DeferredVerb {
    /// The verbs scheduled from the sender address for later commands.
    pub const DEFERRABLE: [DeferredVerb; 7] = [
        DeferredVerb::Data,
        DeferredVerb::Bdat,
        DeferredVerb::Rset,
        DeferredVerb::Noop,
        DeferredVerb::StartTls,
        DeferredVerb::Quit,
        DeferredVerb::Auth,
    ];

    /// The lowercase token this verb uses in a local part.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Rcpt => "rcpt",
            Self::Data => "data",
            Self::Bdat => "bdat",
            Self::Rset => "rset",
            Self::Noop => "noop",
            Self::StartTls => "starttls",
            Self::Quit => "quit",
            Self::Auth => "auth",
        }
    }
}

/// Match a single verb's pattern against a mailbox address. The
/// enhanced form is tried first; digit runs in the triple are not
/// limited to single digits.
pub fn extract(verb: DeferredVerb, mailbox: &str) -> Option<SyntheticReply> {
    let mailbox = mailbox.to_lowercase();

    if let Some(caps) = ENHANCED_RE.captures(&mailbox) {
        if &caps[1] == verb.token() {
            let code: u16 = caps[2].parse().ok()?;
            let enhanced = EnhancedStatusCode {
                class: caps[3].parse().ok()?,
                subject: caps[4].parse().ok()?,
                detail: caps[5].parse().ok()?,
            };
            return Some(SyntheticReply {
                code,
                enhanced: Some(enhanced),
            });
        }
    }

    if let Some(caps) = BASIC_RE.captures(&mailbox) {
        if &caps[1] == verb.token() {
            let code: u16 = caps[2].parse().ok()?;
            return Some(SyntheticReply::new(code));
        }
    }

    None
}

/// HELO/EHLO hostnames use `helo<NNN>.domain` / `ehlo<NNN>.domain`,
/// firing at that command. No enhanced form.
pub fn extract_helo(hostname: &str) -> Option<SyntheticReply> {
    let hostname = hostname.to_lowercase();
    let caps = HELO_RE.captures(&hostname)?;
    let code: u16 = caps[1].parse().ok()?;
    Some(SyntheticReply::new(code))
}

/// The per-transaction schedule of deferred replies, keyed by verb.
/// Populated from the accepted sender, cleared when the transaction
/// ends. A scheduled reply fires every time its command runs until the
/// schedule is cleared.
#[derive(Debug, Clone, Default)]
pub struct PendingReplies {
    replies: HashMap<DeferredVerb, SyntheticReply>,
}

impl PendingReplies {
    /// Build the schedule for a freshly accepted MAIL FROM, replacing
    /// anything left over from a prior sender.
    pub fn schedule_from_sender(mailbox: &str) -> Self {
        let mut replies = HashMap::new();
        for verb in DeferredVerb::DEFERRABLE {
            if let Some(reply) = extract(verb, mailbox) {
                replies.insert(verb, reply);
            }
        }
        Self { replies }
    }

    pub fn get(&self, verb: DeferredVerb) -> Option<SyntheticReply> {
        self.replies.get(&verb).copied()
    }

    pub fn clear(&mut self) {
        self.replies.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}
