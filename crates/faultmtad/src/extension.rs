//! The narrow contracts the session engine consumes.
//!
//! Everything a deployment might want to swap (where mail lands, who
//! may authenticate, who may send what, rate limits, event taps,
//! custom EHLO-label parsing and custom SMTP verbs) enters the core
//! through the traits here. `defaults.rs` supplies the out-of-the-box
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use esmtp::SessionState;
use std::collections::HashMap;

/// An authenticated identity, as asserted by the client and admitted
/// by the [`Authenticator`]. Nothing here is cryptographically
/// verified; this server exists to exercise clients, not to guard
/// mail.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub active: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A fully received message plus its connection context, as handed to
/// the [`MessageStore`] and to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Envelope sender, normalised.
    pub from: String,
    /// Envelope recipients in acceptance order, normalised.
    pub to: Vec<String>,
    /// Message content as received (dot-stuffing already unwound).
    pub content: String,
    /// Parsed header map; empty when the content has no parseable
    /// header block.
    pub headers: HashMap<String, String>,
    pub size: usize,
    pub client_ip: String,
    pub hostname: String,
    pub tls_used: bool,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a session, passed to observers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: String,
    pub client_ip: String,
    pub hostname: String,
    pub user: Option<User>,
    pub authenticated: bool,
    pub tls_active: bool,
    pub messages_sent: usize,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Where accepted messages go. Implementations must be safe for
/// concurrent use; every live session may call `store` at once.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, message: &StoredMessage) -> anyhow::Result<()>;
}

/// Decides whether an asserted username is admitted. The error text of
/// a rejection is not shown to the client; they get a plain 535.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: Option<&str>)
        -> anyhow::Result<User>;
}

/// What an (optionally authenticated) session may do.
pub trait Authorizer: Send + Sync {
    fn can_send_from(&self, user: Option<&User>, from: &str) -> bool;
    fn can_send_to(&self, user: Option<&User>, to: &str) -> bool;
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

/// Connection and message rate limiting. Called concurrently from all
/// sessions. `release_connection` is invoked on every session exit
/// path, so accounting can be symmetric.
pub trait RateLimiter: Send + Sync {
    fn allow_connection(&self, client_ip: &str) -> Decision;
    fn allow_message(&self, user: Option<&User>, client_ip: &str) -> Decision;
    fn record_connection(&self, client_ip: &str);
    fn record_message(&self, user: Option<&User>, client_ip: &str);
    fn release_connection(&self, client_ip: &str);
}

/// Session event notifications. All methods are fire-and-forget; no
/// observer can fail a session.
pub trait SessionObserver: Send + Sync {
    fn on_connect(&self, session: &SessionContext);
    fn on_auth(&self, session: &SessionContext, user: &User);
    fn on_message(&self, session: &SessionContext, message: &StoredMessage);
    fn on_error(&self, session: &SessionContext, error: &anyhow::Error, command: &str);
    fn on_disconnect(&self, session: &SessionContext, duration: std::time::Duration);
}

/// Hook over EHLO hostname-label parsing. Runs before capability
/// evaluation: it may consume parts (returning the remainder) and
/// stash extracted data in the session metadata.
pub trait CapabilityParser: Send + Sync {
    fn parse_capabilities(
        &self,
        hostname: &str,
        parts: Vec<String>,
    ) -> (Vec<String>, HashMap<String, serde_json::Value>);
}

/// The view of a session an extension command handler gets.
#[async_trait]
pub trait SessionControl: Send {
    async fn write_response(&mut self, line: &str) -> anyhow::Result<()>;
    fn metadata(&self) -> &HashMap<String, serde_json::Value>;
    fn set_metadata(&mut self, key: &str, value: serde_json::Value);
}

/// A pluggable SMTP verb and/or EHLO capability.
#[async_trait]
pub trait SmtpExtension: Send + Sync {
    /// Extra EHLO capability line; `None` advertises nothing.
    fn capability(&self) -> Option<String> {
        None
    }

    /// States in which `verb` may run; empty means any state.
    fn allowed_states(&self, verb: &str) -> Vec<SessionState> {
        let _ = verb;
        vec![]
    }

    /// Attempt to handle `verb`. Return `Ok(false)` to decline, in
    /// which case the next extension is consulted and finally the
    /// server answers 500.
    async fn handle_command(
        &self,
        verb: &str,
        args: &[String],
        session: &mut dyn SessionControl,
    ) -> anyhow::Result<bool>;
}

/// The bundle of collaborator implementations a session runs against.
#[derive(Clone)]
pub struct Services {
    pub store: std::sync::Arc<dyn MessageStore>,
    pub authenticator: std::sync::Arc<dyn Authenticator>,
    pub authorizer: std::sync::Arc<dyn Authorizer>,
    pub rate_limiter: std::sync::Arc<dyn RateLimiter>,
    pub observer: std::sync::Arc<dyn SessionObserver>,
    pub capability_parser: std::sync::Arc<dyn CapabilityParser>,
    pub extensions: Vec<std::sync::Arc<dyn SmtpExtension>>,
}
