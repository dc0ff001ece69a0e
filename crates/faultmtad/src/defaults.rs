//! Out-of-the-box implementations of the pluggable contracts.

use crate::config::ServerConfig;
use crate::extension::{
    Authenticator, Authorizer, CapabilityParser, Decision, MessageStore, RateLimiter, Services,
    SessionContext, SessionObserver, StoredMessage, User,
};
use async_trait::async_trait;
use mailstore::{Envelope, Maildir};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_CONNS_PER_MINUTE: u32 = 60;
const MAX_MESSAGES_PER_MINUTE: u32 = 120;

/// Assemble the default service bundle for a configuration.
pub fn default_services(config: &ServerConfig) -> Services {
    Services {
        store: Arc::new(MaildirMessageStore::from_config(config)),
        authenticator: Arc::new(PatternAuthenticator),
        authorizer: Arc::new(AllowAllAuthorizer),
        rate_limiter: Arc::new(SlidingWindowRateLimiter::new()),
        observer: Arc::new(NoOpObserver),
        capability_parser: Arc::new(PassThroughCapabilityParser),
        extensions: vec![],
    }
}

/// Maildir-backed store, optionally routing by the hostname a message
/// was received for.
pub struct MaildirMessageStore {
    root: PathBuf,
    routing: Option<HostnameRouting>,
}

struct HostnameRouting {
    map: HashMap<String, PathBuf>,
    fallback: PathBuf,
}

impl MaildirMessageStore {
    pub fn from_config(config: &ServerConfig) -> Self {
        let routing = config.hostname_routing.then(|| HostnameRouting {
            map: config.hostname_maildirs.clone(),
            fallback: config
                .default_maildir
                .clone()
                .unwrap_or_else(|| config.maildir.clone()),
        });
        Self {
            root: config.maildir.clone(),
            routing,
        }
    }

    fn directory_for(&self, hostname: &str) -> PathBuf {
        let Some(routing) = &self.routing else {
            return self.root.clone();
        };
        let hostname = hostname.split(':').next().unwrap_or(hostname);
        routing
            .map
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| routing.fallback.clone())
    }
}

#[async_trait]
impl MessageStore for MaildirMessageStore {
    async fn store(&self, message: &StoredMessage) -> anyhow::Result<()> {
        let dir = self.directory_for(&message.hostname);
        let envelope = Envelope {
            from: message.from.clone(),
            to: message.to.clone(),
            content: message.content.clone(),
        };
        // Filesystem work happens off the async reactor.
        let id = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let maildir = Maildir::create(&dir)?;
            Ok(maildir.store_new(&envelope)?)
        })
        .await??;
        tracing::info!(
            from = %message.from,
            to = ?message.to,
            size = message.size,
            id = %id,
            "message stored",
        );
        Ok(())
    }
}

/// Admits any username that does not contain `badauth`. This is the
/// wire-selectable failure mode for authentication tests.
pub struct PatternAuthenticator;

#[async_trait]
impl Authenticator for PatternAuthenticator {
    async fn authenticate(
        &self,
        username: &str,
        _password: Option<&str>,
    ) -> anyhow::Result<User> {
        if username.contains("badauth") {
            anyhow::bail!("authentication failed for user {username}");
        }
        Ok(User {
            id: username.to_string(),
            username: username.to_string(),
            active: true,
            metadata: HashMap::from([(
                "auth_method".to_string(),
                serde_json::Value::from("pattern"),
            )]),
        })
    }
}

pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn can_send_from(&self, _user: Option<&User>, _from: &str) -> bool {
        true
    }
    fn can_send_to(&self, _user: Option<&User>, _to: &str) -> bool {
        true
    }
}

/// Per-IP counters over a one-minute window. Deliberately simple; a
/// conservative default, not a production limiter.
pub struct SlidingWindowRateLimiter {
    clients: Mutex<HashMap<String, ClientWindow>>,
    max_conns_per_minute: u32,
    max_messages_per_minute: u32,
}

struct ClientWindow {
    connections: u32,
    messages: u32,
    reset_at: Instant,
}

impl ClientWindow {
    fn fresh() -> Self {
        Self {
            connections: 0,
            messages: 0,
            reset_at: Instant::now() + Duration::from_secs(60),
        }
    }

    fn reset_if_expired(&mut self) {
        if Instant::now() >= self.reset_at {
            *self = Self::fresh();
        }
    }
}

impl SlidingWindowRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(MAX_CONNS_PER_MINUTE, MAX_MESSAGES_PER_MINUTE)
    }

    pub fn with_limits(max_conns_per_minute: u32, max_messages_per_minute: u32) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_conns_per_minute,
            max_messages_per_minute,
        }
    }

    fn with_window<R>(&self, client_ip: &str, f: impl FnOnce(&mut ClientWindow) -> R) -> R {
        let mut clients = self.clients.lock().unwrap();
        let window = clients
            .entry(client_ip.to_string())
            .or_insert_with(ClientWindow::fresh);
        window.reset_if_expired();
        f(window)
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn allow_connection(&self, client_ip: &str) -> Decision {
        self.with_window(client_ip, |w| {
            if w.connections >= self.max_conns_per_minute {
                Decision::Deny("rate limit exceeded: too many connections".to_string())
            } else {
                Decision::Allow
            }
        })
    }

    fn allow_message(&self, _user: Option<&User>, client_ip: &str) -> Decision {
        self.with_window(client_ip, |w| {
            if w.messages >= self.max_messages_per_minute {
                Decision::Deny("rate limit exceeded: too many messages".to_string())
            } else {
                Decision::Allow
            }
        })
    }

    fn record_connection(&self, client_ip: &str) {
        self.with_window(client_ip, |w| w.connections += 1);
    }

    fn record_message(&self, _user: Option<&User>, client_ip: &str) {
        self.with_window(client_ip, |w| w.messages += 1);
    }

    fn release_connection(&self, client_ip: &str) {
        self.with_window(client_ip, |w| {
            w.connections = w.connections.saturating_sub(1)
        });
    }
}

pub struct NoOpObserver;

impl SessionObserver for NoOpObserver {
    fn on_connect(&self, _session: &SessionContext) {}
    fn on_auth(&self, _session: &SessionContext, _user: &User) {}
    fn on_message(&self, _session: &SessionContext, _message: &StoredMessage) {}
    fn on_error(&self, _session: &SessionContext, _error: &anyhow::Error, _command: &str) {}
    fn on_disconnect(&self, _session: &SessionContext, _duration: Duration) {}
}

pub struct PassThroughCapabilityParser;

impl CapabilityParser for PassThroughCapabilityParser {
    fn parse_capabilities(
        &self,
        _hostname: &str,
        parts: Vec<String>,
    ) -> (Vec<String>, HashMap<String, serde_json::Value>) {
        (parts, HashMap::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn pattern_authenticator() {
        let auth = PatternAuthenticator;
        let user = auth.authenticate("alice", None).await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.active);

        assert!(auth.authenticate("badauth-user", None).await.is_err());
        assert!(auth.authenticate("has.badauth.inside", None).await.is_err());
    }

    #[test]
    fn rate_limiter_connection_window() {
        let limiter = SlidingWindowRateLimiter::with_limits(2, 1);

        assert_eq!(limiter.allow_connection("10.0.0.1"), Decision::Allow);
        limiter.record_connection("10.0.0.1");
        limiter.record_connection("10.0.0.1");
        assert!(matches!(
            limiter.allow_connection("10.0.0.1"),
            Decision::Deny(_)
        ));
        // Other addresses are unaffected.
        assert_eq!(limiter.allow_connection("10.0.0.2"), Decision::Allow);

        // Releasing makes room again.
        limiter.release_connection("10.0.0.1");
        assert_eq!(limiter.allow_connection("10.0.0.1"), Decision::Allow);

        limiter.record_message(None, "10.0.0.1");
        assert!(matches!(
            limiter.allow_message(None, "10.0.0.1"),
            Decision::Deny(_)
        ));
    }

    #[tokio::test]
    async fn maildir_store_routes_by_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            hostname_routing: true,
            maildir: dir.path().join("main"),
            default_maildir: Some(dir.path().join("fallback")),
            ..ServerConfig::default()
        };
        config
            .hostname_maildirs
            .insert("a.test".to_string(), dir.path().join("a"));

        let store = MaildirMessageStore::from_config(&config);
        let mut message = StoredMessage {
            from: "x@y".to_string(),
            to: vec!["z@w".to_string()],
            content: "body".to_string(),
            headers: HashMap::new(),
            size: 4,
            client_ip: "127.0.0.1".to_string(),
            hostname: "a.test".to_string(),
            tls_used: false,
            timestamp: chrono::Utc::now(),
        };
        store.store(&message).await.unwrap();
        assert_eq!(Maildir::create(dir.path().join("a")).unwrap().list().unwrap().len(), 1);

        message.hostname = "other.test".to_string();
        store.store(&message).await.unwrap();
        assert_eq!(
            Maildir::create(dir.path().join("fallback")).unwrap().list().unwrap().len(),
            1
        );
    }
}
