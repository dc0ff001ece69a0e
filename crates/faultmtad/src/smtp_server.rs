//! The per-connection SMTP session engine.
//!
//! One task per connection. The session owns a boxed socket plus its
//! own read buffer, so the socket can be taken for a STARTTLS
//! handshake and replaced with the TLS stream, and so the pipelining
//! peek, BDAT exact reads and DATA dot-reader all share the same
//! buffered view of the stream.

use crate::auth::{self, Mechanism};
use crate::capabilities::{self, Capabilities};
use crate::config::{
    PortBehaviour, ServerConfig, MAX_COMMAND_LINE, SERVER_GREETING,
};
use crate::extension::{Decision, Services, SessionContext, SessionControl, StoredMessage, User};
use crate::lifecycle::ShutdownSubscription;
use crate::tls_helpers;
use anyhow::Context;
use async_trait::async_trait;
use esmtp::address;
use esmtp::synthetic::{self, DeferredVerb, PendingReplies};
use esmtp::{Command, ParseError, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

/// Deadline for the non-blocking peek that detects a pipelining burst,
/// and for consuming the optional CRLF after a BDAT chunk.
const PIPELINING_PEEK: Duration = Duration::from_millis(10);

/// Upper bound on the final write when a session is torn down by the
/// shutdown hook.
const SHUTDOWN_WRITE_DEADLINE: Duration = Duration::from_secs(5);

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

pub type BoxedSocket = Box<dyn AsyncReadAndWrite>;

/// Everything the listener decides about a session before the first
/// byte flows.
#[derive(Clone)]
pub struct SessionParams {
    pub config: Arc<ServerConfig>,
    pub port: u16,
    pub behaviour: PortBehaviour,
    /// The identity this session serves (SNI name on implicit TLS,
    /// else the configured TLS hostname). Used in the banner, the EHLO
    /// reply, and maildir routing.
    pub hostname: String,
    pub peer_ip: String,
    /// True when the listener already completed a TLS handshake.
    pub tls_active: bool,
}

pub struct SmtpServer {
    socket: Option<BoxedSocket>,
    read_buffer: Vec<u8>,
    params: SessionParams,
    services: Services,
    shutdown: ShutdownSubscription,

    state: SessionState,
    helo_name: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    pending: PendingReplies,
    response_queue: Vec<String>,
    pipelining_mode: bool,
    bdat_buffer: Vec<u8>,
    bdat_oversize: bool,
    capabilities: Capabilities,
    advertised_size: Option<u64>,
    command_delay: Duration,
    authenticated: bool,
    auth_user: Option<User>,
    tls_active: bool,
    metadata: HashMap<String, serde_json::Value>,

    session_id: uuid::Uuid,
    start_time: Instant,
    messages_sent: usize,
    done: bool,
}

enum ReadOutcome {
    Data,
    Eof,
    Shutdown,
    TimedOut,
}

enum DataBody {
    Complete(String),
    TooLarge,
}

enum AuthAttempt {
    Credentials {
        username: String,
        password: Option<String>,
    },
    Malformed,
}

impl SmtpServer {
    pub async fn run(
        socket: BoxedSocket,
        params: SessionParams,
        services: Services,
        shutdown: ShutdownSubscription,
    ) -> anyhow::Result<()> {
        let session_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "smtp_session",
            session = %session_id,
            peer = %params.peer_ip,
            port = params.port,
        );

        let tls_active = params.tls_active;
        let mut server = SmtpServer {
            socket: Some(socket),
            read_buffer: Vec::new(),
            params,
            services,
            shutdown,
            state: SessionState::Greeting,
            helo_name: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            pending: PendingReplies::default(),
            response_queue: Vec::new(),
            pipelining_mode: false,
            bdat_buffer: Vec::new(),
            bdat_oversize: false,
            capabilities: Capabilities::default(),
            advertised_size: None,
            command_delay: Duration::ZERO,
            authenticated: false,
            auth_user: None,
            tls_active,
            metadata: HashMap::new(),
            session_id,
            start_time: Instant::now(),
            messages_sent: 0,
            done: false,
        };
        async move { server.process().await }.instrument(span).await
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        tracing::info!(tls = self.tls_active, "connection established");

        if let Decision::Deny(reason) = self.services.rate_limiter.allow_connection(&self.params.peer_ip)
        {
            tracing::warn!(reason = %reason, "connection rejected by rate limiter");
            self.write_response(&format!("421 {reason}")).await.ok();
            self.close_socket().await;
            return Ok(());
        }
        self.services.rate_limiter.record_connection(&self.params.peer_ip);
        self.services.observer.on_connect(&self.context());

        let result = self.conversation().await;

        if let Err(err) = &result {
            self.services
                .observer
                .on_error(&self.context(), err, "session");
        }
        self.services
            .rate_limiter
            .release_connection(&self.params.peer_ip);
        self.services
            .observer
            .on_disconnect(&self.context(), self.start_time.elapsed());
        self.close_socket().await;
        tracing::info!(
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "connection closed"
        );
        result
    }

    async fn conversation(&mut self) -> anyhow::Result<()> {
        let behaviour = self.params.behaviour;

        if behaviour.drop_immediate {
            tracing::info!("behaviour triggered: immediate drop");
            self.close_socket().await;
            return Ok(());
        }

        if !behaviour.greeting_delay.is_zero() {
            tracing::info!(
                delay_secs = behaviour.greeting_delay.as_secs(),
                "behaviour triggered: greeting delay"
            );
            if self.sleep_or_shutdown(behaviour.greeting_delay).await {
                return self.shutdown_close().await;
            }
        }

        let banner = format!("220 {} ESMTP {}", self.identity(), SERVER_GREETING);
        self.write_response(&banner).await?;
        self.state = SessionState::Helo;

        if let Some(delay) = behaviour.drop_delay {
            tracing::info!(
                delay_secs = delay.as_secs(),
                "behaviour triggered: drop delay"
            );
            if self.sleep_or_shutdown(delay).await {
                return self.shutdown_close().await;
            }
            self.close_socket().await;
            return Ok(());
        }

        self.command_loop().await
    }

    async fn command_loop(&mut self) -> anyhow::Result<()> {
        while !self.done {
            let Some(line) = self.read_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if line.len() > MAX_COMMAND_LINE {
                tracing::warn!(length = line.len(), "command length limit exceeded");
                self.write_response("500 Command too long").await?;
                continue;
            }

            if self.capabilities.pipelining {
                let burst = self.detect_pipelining().await?;
                if burst && !self.pipelining_mode {
                    self.pipelining_mode = true;
                    tracing::debug!("pipelining detected; queueing responses");
                } else if !burst && self.pipelining_mode {
                    // Burst exhausted: deliver what we owe before
                    // blocking on the next read.
                    self.flush_responses().await?;
                    self.pipelining_mode = false;
                }
            }
            if self.done {
                break;
            }

            self.handle_line(&line).await?;
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> anyhow::Result<()> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(ParseError::Empty) => return Ok(()),
            Err(ParseError::Syntax) => {
                tracing::info!(line = %line, state = %self.state, "malformed command");
                return self.write_response("501 Syntax error in parameters").await;
            }
        };

        self.log_command(&command, line);

        // A dlay negotiated at EHLO applies to every subsequent
        // command; the EHLO handler delays its own reply.
        if !self.command_delay.is_zero() && !matches!(command, Command::Ehlo { .. }) {
            tracing::info!(
                delay_secs = self.command_delay.as_secs(),
                "behaviour triggered: command delay"
            );
            if self.sleep_or_shutdown(self.command_delay).await {
                return self.shutdown_close().await;
            }
        }

        if let Command::Unknown { verb, args } = &command {
            let (verb, args) = (verb.clone(), args.clone());
            return self.dispatch_extension(&verb, &args).await;
        }

        if !self.state.allows_command(command.verb()) {
            return self.write_response("503 Bad sequence of commands").await;
        }

        if command.breaks_pipelining() {
            self.flush_responses().await?;
            self.pipelining_mode = false;
        }

        match command {
            Command::Helo { domain } => self.handle_helo(domain, false).await,
            Command::Ehlo { domain } => self.handle_helo(domain, true).await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth(&mechanism, initial_response).await,
            Command::MailFrom { arg } => self.handle_mail(&arg).await,
            Command::RcptTo { arg } => self.handle_rcpt(&arg).await,
            Command::Data => self.handle_data().await,
            Command::Bdat { size, last } => self.handle_bdat(size, last).await,
            Command::Rset => self.handle_rset().await,
            Command::Noop => self.handle_noop().await,
            Command::Quit => self.handle_quit().await,
            Command::StartTls => self.handle_starttls().await,
            Command::Vrfy { target } => self.handle_vrfy(&target).await,
            Command::Unknown { .. } => unreachable!("handled above"),
        }
    }

    fn log_command(&self, command: &Command, raw: &str) {
        match command {
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                let mut args = vec![mechanism.clone()];
                if let Some(response) = initial_response {
                    args.push(response.clone());
                }
                tracing::info!(
                    command = "AUTH",
                    args = ?auth::redact_args(&args),
                    state = %self.state,
                    "command received"
                );
            }
            _ => {
                tracing::info!(command = command.verb(), line = %raw, state = %self.state, "command received");
            }
        }
    }

    // ===== socket plumbing =====

    async fn fill_read_buffer(&mut self, deadline: Option<Duration>) -> anyhow::Result<ReadOutcome> {
        enum Fill {
            Read(usize),
            Eof,
            TimedOut,
            Shutdown,
        }

        let mut chunk = [0u8; 4096];
        let fill = {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(ReadOutcome::Eof);
            };
            let shutdown = &mut self.shutdown;
            tokio::select! {
                result = read_with_optional_deadline(socket, &mut chunk, deadline) => {
                    match result? {
                        None => Fill::TimedOut,
                        Some(0) => Fill::Eof,
                        Some(n) => Fill::Read(n),
                    }
                }
                _ = shutdown.shutting_down() => Fill::Shutdown,
            }
        };

        match fill {
            Fill::Read(n) => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                Ok(ReadOutcome::Data)
            }
            Fill::Eof => Ok(ReadOutcome::Eof),
            Fill::TimedOut => Ok(ReadOutcome::TimedOut),
            Fill::Shutdown => Ok(ReadOutcome::Shutdown),
        }
    }

    /// Next complete line (CRLF or bare LF), or `None` when the peer
    /// went away or the shutdown hook closed the session.
    async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.read_buffer) {
                let mut line: Vec<u8> = self.read_buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            match self.fill_read_buffer(None).await? {
                ReadOutcome::Data => continue,
                ReadOutcome::Eof => return Ok(None),
                ReadOutcome::Shutdown => {
                    self.shutdown_close().await?;
                    return Ok(None);
                }
                ReadOutcome::TimedOut => unreachable!("no deadline was set"),
            }
        }
    }

    /// Exactly `n` bytes of payload, or `None` when the stream ended
    /// first.
    async fn read_exact_bytes(&mut self, n: u64) -> anyhow::Result<Option<Vec<u8>>> {
        let n = n as usize;
        while self.read_buffer.len() < n {
            match self.fill_read_buffer(None).await? {
                ReadOutcome::Data => continue,
                ReadOutcome::Eof => return Ok(None),
                ReadOutcome::Shutdown => {
                    self.shutdown_close().await?;
                    return Ok(None);
                }
                ReadOutcome::TimedOut => unreachable!("no deadline was set"),
            }
        }
        Ok(Some(self.read_buffer.drain(..n).collect()))
    }

    /// Read and drop `n` bytes without buffering them all.
    async fn discard_exact_bytes(&mut self, n: u64) -> anyhow::Result<Option<()>> {
        let mut remaining = n as usize;
        while remaining > 0 {
            if self.read_buffer.is_empty() {
                match self.fill_read_buffer(None).await? {
                    ReadOutcome::Data => {}
                    ReadOutcome::Eof => return Ok(None),
                    ReadOutcome::Shutdown => {
                        self.shutdown_close().await?;
                        return Ok(None);
                    }
                    ReadOutcome::TimedOut => unreachable!("no deadline was set"),
                }
            }
            let take = remaining.min(self.read_buffer.len());
            self.read_buffer.drain(..take);
            remaining -= take;
        }
        Ok(Some(()))
    }

    /// Consume a CRLF (or LF) that immediately follows a BDAT chunk,
    /// if the client sent one. Never blocks beyond the peek deadline.
    async fn consume_trailing_crlf(&mut self) -> anyhow::Result<()> {
        if self.read_buffer.len() < 2 {
            let _ = self.fill_read_buffer(Some(PIPELINING_PEEK)).await?;
        }
        if self.read_buffer.starts_with(b"\r\n") {
            self.read_buffer.drain(..2);
        } else if self.read_buffer.first() == Some(&b'\n') {
            self.read_buffer.drain(..1);
        }
        Ok(())
    }

    /// A client is pipelining when more bytes are already buffered (or
    /// arrive within the peek deadline) right after we consumed a
    /// command.
    async fn detect_pipelining(&mut self) -> anyhow::Result<bool> {
        if !self.read_buffer.is_empty() {
            return Ok(true);
        }
        match self.fill_read_buffer(Some(PIPELINING_PEEK)).await? {
            ReadOutcome::Data => Ok(true),
            ReadOutcome::Shutdown => {
                self.shutdown_close().await?;
                Ok(false)
            }
            ReadOutcome::Eof | ReadOutcome::TimedOut => Ok(false),
        }
    }

    /// Race a sleep against the shutdown signal; true means shutdown
    /// fired.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.shutting_down() => true,
        }
    }

    async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        let socket = self.socket.as_mut().context("connection already closed")?;
        socket.write_all(line.as_bytes()).await?;
        socket.write_all(b"\r\n").await?;
        socket.flush().await?;
        Ok(())
    }

    fn log_response(&self, response: &str) {
        let code = response.get(..1).unwrap_or("");
        if code == "4" || code == "5" {
            tracing::warn!(response = %response, "error response sent");
        } else {
            tracing::debug!(response = %response, "response sent");
        }
    }

    fn is_421(response: &str) -> bool {
        response.starts_with("421")
            && matches!(response.as_bytes().get(3), None | Some(b' ') | Some(b'-'))
    }

    /// Send (or queue) one response. A `421` always drains the queue,
    /// goes out immediately, and ends the session.
    pub async fn write_response(&mut self, response: &str) -> anyhow::Result<()> {
        if Self::is_421(response) {
            self.flush_responses().await?;
            self.send_line(response).await?;
            self.log_response(response);
            self.close_socket().await;
            return Ok(());
        }

        if self.pipelining_mode {
            tracing::debug!(response = %response, "response queued");
            self.response_queue.push(response.to_string());
            return Ok(());
        }

        self.send_line(response).await?;
        self.log_response(response);
        Ok(())
    }

    /// Transmit queued responses in arrival order.
    async fn flush_responses(&mut self) -> anyhow::Result<()> {
        if self.response_queue.is_empty() {
            return Ok(());
        }
        let queued: Vec<String> = self.response_queue.drain(..).collect();
        for response in queued {
            self.send_line(&response).await?;
            self.log_response(&response);
        }
        Ok(())
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
        self.done = true;
    }

    /// The shutdown hook: drain the queue, notify with 421 under a
    /// bounded write deadline, close.
    async fn shutdown_close(&mut self) -> anyhow::Result<()> {
        if self.done {
            return Ok(());
        }
        let reason = ShutdownSubscription::reason();
        let mut payload = String::new();
        for queued in self.response_queue.drain(..) {
            payload.push_str(&queued);
            payload.push_str("\r\n");
        }
        payload.push_str(&format!("421 {reason}\r\n"));

        if let Some(socket) = self.socket.as_mut() {
            let write = async {
                socket.write_all(payload.as_bytes()).await?;
                socket.flush().await
            };
            match tokio::time::timeout(SHUTDOWN_WRITE_DEADLINE, write).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!("failed to write 421 on shutdown: {err}"),
                Err(_) => tracing::debug!("shutdown write deadline elapsed"),
            }
        }
        tracing::info!(reason = %reason, "session closed for shutdown");
        self.close_socket().await;
        Ok(())
    }

    // ===== shared session helpers =====

    fn identity(&self) -> &str {
        if self.params.hostname.is_empty() {
            &self.params.config.tls_hostname
        } else {
            &self.params.hostname
        }
    }

    fn effective_max_size(&self) -> u64 {
        self.advertised_size
            .unwrap_or(self.params.config.max_message_size)
    }

    fn render(&self, reply: esmtp::SyntheticReply) -> String {
        reply.render(self.capabilities.enhanced_status_codes)
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.pending.clear();
        self.bdat_buffer.clear();
        self.bdat_oversize = false;
    }

    fn transition(&mut self, next: SessionState, cause: &str) {
        tracing::debug!(from = %self.state, to = %next, cause = cause, "state transition");
        self.state = next;
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            id: self.session_id.to_string(),
            client_ip: self.params.peer_ip.clone(),
            hostname: self.identity().to_string(),
            user: self.auth_user.clone(),
            authenticated: self.authenticated,
            tls_active: self.tls_active,
            messages_sent: self.messages_sent,
            metadata: self.metadata.clone(),
        }
    }

    fn log_simulation(&self, code: u16, trigger: &str, stage: &str) {
        tracing::warn!(
            code = code,
            trigger = %trigger,
            stage = stage,
            "error simulation triggered"
        );
    }

    // ===== command handlers =====

    async fn handle_helo(&mut self, domain: String, is_ehlo: bool) -> anyhow::Result<()> {
        self.helo_name = Some(domain.clone());

        if let Some(reply) = synthetic::extract_helo(&domain) {
            self.log_simulation(reply.code, &domain, if is_ehlo { "EHLO" } else { "HELO" });
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        if !is_ehlo {
            self.reset_transaction();
            self.transition(SessionState::Mail, "HELO");
            let identity = self.identity().to_string();
            return self.write_response(&format!("250 {identity}")).await;
        }

        let parts = capabilities::parse_label(&domain);
        let parser = self.services.capability_parser.clone();
        let (parts, extracted) = parser.parse_capabilities(&domain, parts);
        self.metadata.extend(extracted);

        let negotiated = capabilities::negotiate(&parts, self.tls_active);
        self.transition(SessionState::Mail, "EHLO");
        if negotiated.rejected {
            return self.write_response("502 Command not implemented").await;
        }

        self.capabilities = negotiated.capabilities;
        self.advertised_size = negotiated.advertised_size;
        self.command_delay = Duration::from_secs(negotiated.command_delay_secs);
        self.reset_transaction();

        // The freshly negotiated dlay covers this very reply.
        if !self.command_delay.is_zero() {
            tracing::info!(
                delay_secs = self.command_delay.as_secs(),
                "behaviour triggered: command delay"
            );
            if self.sleep_or_shutdown(self.command_delay).await {
                return self.shutdown_close().await;
            }
        }

        let extension_caps: Vec<String> = self
            .services
            .extensions
            .iter()
            .filter_map(|ext| ext.capability())
            .collect();
        let lines = capabilities::build_ehlo_lines(
            self.identity(),
            &negotiated,
            self.params.config.max_message_size,
            &extension_caps,
        );
        self.write_response(&lines.join("\r\n")).await
    }

    async fn handle_mail(&mut self, arg: &str) -> anyhow::Result<()> {
        let Some(raw) = address::extract_mailbox(arg) else {
            return self.write_response("501 Syntax error in parameters").await;
        };
        if !address::is_valid_mailbox(&raw, self.capabilities.smtputf8) {
            return self.write_response("501 Syntax error in parameters").await;
        }
        let Some(from) = address::normalise(&raw) else {
            return self.write_response("501 Syntax error in parameters").await;
        };

        // The mail verb fires right here; everything else is deferred.
        if let Some(reply) = synthetic::extract(DeferredVerb::Mail, &from) {
            self.log_simulation(reply.code, &from, "MAIL");
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        if !self
            .services
            .authorizer
            .can_send_from(self.auth_user.as_ref(), &from)
        {
            return self
                .write_response("550 Requested action not taken: mailbox unavailable")
                .await;
        }

        self.pending = PendingReplies::schedule_from_sender(&from);
        self.mail_from = Some(from);
        self.transition(SessionState::Rcpt, "MAIL");
        self.write_response("250 OK").await
    }

    async fn handle_rcpt(&mut self, arg: &str) -> anyhow::Result<()> {
        let Some(raw) = address::extract_mailbox(arg) else {
            return self.write_response("501 Syntax error in parameters").await;
        };
        if !address::is_valid_mailbox(&raw, self.capabilities.smtputf8) {
            return self.write_response("501 Syntax error in parameters").await;
        }
        let Some(to) = address::normalise(&raw) else {
            return self.write_response("501 Syntax error in parameters").await;
        };

        // Each recipient is matched independently against the rcpt
        // pattern.
        if let Some(reply) = synthetic::extract(DeferredVerb::Rcpt, &to) {
            self.log_simulation(reply.code, &to, "RCPT");
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        if !self
            .services
            .authorizer
            .can_send_to(self.auth_user.as_ref(), &to)
        {
            return self
                .write_response("550 Requested action not taken: mailbox unavailable")
                .await;
        }

        self.rcpt_to.push(to);
        self.write_response("250 OK").await
    }

    async fn handle_data(&mut self) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::Data) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "DATA");
            let rendered = self.render(reply);
            self.reset_transaction();
            self.transition(SessionState::Mail, "DATA error");
            return self.write_response(&rendered).await;
        }

        tracing::info!(
            from = self.mail_from.as_deref().unwrap_or(""),
            recipients = self.rcpt_to.len(),
            "message content starting"
        );
        self.transition(SessionState::Data, "DATA");
        self.write_response("354 End data with <CR><LF>.<CR><LF>")
            .await?;

        let Some(body) = self.read_data_body().await? else {
            return Ok(());
        };
        match body {
            DataBody::TooLarge => {
                let max = self.effective_max_size();
                tracing::warn!(max_size = max, "message size limit exceeded");
                self.reset_transaction();
                self.transition(SessionState::Mail, "oversize DATA");
                self.write_response(
                    "552 Requested mail action aborted: exceeded storage allocation",
                )
                .await
            }
            DataBody::Complete(content) => self.deliver(content).await,
        }
    }

    /// Read the dot-terminated body, unwinding dot-stuffing. Returns
    /// `None` when the stream ended before the terminator.
    async fn read_data_body(&mut self) -> anyhow::Result<Option<DataBody>> {
        let max = self.effective_max_size() as usize;
        let mut content = String::new();
        let mut too_large = false;

        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            if line == "." {
                break;
            }
            let line = line.strip_prefix('.').unwrap_or(&line);
            if !too_large && content.len() + line.len() + 2 > max {
                too_large = true;
            }
            if !too_large {
                content.push_str(line);
                content.push_str("\r\n");
            }
        }

        Ok(Some(if too_large {
            DataBody::TooLarge
        } else {
            DataBody::Complete(content)
        }))
    }

    async fn handle_bdat(&mut self, size: u64, last: bool) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::Bdat) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "BDAT");
            let rendered = self.render(reply);
            self.reset_transaction();
            self.transition(SessionState::Mail, "BDAT error");
            return self.write_response(&rendered).await;
        }
        if last {
            if let Some(reply) = self.pending.get(DeferredVerb::Data) {
                let trigger = self.mail_from.clone().unwrap_or_default();
                self.log_simulation(reply.code, &trigger, "BDAT LAST");
                let rendered = self.render(reply);
                self.reset_transaction();
                self.transition(SessionState::Mail, "BDAT error");
                return self.write_response(&rendered).await;
            }
        }

        let max = self.effective_max_size();
        if self.bdat_oversize || self.bdat_buffer.len() as u64 + size > max {
            tracing::warn!(
                buffered = self.bdat_buffer.len(),
                incoming = size,
                max_size = max,
                "BDAT would exceed message size limit"
            );
            // Stay in BDAT so RSET can recover, but drop what we
            // buffered and keep the framing intact by consuming the
            // declared bytes.
            self.bdat_oversize = true;
            self.bdat_buffer.clear();
            if self.discard_exact_bytes(size).await?.is_none() {
                return Ok(());
            }
            self.consume_trailing_crlf().await?;
            let response = format!("552 Message size exceeds fixed maximum of {max} bytes");
            if last {
                self.reset_transaction();
                self.transition(SessionState::Mail, "oversize BDAT");
            } else {
                self.transition(SessionState::Bdat, "oversize BDAT");
            }
            return self.write_response(&response).await;
        }

        let Some(chunk) = self.read_exact_bytes(size).await? else {
            return Ok(());
        };
        self.consume_trailing_crlf().await?;
        self.bdat_buffer.extend_from_slice(&chunk);

        if last {
            let content = String::from_utf8_lossy(&self.bdat_buffer).into_owned();
            self.bdat_buffer.clear();
            self.deliver(content).await
        } else {
            self.transition(SessionState::Bdat, "BDAT");
            self.write_response("250 OK").await
        }
    }

    /// Common tail of DATA and BDAT LAST: hand the message to the
    /// store and answer by the outcome.
    async fn deliver(&mut self, content: String) -> anyhow::Result<()> {
        let from = self.mail_from.clone().unwrap_or_default();
        let to = self.rcpt_to.clone();

        if let Decision::Deny(reason) = self
            .services
            .rate_limiter
            .allow_message(self.auth_user.as_ref(), &self.params.peer_ip)
        {
            tracing::warn!(reason = %reason, "message rejected by rate limiter");
            self.reset_transaction();
            self.transition(SessionState::Mail, "rate limited");
            return self
                .write_response("452 Requested action not taken: insufficient system storage")
                .await;
        }

        let size = content.len();
        let headers = parse_headers(&content);
        let message = StoredMessage {
            from,
            to,
            content,
            headers,
            size,
            client_ip: self.params.peer_ip.clone(),
            hostname: self.identity().to_string(),
            tls_used: self.tls_active,
            timestamp: chrono::Utc::now(),
        };

        let outcome = self.services.store.store(&message).await;
        self.reset_transaction();
        self.transition(SessionState::Mail, "delivery");

        match outcome {
            Ok(()) => {
                self.services
                    .rate_limiter
                    .record_message(self.auth_user.as_ref(), &self.params.peer_ip);
                self.messages_sent += 1;
                self.services.observer.on_message(&self.context(), &message);
                self.write_response("250 OK Message accepted for delivery")
                    .await
            }
            Err(err) => {
                tracing::error!(
                    from = %message.from,
                    size = message.size,
                    "message storage failed: {err:#}"
                );
                self.services.observer.on_error(&self.context(), &err, "DATA");
                let response = storage_error_response(&err);
                self.write_response(response).await
            }
        }
    }

    async fn handle_rset(&mut self) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::Rset) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "RSET");
            // State is left alone so the client can try again.
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        self.reset_transaction();
        self.transition(SessionState::Mail, "RSET");
        self.write_response("250 OK").await
    }

    async fn handle_noop(&mut self) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::Noop) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "NOOP");
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }
        self.write_response("250 OK").await
    }

    async fn handle_quit(&mut self) -> anyhow::Result<()> {
        self.transition(SessionState::Quit, "QUIT");
        if let Some(reply) = self.pending.get(DeferredVerb::Quit) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "QUIT");
            let rendered = self.render(reply);
            self.write_response(&rendered).await?;
            self.close_socket().await;
            return Ok(());
        }
        self.write_response("221 Bye").await?;
        self.close_socket().await;
        Ok(())
    }

    async fn handle_starttls(&mut self) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::StartTls) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "STARTTLS");
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        if self.tls_active {
            return self.write_response("554 TLS already started").await;
        }

        self.write_response("220 Ready to start TLS").await?;

        let hostname = self
            .helo_name
            .clone()
            .unwrap_or_else(|| self.params.config.tls_hostname.clone());
        let tls_config = tls_helpers::make_server_config(
            &hostname,
            &self.params.config.tls_key_file,
            &self.params.config.tls_cert_file,
        )?;
        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);

        let socket = self.socket.take().context("connection already closed")?;
        // Anything the client pipelined past STARTTLS is void.
        self.read_buffer.clear();

        let tls_stream = match acceptor.accept(socket).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("TLS handshake failed: {err}");
                self.done = true;
                return Err(err).context("TLS handshake failed");
            }
        };
        tracing::info!("TLS handshake complete");

        self.socket = Some(Box::new(tls_stream));
        self.tls_active = true;
        self.transition(SessionState::Helo, "STARTTLS");
        self.helo_name = None;
        self.reset_transaction();
        Ok(())
    }

    async fn handle_vrfy(&mut self, target: &str) -> anyhow::Result<()> {
        let Some(raw) = address::extract_mailbox(target) else {
            return self.write_response("501 Syntax error in parameters").await;
        };
        if !raw.contains('@') {
            return self.write_response("501 Syntax error in parameters").await;
        }

        let mut acceptable = address::is_valid_mailbox(&raw, self.capabilities.smtputf8);
        if !acceptable && self.capabilities.smtputf8 {
            // Be lenient under SMTPUTF8: a validating domain is enough.
            acceptable = raw
                .rsplit_once('@')
                .map(|(_, domain)| address::validate_domain(domain))
                .unwrap_or(false);
        }
        if !acceptable {
            return self.write_response("501 Syntax error in parameters").await;
        }
        let Some(mailbox) = address::normalise(&raw) else {
            return self.write_response("501 Syntax error in parameters").await;
        };

        let local = mailbox
            .rsplit_once('@')
            .map(|(local, _)| local.to_lowercase())
            .unwrap_or_default();
        let response = if local.starts_with("exists") {
            format!("250 {mailbox} User exists")
        } else if local.starts_with("unknown") {
            "551 User not local; please try forward path".to_string()
        } else if local.starts_with("ambiguous") {
            "553 Requested action not taken: mailbox name not allowed".to_string()
        } else {
            "550 Requested action not taken: mailbox unavailable".to_string()
        };
        self.write_response(&response).await
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(reply) = self.pending.get(DeferredVerb::Auth) {
            let trigger = self.mail_from.clone().unwrap_or_default();
            self.log_simulation(reply.code, &trigger, "AUTH");
            let rendered = self.render(reply);
            return self.write_response(&rendered).await;
        }

        let Some(mechanism) = Mechanism::from_token(mechanism) else {
            return self
                .write_response("504 Authentication mechanism not supported")
                .await;
        };

        let Some(attempt) = self.run_auth_dialogue(mechanism, initial_response).await? else {
            return Ok(());
        };
        let (username, password) = match attempt {
            AuthAttempt::Credentials { username, password } => (username, password),
            AuthAttempt::Malformed => {
                tracing::warn!(mechanism = mechanism.name(), "malformed AUTH exchange");
                return self.write_response("535 Authentication failed").await;
            }
        };

        match self
            .services
            .authenticator
            .authenticate(&username, password.as_deref())
            .await
        {
            Ok(user) if user.active => {
                tracing::info!(
                    mechanism = mechanism.name(),
                    username = %username,
                    "authentication successful"
                );
                self.authenticated = true;
                self.auth_user = Some(user.clone());
                self.transition(SessionState::Mail, "AUTH");
                self.services.observer.on_auth(&self.context(), &user);
                self.write_response("235 Authentication successful").await
            }
            Ok(_) => {
                tracing::warn!(
                    mechanism = mechanism.name(),
                    username = %username,
                    "authentication rejected: account inactive"
                );
                self.write_response("535 Authentication failed: account inactive")
                    .await
            }
            Err(_) => {
                tracing::warn!(
                    mechanism = mechanism.name(),
                    username = %username,
                    "authentication failed"
                );
                self.write_response("535 Authentication failed").await
            }
        }
    }

    /// Drive the 334 dialogue for one mechanism. `None` means the
    /// connection went away mid-dialogue.
    async fn run_auth_dialogue(
        &mut self,
        mechanism: Mechanism,
        initial_response: Option<String>,
    ) -> anyhow::Result<Option<AuthAttempt>> {
        let attempt = match mechanism {
            Mechanism::Plain => {
                let payload = match initial_response {
                    Some(payload) => payload,
                    None => {
                        self.send_line("334 ").await?;
                        match self.read_line().await? {
                            Some(line) => line,
                            None => return Ok(None),
                        }
                    }
                };
                match auth::decode_base64(&payload).and_then(|d| auth::parse_plain_response(&d)) {
                    Some((username, password)) => AuthAttempt::Credentials {
                        username,
                        password: Some(password),
                    },
                    None => AuthAttempt::Malformed,
                }
            }
            Mechanism::Login => {
                self.send_line(&format!("334 {}", auth::encode_base64(b"Username:")))
                    .await?;
                let Some(username_line) = self.read_line().await? else {
                    return Ok(None);
                };
                self.send_line(&format!("334 {}", auth::encode_base64(b"Password:")))
                    .await?;
                let Some(password_line) = self.read_line().await? else {
                    return Ok(None);
                };
                let username = auth::decode_base64(&username_line)
                    .and_then(|d| String::from_utf8(d).ok());
                let password = auth::decode_base64(&password_line)
                    .and_then(|d| String::from_utf8(d).ok());
                match (username, password) {
                    (Some(username), Some(password)) if !username.is_empty() => {
                        AuthAttempt::Credentials {
                            username,
                            password: Some(password),
                        }
                    }
                    _ => AuthAttempt::Malformed,
                }
            }
            Mechanism::CramMd5 | Mechanism::CramSha256 => {
                let challenge = auth::cram_challenge(self.identity());
                self.send_line(&format!("334 {}", auth::encode_base64(challenge.as_bytes())))
                    .await?;
                let Some(response_line) = self.read_line().await? else {
                    return Ok(None);
                };
                match auth::decode_base64(&response_line)
                    .and_then(|d| auth::parse_cram_response(&d))
                {
                    Some(username) => AuthAttempt::Credentials {
                        username,
                        password: None,
                    },
                    None => AuthAttempt::Malformed,
                }
            }
            Mechanism::XOAuth2 => {
                let payload = match initial_response {
                    Some(payload) => payload,
                    None => {
                        self.send_line("334 ").await?;
                        match self.read_line().await? {
                            Some(line) => line,
                            None => return Ok(None),
                        }
                    }
                };
                match auth::decode_base64(&payload).and_then(|d| auth::parse_xoauth2_user(&d)) {
                    Some(username) => AuthAttempt::Credentials {
                        username,
                        password: None,
                    },
                    None => AuthAttempt::Malformed,
                }
            }
        };
        Ok(Some(attempt))
    }

    async fn dispatch_extension(&mut self, verb: &str, args: &[String]) -> anyhow::Result<()> {
        let extensions = self.services.extensions.clone();
        for extension in extensions {
            let allowed = extension.allowed_states(verb);
            if !allowed.is_empty() && !allowed.contains(&self.state) {
                continue;
            }
            if extension.handle_command(verb, args, self).await? {
                return Ok(());
            }
        }
        self.write_response("500 Command not recognised").await
    }
}

#[async_trait]
impl SessionControl for SmtpServer {
    async fn write_response(&mut self, line: &str) -> anyhow::Result<()> {
        SmtpServer::write_response(self, line).await
    }

    fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

async fn read_with_optional_deadline(
    socket: &mut BoxedSocket,
    chunk: &mut [u8],
    deadline: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, socket.read(chunk)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => socket.read(chunk).await.map(Some),
    }
}

/// Map a storage failure onto the reply the client sees.
fn storage_error_response(err: &anyhow::Error) -> &'static str {
    let text = format!("{err:#}");
    if text.contains("not active") {
        "550 Requested action not taken: mailbox unavailable"
    } else if text.contains("quota") {
        "452 Requested action not taken: insufficient system storage"
    } else {
        "450 Requested action not taken: mailbox temporarily unavailable"
    }
}

fn parse_headers(content: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Ok((parsed, _)) = mailparse::parse_headers(content.as_bytes()) {
        for header in parsed {
            headers
                .entry(header.get_key())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&header.get_value());
                })
                .or_insert_with(|| header.get_value());
        }
    }
    headers
}
