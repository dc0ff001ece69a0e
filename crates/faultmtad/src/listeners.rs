//! Listener fan-out: one TCP listener per configured port, each
//! spawning a session task per accepted connection.
//!
//! A port that is already in use is logged and skipped so a partially
//! bound server still serves the rest. Accept loops exit on the
//! shutdown signal; sessions hold an [`Activity`] so the life cycle
//! waits for them.

use crate::config::{ServerConfig, DELAY_COUNT};
use crate::extension::Services;
use crate::lifecycle::{Activity, ShutdownSubscription};
use crate::smtp_server::{SessionParams, SmtpServer};
use crate::tls_helpers;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Bind every configured listener and spawn its accept loop.
pub async fn spawn_all(config: Arc<ServerConfig>, services: Services) -> anyhow::Result<()> {
    let mut ports: Vec<(u16, bool)> = vec![
        (config.port, false),
        (config.starttls_port, false),
        (config.tls_port, true),
    ];
    for offset in 0..DELAY_COUNT {
        ports.push((config.greeting_delay_port_start + offset, false));
        ports.push((config.drop_delay_port_start + offset, false));
    }

    let mut bound = 0usize;
    for (port, implicit_tls) in ports {
        if start_listener(config.clone(), services.clone(), port, implicit_tls).await? {
            bound += 1;
        }
    }
    anyhow::ensure!(bound > 0, "no listeners could be bound");
    tracing::info!(listeners = bound, "listeners started");
    Ok(())
}

/// Bind one port; false means the address was in use and the port was
/// skipped.
async fn start_listener(
    config: Arc<ServerConfig>,
    services: Services,
    port: u16,
    implicit_tls: bool,
) -> anyhow::Result<bool> {
    let addr = format!("{}:{port}", config.listen_address);
    let listener = match TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::warn!(addr = %addr, "port already in use; skipping listener");
            return Ok(false);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("binding listener on {addr}"));
        }
    };

    let acceptor = if implicit_tls {
        let tls_config = tls_helpers::make_server_config(
            &config.tls_hostname,
            &config.tls_key_file,
            &config.tls_cert_file,
        )?;
        Some(TlsAcceptor::from(tls_config))
    } else {
        None
    };

    tracing::info!(
        addr = %addr,
        desc = %config.describe_port(port),
        "listening on port"
    );

    tokio::spawn(accept_loop(listener, config, services, port, acceptor));
    Ok(true)
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    services: Services,
    port: u16,
    acceptor: Option<TlsAcceptor>,
) {
    let mut shutdown = ShutdownSubscription::get();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let Some(activity) = Activity::get_opt() else {
                        break;
                    };
                    tokio::spawn(handle_connection(
                        stream,
                        peer.ip().to_string(),
                        config.clone(),
                        services.clone(),
                        port,
                        acceptor.clone(),
                        activity,
                    ));
                }
                Err(err) => {
                    tracing::warn!(port = port, "failed to accept connection: {err}");
                }
            },
            _ = shutdown.shutting_down() => break,
        }
    }
    tracing::info!(port = port, "listener closed");
}

async fn handle_connection(
    stream: TcpStream,
    peer_ip: String,
    config: Arc<ServerConfig>,
    services: Services,
    port: u16,
    acceptor: Option<TlsAcceptor>,
    activity: Activity,
) {
    let behaviour = config.behaviour_for_port(port);

    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let hostname = tls_stream
                    .get_ref()
                    .1
                    .server_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| config.tls_hostname.clone());
                let params = SessionParams {
                    config,
                    port,
                    behaviour,
                    hostname,
                    peer_ip,
                    tls_active: true,
                };
                SmtpServer::run(
                    Box::new(tls_stream),
                    params,
                    services,
                    ShutdownSubscription::get(),
                )
                .await
            }
            Err(err) => {
                tracing::warn!(port = port, peer = %peer_ip, "implicit TLS handshake failed: {err}");
                Ok(())
            }
        },
        None => {
            let params = SessionParams {
                hostname: config.tls_hostname.clone(),
                config,
                port,
                behaviour,
                peer_ip,
                tls_active: false,
            };
            SmtpServer::run(
                Box::new(stream),
                params,
                services,
                ShutdownSubscription::get(),
            )
            .await
        }
    };

    if let Err(err) = result {
        tracing::error!(port = port, "session error: {err:#}");
    }
    drop(activity);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PortBehaviour, PortRole};

    // Binding behaviour is exercised against ephemeral ports so the
    // suite can run alongside a real server.
    #[tokio::test]
    async fn skips_ports_already_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = Arc::new(ServerConfig::default());
        let services = crate::defaults::default_services(&config);
        let bound = start_listener(config, services, port, false).await.unwrap();
        assert!(!bound);
    }

    #[test]
    fn role_is_port_derived() {
        let config = ServerConfig::default();
        assert_eq!(
            config.behaviour_for_port(config.port),
            PortBehaviour::normal()
        );
        assert_eq!(
            config.behaviour_for_port(config.tls_port).role,
            PortRole::ImplicitTls
        );
    }
}
