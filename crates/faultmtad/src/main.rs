use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod auth;
mod capabilities;
mod config;
mod defaults;
mod diagnostic_logging;
mod extension;
mod lifecycle;
mod listeners;
mod smtp_server;
mod tls_helpers;

use config::ServerConfig;
use diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use lifecycle::LifeCycle;

/// FaultMTA Daemon.
///
/// A deliberately misbehaving SMTP server for exercising SMTP clients:
/// error codes, delays, drops, capability toggles and TLS variants are
/// all selected from the wire by the addresses, hostnames and ports
/// the client uses.
#[derive(Clone, Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file (TOML). Flags and FAULTMTAD_* environment
    /// variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the listeners bind to.
    #[arg(long)]
    listen_address: Option<String>,

    /// Normal-behaviour port.
    #[arg(long)]
    port: Option<u16>,

    /// Where delivered messages land (maildir format).
    #[arg(long)]
    maildir: Option<PathBuf>,

    /// PEM certificate chain; omit to serve self-signed certificates.
    #[arg(long, requires = "tls_key_file")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key for --tls-cert-file.
    #[arg(long, requires = "tls_cert_file")]
    tls_key_file: Option<PathBuf>,

    /// Hostname used for generated certificates and the banner.
    #[arg(long)]
    tls_hostname: Option<String>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine readable
    /// records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

impl Opt {
    fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(maildir) = &self.maildir {
            config.maildir = maildir.clone();
        }
        if let Some(cert) = &self.tls_cert_file {
            config.tls_cert_file = Some(cert.clone());
        }
        if let Some(key) = &self.tls_key_file {
            config.tls_key_file = Some(key.clone());
        }
        if let Some(hostname) = &self.tls_hostname {
            config.tls_hostname = hostname.clone();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "FAULTMTAD_LOG",
        default_filter: "faultmtad=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(opts))?;
    tracing::info!("application logic complete, returning from main");
    Ok(())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(opts.config.as_deref()).context("loading config")?;
    opts.apply_to(&mut config);
    config.validate().context("port configuration error")?;
    let config = Arc::new(config);

    let mut life_cycle = LifeCycle::new();
    let services = defaults::default_services(&config);

    listeners::spawn_all(config.clone(), services)
        .await
        .context("starting listeners")?;

    tracing::info!(
        normal_port = config.port,
        greeting_delay_ports = %format!(
            "{}-{}",
            config.greeting_delay_port_start,
            config.greeting_delay_port_start + config::DELAY_COUNT - 1
        ),
        drop_delay_ports = %format!(
            "{}-{}",
            config.drop_delay_port_start,
            config.drop_delay_port_start + config::DELAY_COUNT - 1
        ),
        tls_port = config.tls_port,
        starttls_port = config.starttls_port,
        maildir = %config.maildir.display(),
        "initialization complete"
    );

    life_cycle.wait_for_shutdown(config.shutdown_timeout()).await
}
