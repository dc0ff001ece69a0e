//! TLS server configuration: static PEM pairs when configured, dynamic
//! self-signed certificates otherwise.
//!
//! The self-signed path is SNI-aware: the certificate identity follows
//! the name the client asked for, falling back to the HELO name or the
//! configured TLS hostname. Generated certs are ECDSA P-256, valid for
//! 24 hours, with CN and SAN set to the chosen name, and cached per
//! name for the listener's lifetime.

use anyhow::Context;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const CERT_VALIDITY_HOURS: i64 = 24;

/// Build the rustls server config. When both a certificate and a key
/// path are configured the static pair is used (with SNI ignored);
/// otherwise certificates are minted on demand.
pub fn make_server_config(
    fallback_hostname: &str,
    tls_key_path: &Option<std::path::PathBuf>,
    tls_cert_path: &Option<std::path::PathBuf>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let builder = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth();

    let config = match (tls_cert_path, tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certificates = load_certs(cert_path)
                .with_context(|| format!("loading certificates from {}", cert_path.display()))?;
            let private_key = load_private_key(key_path)
                .with_context(|| format!("loading private key from {}", key_path.display()))?;
            builder.with_single_cert(certificates, private_key)?
        }
        _ => builder.with_cert_resolver(Arc::new(SelfSignedResolver::new(fallback_hostname))),
    };

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::Certificate>> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .context("reading PEM encoded certificates")?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    anyhow::ensure!(!certs.is_empty(), "no certificates found");
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<rustls::PrivateKey> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader).context("cannot parse private key PEM")? {
            Some(rustls_pemfile::Item::RSAKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(rustls_pemfile::Item::PKCS8Key(key)) => return Ok(rustls::PrivateKey(key)),
            Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            None => break,
            _ => {}
        }
    }

    anyhow::bail!("no keys found in key data (encrypted keys not supported)");
}

/// Generates and caches a self-signed certificate per requested server
/// name.
pub struct SelfSignedResolver {
    fallback: String,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl SelfSignedResolver {
    pub fn new(fallback_hostname: &str) -> Self {
        Self {
            fallback: fallback_hostname.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(key) = cache.get(name) {
            return Some(key.clone());
        }
        match self_signed_key(name) {
            Ok(key) => {
                let key = Arc::new(key);
                cache.insert(name.to_string(), key.clone());
                Some(key)
            }
            Err(err) => {
                tracing::error!(hostname = %name, "failed to generate self-signed certificate: {err:#}");
                None
            }
        }
    }
}

impl ResolvesServerCert for SelfSignedResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello
            .server_name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.fallback.clone());
        self.key_for(&name)
    }
}

/// Mint a certificate for `hostname`.
pub fn self_signed_key(hostname: &str) -> anyhow::Result<CertifiedKey> {
    let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, hostname);
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::hours(CERT_VALIDITY_HOURS);

    let cert = rcgen::Certificate::from_params(params).context("generating certificate")?;
    let cert_der = rustls::Certificate(cert.serialize_der()?);
    let key_der = rustls::PrivateKey(cert.serialize_private_key_der());
    let signing_key = rustls::sign::any_ecdsa_type(&key_der)
        .map_err(|err| anyhow::anyhow!("unusable generated key: {err:?}"))?;

    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn self_signed_generation() {
        let key = self_signed_key("tls.test").unwrap();
        assert_eq!(key.cert.len(), 1);
        assert!(!key.cert[0].0.is_empty());
    }

    #[test]
    fn resolver_caches_per_name() {
        let resolver = SelfSignedResolver::new("fallback.test");
        let first = resolver.key_for("a.test").unwrap();
        let again = resolver.key_for("a.test").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let other = resolver.key_for("b.test").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn self_signed_config_builds() {
        let config = make_server_config("tls.test", &None, &None).unwrap();
        // A resolver-backed config has no static cert chain to offer
        // until a handshake provides a name; just assert it exists.
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn missing_static_pair_files_error() {
        let err = make_server_config(
            "tls.test",
            &Some("/nonexistent/key.pem".into()),
            &Some("/nonexistent/cert.pem".into()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("loading"));
    }
}
