use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// PEM files used to reach the management plane over TLS.
#[derive(Clone, Debug, Default)]
pub struct ClientTlsPaths {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub domain: Option<String>,
}

impl ClientTlsPaths {
    pub fn is_enabled(&self) -> bool {
        self.ca.is_some() || self.cert.is_some() || self.key.is_some() || self.domain.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ClientTlsMaterial {
    pub config: ClientTlsConfig,
    pub ca_fingerprint_sha256: Option<String>,
    pub identity_fingerprint_sha256: Option<String>,
}

/// Reads and validates the configured PEM files. A client identity needs both
/// the certificate and the key.
pub fn load_client_tls(paths: &ClientTlsPaths) -> Result<ClientTlsMaterial> {
    let mut config = ClientTlsConfig::new();
    if let Some(domain) = &paths.domain {
        config = config.domain_name(domain.clone());
    }

    let ca_fingerprint_sha256 = match &paths.ca {
        Some(ca_path) => {
            let ca_pem = read(ca_path, "CA bundle")?;
            let ca_certs = pem_certs(&ca_pem)
                .with_context(|| format!("parsing CA bundle {}", ca_path.display()))?;
            let Some(first) = ca_certs.first() else {
                bail!("TLS CA bundle {} contains no certificates", ca_path.display());
            };
            let fingerprint = fingerprint(first);
            let mut roots = RootCertStore::empty();
            for cert in ca_certs.iter().cloned() {
                roots
                    .add(cert)
                    .with_context(|| format!("adding CA certificate from {}", ca_path.display()))?;
            }
            config = config.ca_certificate(Certificate::from_pem(ca_pem));
            Some(fingerprint)
        }
        None => None,
    };

    let identity_fingerprint_sha256 = match (&paths.cert, &paths.key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = read(cert_path, "certificate")?;
            let key_pem = read(key_path, "private key")?;
            let chain = pem_certs(&cert_pem)
                .with_context(|| format!("parsing certificate chain {}", cert_path.display()))?;
            let Some(leaf) = chain.first() else {
                bail!("TLS certificate chain {} is empty", cert_path.display());
            };
            let fingerprint = fingerprint(leaf);
            rustls_pemfile::private_key(&mut BufReader::new(&key_pem[..]))
                .context("parsing TLS private key")?
                .ok_or_else(|| {
                    anyhow!(
                        "TLS private key {} must contain a valid PKCS#1/PKCS#8/SEC1 key",
                        key_path.display()
                    )
                })?;
            config = config.identity(Identity::from_pem(cert_pem, key_pem));
            Some(fingerprint)
        }
        (None, None) => None,
        _ => bail!("client TLS identity needs both a certificate and a key"),
    };

    Ok(ClientTlsMaterial {
        config,
        ca_fingerprint_sha256,
        identity_fingerprint_sha256,
    })
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading TLS {what} {}", path.display()))
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| anyhow!(err))
}
