//! TLS client configuration for broker sessions

use crate::error::TransportError;
use crate::transport::ConnectOptions;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {e}", path.display())))
}

/// Read every PEM certificate in `path`
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("invalid certificate {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first PEM private key in `path`
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TransportError::Tls(format!("invalid key {}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

fn root_store(ca_cert: Option<&Path>) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();

    match ca_cert {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("bad CA in {}: {e}", path.display())))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                warn!(error = %e, "Failed to load a system root certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "Loaded system root certificates");
        }
    }

    if roots.is_empty() {
        return Err(TransportError::Tls("no trusted root certificates".to_string()));
    }
    Ok(roots)
}

/// Client config with the configured roots and optional client certificate
pub fn client_config(options: &ConnectOptions) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(root_store(options.ca_cert.as_deref())?);

    let config = match (&options.host_cert, &options.host_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| TransportError::Tls(format!("client certificate rejected: {e}")))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}
