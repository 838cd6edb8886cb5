use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsEndpointConfig;
use crate::error::Error;

/// Turns a certificate chain and private key path into a `TlsAcceptor` for
/// implicit TLS (POP3S, RFC 8314): the listener wraps every accepted
/// connection from this endpoint before the POP3 greeting is sent.
/// This keeps the mechanics of "wrap a socket in TLS" in scope, while
/// explicitly putting *validating certificate content* out of scope; this
/// function is the mechanical half only: it loads and parses the files,
/// it never inspects the certificate itself.
pub fn build_acceptor(config: &TlsEndpointConfig) -> Result<TlsAcceptor, Error> {
    let certs = load_certs(&config.certificate_chain_path)?;
    let key = load_private_key(&config.private_key_path)?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("couldn't parse certificate chain {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("couldn't parse private key {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}
