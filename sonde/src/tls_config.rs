//! rustls client configuration shared by every TLS based transport.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{TlsOptions, TlsVersion};
use crate::error::{Error, IoContext, Result};

/// Accepts any certificate; used when verification is explicitly disabled.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).context(format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .context(format!("reading certificates from {}", path.display()))?;
    if certs.is_empty() {
        return Err(Error::config(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).context(format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .context(format!("reading private key from {}", path.display()))?
        .ok_or_else(|| Error::config(format!("no private key in {}", path.display())))
}

/// Builds a client configuration from `opts`, advertising the given ALPN protocols.
pub fn client_config(opts: &TlsOptions, alpn: &[String]) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let versions: Vec<&'static rustls::SupportedProtocolVersion> = [
        (TlsVersion::Tls12, &rustls::version::TLS12),
        (TlsVersion::Tls13, &rustls::version::TLS13),
    ]
    .into_iter()
    .filter(|(v, _)| (opts.min_version..=opts.max_version).contains(v))
    .map(|(_, version)| version)
    .collect();
    if versions.is_empty() {
        return Err(Error::config("TLS minimum version is above the maximum version"));
    }

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)?;
    let builder = if opts.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    };

    let mut config = match (&opts.client_cert, &opts.client_key) {
        (Some(cert), Some(key)) => builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::config(
                "TLS client certificate and key must be given together",
            ))
        }
    };

    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    if opts.key_log {
        config.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    Ok(Arc::new(config))
}

/// Converts a hostname or IP literal (an IPv6 zone is dropped) into a rustls server name.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    let name = name.split('%').next().unwrap_or(name);
    ServerName::try_from(name.to_string())
        .map_err(|_| Error::config(format!("invalid TLS server name {:?}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_and_versions() {
        let config = client_config(&TlsOptions::default(), &["doq".to_string()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"doq".to_vec()]);

        let backwards = TlsOptions {
            min_version: TlsVersion::Tls13,
            max_version: TlsVersion::Tls12,
            ..TlsOptions::default()
        };
        assert!(matches!(client_config(&backwards, &[]), Err(Error::Config(_))));

        let half_auth = TlsOptions {
            client_cert: Some("client.pem".into()),
            ..TlsOptions::default()
        };
        assert!(matches!(client_config(&half_auth, &[]), Err(Error::Config(_))));

        let insecure = TlsOptions {
            insecure_skip_verify: true,
            ..TlsOptions::default()
        };
        assert!(client_config(&insecure, &[]).is_ok());
    }

    #[test]
    fn server_names() {
        assert!(server_name("dns.quad9.net").is_ok());
        assert!(matches!(server_name("fe80::1%en0").unwrap(), ServerName::IpAddress(_)));
        assert!(server_name("not a name").is_err());
    }
}
