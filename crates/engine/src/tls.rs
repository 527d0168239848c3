//! TLS material assembly for secured endpoints.
//!
//! Builds one `rustls::ClientConfig` from the configured policy: webpki
//! roots plus any extra CA bundle, an optional client certificate/key pair,
//! and a permissive verifier when verification is disabled.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use qsense_config::TlsPolicy;

use crate::EngineError;

pub(crate) fn client_config(policy: &TlsPolicy) -> Result<Arc<ClientConfig>, EngineError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| EngineError::Tls(e.to_string()))?;

    let identity = match &policy.client_identity {
        Some(identity) => Some((
            load_certs(&identity.cert_path)?,
            load_key(&identity.key_path)?,
        )),
        None => None,
    };

    let config = if policy.verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = &policy.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| EngineError::Tls(format!("{}: {}", ca_path.display(), e)))?;
            }
        }
        let builder = builder.with_root_certificates(roots);
        match identity {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| EngineError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    } else {
        log::warn!("TLS certificate verification is disabled");
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
        match identity {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| EngineError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    };

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| EngineError::Tls(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(EngineError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EngineError::Tls(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| EngineError::Tls(format!("{}: no private key found", path.display())))
}

/// Skips chain and hostname validation while still checking that handshake
/// signatures are well-formed. Installed only when the policy says
/// `verify = false`.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
