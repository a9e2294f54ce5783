//! TLS bring-up: server acceptor and client connector construction.
//!
//! PEM material is loaded with rustls-pemfile.  Certificate validation policy
//! follows the settings: the client either validates against a configured CA
//! bundle or, when `accept_invalid_certificates` is set, skips validation via
//! the verifier in `danger`.  Mutual authentication installs a WebPKI client
//! verifier on the server and a client certificate on the client.

use crate::error::{Error, Result};
use crate::settings::{TlsClientSettings, TlsServerSettings, TlsVersion};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

static TLS1_2_AND_UP: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS1_3_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(minimum: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match minimum {
        TlsVersion::V1_2 => TLS1_2_AND_UP,
        TlsVersion::V1_3 => TLS1_3_ONLY,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Build the server-side acceptor.
pub(crate) fn build_acceptor(settings: &TlsServerSettings) -> Result<TlsAcceptor> {
    let certs = load_certs(&settings.certificate_path)?;
    let key = load_key(&settings.private_key_path)?;
    let builder =
        rustls::ServerConfig::builder_with_protocol_versions(protocol_versions(settings.minimum_version));

    let config = if settings.mutually_authenticate {
        let ca_path = settings.ca_certificate_path.as_deref().ok_or_else(|| {
            Error::Config("mutual authentication requires ca_certificate_path".to_owned())
        })?;
        let roots = load_root_store(ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Config(format!("client certificate verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = config
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("server certificate rejected: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client-side connector.
pub(crate) fn build_connector(settings: &TlsClientSettings) -> Result<TlsConnector> {
    let builder =
        rustls::ClientConfig::builder_with_protocol_versions(protocol_versions(settings.minimum_version));

    let client_auth = match (&settings.client_certificate_path, &settings.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            Some((load_certs(cert_path)?, load_key(key_path)?))
        }
        _ => None,
    };

    let config = if settings.accept_invalid_certificates {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()));
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Config(format!("client certificate rejected: {e}")))?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let ca_path = settings.ca_certificate_path.as_deref().ok_or_else(|| {
            Error::Config(
                "tls requires ca_certificate_path unless accept_invalid_certificates is set"
                    .to_owned(),
            )
        })?;
        let builder = builder.with_root_certificates(load_root_store(ca_path)?);
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Config(format!("client certificate rejected: {e}")))?,
            None => builder.with_no_client_auth(),
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the name presented for SNI and certificate validation.
pub(crate) fn server_name(settings: &TlsClientSettings, host: &str) -> Result<ServerName<'static>> {
    let name = settings
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_owned());
    ServerName::try_from(name.clone())
        .map_err(|_| Error::Config(format!("invalid tls server name: {name}")))
}

mod danger {
    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Accept-anything verifier behind `accept_invalid_certificates`.
    /// Signatures are still checked so the handshake stays well-formed.
    #[derive(Debug)]
    pub(super) struct NoVerification(rustls::crypto::CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            NoVerification(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
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
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
