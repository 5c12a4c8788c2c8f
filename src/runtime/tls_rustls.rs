use std::{
    fs::File,
    io::BufReader,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate,
    ClientConfig,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
    ServerName,
};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{
    error::{Error, ErrorKind, Result},
    options::TlsOptions,
};

/// Performs the TLS handshake over an already-connected TCP stream.
pub(crate) async fn tls_connect(
    host: &str,
    tcp_stream: TcpStream,
    cfg: &TlsOptions,
) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host).map_err(|e| ErrorKind::InvalidTlsConfig {
        message: format!("invalid hostname for TLS: {}: {}", host, e),
    })?;

    let connector: TlsConnector = Arc::new(make_rustls_config(cfg.clone())?).into();
    let session = connector.connect(name, tcp_stream).await?;

    Ok(session)
}

/// Converts `TlsOptions` into a rustls `ClientConfig`.
pub(crate) fn make_rustls_config(cfg: TlsOptions) -> Result<ClientConfig> {
    let mut store = RootCertStore::empty();
    if let Some(path) = cfg.ca_file_path {
        let ders = rustls_pemfile::certs(&mut BufReader::new(File::open(&path)?)).map_err(|_| {
            ErrorKind::InvalidTlsConfig {
                message: format!(
                    "Unable to parse PEM-encoded root certificate from {}",
                    path.display()
                ),
            }
        })?;
        let (added, _ignored) = store.add_parsable_certificates(&ders);
        if added == 0 {
            return Err(ErrorKind::InvalidTlsConfig {
                message: format!("No root certificates found in {}", path.display()),
            }
            .into());
        }
    } else {
        store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
    }

    let config_builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(store);

    let mut config = if let Some(path) = cfg.cert_key_file_path {
        let mut file = BufReader::new(File::open(&path)?);
        let mut certs = vec![];
        let mut key = None;

        for item in rustls_pemfile::read_all(&mut file).map_err(|_| {
            Error::from(ErrorKind::InvalidTlsConfig {
                message: format!("Unable to parse PEM file {}", path.display()),
            })
        })? {
            match item {
                rustls_pemfile::Item::X509Certificate(bytes) => certs.push(Certificate(bytes)),
                rustls_pemfile::Item::PKCS8Key(bytes) | rustls_pemfile::Item::RSAKey(bytes) => {
                    key = Some(PrivateKey(bytes))
                }
                _ => continue,
            }
        }

        let key = key.ok_or_else(|| {
            Error::from(ErrorKind::InvalidTlsConfig {
                message: format!("No PEM-encoded private key found in {}", path.display()),
            })
        })?;

        config_builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ErrorKind::InvalidTlsConfig {
                message: e.to_string(),
            })?
    } else {
        config_builder.with_no_client_auth()
    };

    if cfg.allow_invalid_certificates == Some(true) || cfg.allow_invalid_hostnames == Some(true) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    config.enable_sni = true;

    Ok(config)
}

struct NoCertVerifier {}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl From<rustls::Error> for ErrorKind {
    fn from(err: rustls::Error) -> Self {
        Self::InvalidTlsConfig {
            message: err.to_string(),
        }
    }
}
