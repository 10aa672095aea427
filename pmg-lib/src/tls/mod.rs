use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rama::{
    error::{BoxError, ErrorContext as _},
    net::{
        address::Domain,
        tls::{
            ApplicationProtocol, DataEncoding,
            server::{
                SelfSignedData, ServerAuth, ServerAuthData, ServerCertIssuerData,
                ServerCertIssuerKind, ServerConfig,
            },
        },
    },
    telemetry::tracing,
    tls::boring::server::{TlsAcceptorLayer, utils::self_signed_server_ca},
    utils::str::NonEmptyStr,
};

use secrecy::{ExposeSecret as _, SecretBox};

const CA_CERT_FILE: &str = "pmg-ca.pem";
const CA_KEY_FILE: &str = "pmg-ca.key.pem";

struct PemKeyCrtPair {
    crt: NonEmptyStr,
    key: SecretBox<String>,
}

/// The proxy's root CA certificate, used both as the issuer for per-host MITM
/// leaves and as the trust anchor exported to wrapped children.
#[derive(Debug, Clone)]
pub struct RootCa {
    pem: Arc<str>,
    path: PathBuf,
}

impl RootCa {
    /// The CA certificate in PEM form.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Path of the persisted CA certificate; wrapped children receive it via
    /// `SSL_CERT_FILE` and friends so their TLS clients trust our leaves.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Build the TLS acceptor for MITM'd connections.
///
/// The root CA is generated on first start and persisted under the data
/// directory (the key with owner-only permissions); per-host leaf
/// certificates are issued from it on demand.
pub fn new_tls_acceptor_layer(data_dir: &Path) -> Result<(TlsAcceptorLayer, RootCa), BoxError> {
    let pair = load_or_generate_root_ca(data_dir)?;

    let root_ca = RootCa {
        pem: Arc::from(pair.crt.as_ref()),
        path: data_dir.join(CA_CERT_FILE),
    };

    let key: NonEmptyStr = pair
        .key
        .expose_secret()
        .clone()
        .try_into()
        .context("PEM CA key string as NonEmpty variant")?;

    let tls_acceptor_data = ServerConfig {
        application_layer_protocol_negotiation: Some(vec![
            ApplicationProtocol::HTTP_2,
            ApplicationProtocol::HTTP_11,
        ]),
        ..ServerConfig::new(ServerAuth::CertIssuer(ServerCertIssuerData {
            kind: ServerCertIssuerKind::Single(ServerAuthData {
                private_key: DataEncoding::Pem(key),
                cert_chain: DataEncoding::Pem(pair.crt),
                ocsp: None,
            }),
            ..Default::default()
        }))
    }
    .try_into()
    .context("create tls acceptor data")?;

    Ok((
        TlsAcceptorLayer::new(tls_acceptor_data).with_store_client_hello(true),
        root_ca,
    ))
}

fn load_or_generate_root_ca(data_dir: &Path) -> Result<PemKeyCrtPair, BoxError> {
    let crt_path = data_dir.join(CA_CERT_FILE);
    let key_path = data_dir.join(CA_KEY_FILE);

    if crt_path.exists() && key_path.exists() {
        tracing::debug!("loading persisted proxy root CA");
        let crt: NonEmptyStr = std::fs::read_to_string(&crt_path)
            .context("read persisted CA certificate")?
            .try_into()
            .context("persisted CA certificate as NonEmpty variant")?;
        let key = std::fs::read_to_string(&key_path).context("read persisted CA key")?;
        return Ok(PemKeyCrtPair {
            crt,
            key: SecretBox::new(Box::new(key)),
        });
    }

    tracing::debug!("no proxy root CA present, generating one");

    let (crt, key) = self_signed_server_ca(&SelfSignedData {
        organisation_name: Some("PMG Local Proxy".to_owned()),
        common_name: Some(Domain::from_static("pmg.local")),
        subject_alternative_names: None,
    })
    .context("generate self signed TLS CA")?;

    let crt_pem =
        String::from_utf8(crt.to_pem().context("generate PEM CA crt byte slice")?)
            .context("PEM CA crt byte slice as String")?;
    let key_pem = String::from_utf8(
        key.private_key_to_pem_pkcs8()
            .context("generate PEM CA key byte slice")?,
    )
    .context("PEM CA key byte slice as String")?;

    std::fs::create_dir_all(data_dir).context("create data directory for CA storage")?;
    std::fs::write(&crt_path, &crt_pem).context("persist CA certificate")?;
    write_private(&key_path, &key_pem).context("persist CA key")?;

    Ok(PemKeyCrtPair {
        crt: crt_pem
            .try_into()
            .context("PEM CA crt string as NonEmpty variant")?,
        key: SecretBox::new(Box::new(key_pem)),
    })
}

#[cfg(target_family = "unix")]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt as _;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(target_family = "unix"))]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_ca_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();

        let pair = load_or_generate_root_ca(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(pair.crt.as_ref().contains("BEGIN CERTIFICATE"));

        // second call loads the same certificate instead of regenerating
        let reloaded = load_or_generate_root_ca(dir.path()).unwrap();
        assert_eq!(pair.crt.as_ref(), reloaded.crt.as_ref());
    }

    #[test]
    fn test_acceptor_layer_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (_acceptor, root_ca) = new_tls_acceptor_layer(dir.path()).unwrap();
        assert!(root_ca.pem().contains("BEGIN CERTIFICATE"));
        assert!(root_ca.path().ends_with(CA_CERT_FILE));
    }
}
