//! Up-front checks on the certificate material used to reach a Docker daemon over mutual TLS.
//!
//! bollard only reads these files when the first request is made; a bad path or a swapped
//! certificate and key then surfaces as an opaque handshake failure. Checking them at startup
//! turns that into a clear configuration error.

use joblib::runtime::DockerTls;
use rustls_pemfile::Item;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} contains no PEM certificate")]
    NoCertificate(PathBuf),
    #[error("{0} contains no PEM private key")]
    NoPrivateKey(PathBuf),
}

pub fn validate(tls: &DockerTls) -> Result<(), TlsError> {
    require_certificate(&tls.cert)?;
    require_certificate(&tls.ca_cert)?;
    require_private_key(&tls.key)?;
    Ok(())
}

fn pem_items(path: &Path) -> Result<Vec<Item>, TlsError> {
    let read_err = |source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    rustls_pemfile::read_all(&mut BufReader::new(file)).map_err(read_err)
}

fn require_certificate(path: &Path) -> Result<(), TlsError> {
    let items = pem_items(path)?;
    if !items
        .iter()
        .any(|item| matches!(item, Item::X509Certificate(_)))
    {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(())
}

fn require_private_key(path: &Path) -> Result<(), TlsError> {
    let items = pem_items(path)?;
    if !items
        .iter()
        .any(|item| matches!(item, Item::RSAKey(_) | Item::PKCS8Key(_) | Item::ECKey(_)))
    {
        return Err(TlsError::NoPrivateKey(path.to_path_buf()));
    }
    Ok(())
}
