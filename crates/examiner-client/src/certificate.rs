//! Device certificate handling for the trust bootstrap.
//!
//! The desktop inspector signs a certificate for the device after it sees a
//! CSR over the insecure channel. The signed certificate is written into the
//! destination directory named in the request; the device then loads it
//! together with its private key to open the mutually authenticated channel.
//!
//! Files kept in the certificate directory:
//! - `app.csr`: the last generated certificate signing request (PEM)
//! - `privateKey.pem`: the key pair behind that CSR (PKCS#8 PEM)
//! - `device.crt`: the certificate signed by the desktop (PEM)

use examiner_core::{ExaminerError, ExaminerResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const CSR_FILE: &str = "app.csr";
const PRIVATE_KEY_FILE: &str = "privateKey.pem";
const DEVICE_CERT_FILE: &str = "device.crt";

/// Client identity presented on the secure channel.
#[derive(Clone)]
pub struct DeviceIdentity {
    cert_pem: String,
    key_pem: String,
}

impl DeviceIdentity {
    /// Build an identity from a PEM certificate chain and a PEM private key.
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// The certificate chain in DER form, leaf first.
    pub fn certificate_chain(&self) -> ExaminerResult<Vec<CertificateDer<'static>>> {
        let chain = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExaminerError::Certificate(format!("invalid certificate PEM: {e}")))?;
        if chain.is_empty() {
            return Err(ExaminerError::Certificate(
                "no certificate found in PEM".into(),
            ));
        }
        Ok(chain)
    }

    /// The private key in DER form.
    pub fn private_key(&self) -> ExaminerResult<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| ExaminerError::Certificate(format!("invalid private key PEM: {e}")))?
            .ok_or_else(|| ExaminerError::Certificate("no private key found in PEM".into()))
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Source of the device's certificate material.
///
/// All operations are synchronous and fast; the connection manager calls them
/// from its event loop.
pub trait CertificateAuthority: Send + Sync {
    /// Generate a fresh key pair and return a PEM CSR for `app_id`.
    fn generate_csr(&self, app_id: &str) -> ExaminerResult<String>;

    /// Directory the desktop should write the signed certificate into.
    fn destination(&self) -> String;

    /// Load the certificate the desktop wrote into [`destination`](Self::destination).
    fn import_signed_certificate(&self) -> ExaminerResult<()>;

    /// Identity to present on the secure channel. Fails until a certificate
    /// has been imported.
    fn device_identity(&self) -> ExaminerResult<DeviceIdentity>;

    /// Drop every locally stored key and certificate.
    fn purge_local_keys(&self) -> ExaminerResult<()>;
}

/// Certificate authority client backed by a directory on disk.
pub struct FileCertificateAuthority {
    dir: PathBuf,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl FileCertificateAuthority {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            identity: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> ExaminerResult<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    fn read_file(&self, name: &str) -> ExaminerResult<String> {
        let path = self.dir.join(name);
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ExaminerError::Certificate(format!("{} not found", path.display()))
            }
            _ => ExaminerError::Io(e),
        })
    }

    fn set_identity(&self, identity: Option<DeviceIdentity>) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }
}

impl CertificateAuthority for FileCertificateAuthority {
    fn generate_csr(&self, app_id: &str) -> ExaminerResult<String> {
        self.ensure_dir()?;

        let key_pair = KeyPair::generate()
            .map_err(|e| ExaminerError::Certificate(format!("key generation failed: {e}")))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| ExaminerError::Certificate(e.to_string()))?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, app_id);
        name.push(DnType::OrganizationName, "Flipper");
        name.push(DnType::CountryName, "US");
        name.push(DnType::StateOrProvinceName, "CA");
        name.push(DnType::LocalityName, "Menlo Park");
        params.distinguished_name = name;

        let csr = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| ExaminerError::Certificate(format!("CSR generation failed: {e}")))?;

        let key_path = self.dir.join(PRIVATE_KEY_FILE);
        fs::write(&key_path, key_pair.serialize_pem())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::write(self.dir.join(CSR_FILE), &csr)?;

        tracing::debug!(app_id, dir = %self.dir.display(), "generated certificate signing request");
        Ok(csr)
    }

    fn destination(&self) -> String {
        let mut dest = self.dir.display().to_string();
        if !dest.ends_with('/') {
            dest.push('/');
        }
        dest
    }

    fn import_signed_certificate(&self) -> ExaminerResult<()> {
        let identity = DeviceIdentity::new(
            self.read_file(DEVICE_CERT_FILE)?,
            self.read_file(PRIVATE_KEY_FILE)?,
        );
        // Parse both halves now so a bad file fails the import rather than the handshake.
        identity.certificate_chain()?;
        identity.private_key()?;

        self.set_identity(Some(identity));
        tracing::info!(dir = %self.dir.display(), "imported signed device certificate");
        Ok(())
    }

    fn device_identity(&self) -> ExaminerResult<DeviceIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ExaminerError::Certificate("no device certificate imported".into()))
    }

    fn purge_local_keys(&self) -> ExaminerResult<()> {
        self.set_identity(None);
        for name in [CSR_FILE, PRIVATE_KEY_FILE, DEVICE_CERT_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Self-signed identity for tests that need real PEM material.
    pub fn self_signed_identity() -> DeviceIdentity {
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        DeviceIdentity::new(cert.pem(), key_pair.serialize_pem())
    }
}
