//! Key & certificate store backed by the local filesystem
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/instance-id
//! <root>/<context>/<host>/identity.key   PKCS#8 PEM, Ed25519
//! <root>/<context>/<host>/identity.der   self-signed certificate
//! <root>/<context>/<host>/identity.instance  instance id the certificate names
//! <root>/<context>/<host>/pinned.der     remote daemon certificate
//! ```
//!
//! Host and context strings reach this module from operators and remote
//! peers, so both are validated before any path is built from them.

use log::{debug, info, warn};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ED25519};
use regex::Regex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

const INSTANCE_ID_FILE: &str = "instance-id";
const KEY_FILE: &str = "identity.key";
const CERT_FILE: &str = "identity.der";
const ISSUED_TO_FILE: &str = "identity.instance";
const PINNED_FILE: &str = "pinned.der";

/// Validity window of generated certificates (~10 years)
const CERT_VALIDITY_DAYS: i64 = 3650;

/// Longest host string accepted (DNS name limit)
const MAX_HOST_LEN: usize = 253;

fn context_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("context pattern is valid")
    })
}

/// Errors raised by the key store
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("invalid context '{0}'")]
    InvalidContext(String),

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("no pinned certificate for host '{0}'")]
    NotFound(String),

    #[error("identity generation failed: {0}")]
    Generation(String),

    #[error("corrupt identity material at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local identity presented to one remote host
#[derive(Clone)]
pub struct Identity {
    instance_id: Uuid,
    certificate: CertificateDer<'static>,
    /// PKCS#8 DER
    private_key: Vec<u8>,
}

impl Identity {
    /// Generate a fresh Ed25519 keypair and self-signed certificate
    pub fn generate(instance_id: Uuid) -> Result<Self, KeyStoreError> {
        let key_pair = KeyPair::generate_for(&PKCS_ED25519)
            .map_err(|e| KeyStoreError::Generation(e.to_string()))?;
        Self::self_sign(instance_id, key_pair)
    }

    fn self_sign(instance_id: Uuid, key_pair: KeyPair) -> Result<Self, KeyStoreError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, instance_id.to_string());
        params.distinguished_name = dn;
        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(CERT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| KeyStoreError::Generation(e.to_string()))?;

        Ok(Self {
            instance_id,
            certificate: CertificateDer::from(cert.der().to_vec()),
            private_key: key_pair.serialize_der(),
        })
    }

    /// UUID carried in the certificate's common name
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.clone()))
    }

    /// SHA-256 of the DER certificate
    pub fn fingerprint(&self) -> [u8; 32] {
        fingerprint(&self.certificate)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("instance_id", &self.instance_id)
            .field("certificate", &short_fingerprint(&self.certificate))
            .finish_non_exhaustive()
    }
}

/// SHA-256 over raw certificate bytes
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Short hex fingerprint, for logs
pub fn short_fingerprint(der: &[u8]) -> String {
    hex::encode(&fingerprint(der)[..8])
}

/// Check a context name against the allowed pattern
pub fn validate_context(context: &str) -> Result<(), KeyStoreError> {
    if context_pattern().is_match(context) {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidContext(context.to_string()))
    }
}

/// Reject host strings that could escape the store directory
pub fn validate_host(host: &str) -> Result<(), KeyStoreError> {
    let invalid = host.is_empty()
        || host.len() > MAX_HOST_LEN
        || host.starts_with('.')
        || host.contains("..")
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if invalid {
        Err(KeyStoreError::InvalidHost(host.to_string()))
    } else {
        Ok(())
    }
}

/// Filesystem-backed store of identities and pinned certificates
#[derive(Debug)]
pub struct KeyStore {
    root: PathBuf,
    instance_id: Uuid,
    /// Serializes identity creation so concurrent callers never mix key and cert files
    identity_lock: Mutex<()>,
}

impl KeyStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// The instance id is taken from `configured` when given, otherwise
    /// loaded from `<root>/instance-id` or generated and persisted there.
    pub fn open(root: impl AsRef<Path>, configured: Option<Uuid>) -> Result<Self, KeyStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let instance_id = match configured {
            Some(id) => id,
            None => Self::load_or_create_instance_id(&root)?,
        };
        info!("Key store at {} (instance {})", root.display(), instance_id);
        Ok(Self {
            root,
            instance_id,
            identity_lock: Mutex::new(()),
        })
    }

    fn load_or_create_instance_id(root: &Path) -> Result<Uuid, KeyStoreError> {
        let path = root.join(INSTANCE_ID_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Uuid::parse_str(raw.trim()).map_err(|e| KeyStoreError::Corrupt {
                path,
                reason: e.to_string(),
            });
        }
        let id = Uuid::new_v4();
        write_atomic(&path, id.to_string().as_bytes())?;
        info!("Generated new instance id {}", id);
        Ok(id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Load the identity used towards `host`, generating it on first use.
    ///
    /// A stored certificate issued to a different instance id is re-signed
    /// with the same key so its common name matches the current instance.
    pub fn load_or_create_identity(
        &self,
        context: &str,
        host: &str,
    ) -> Result<Identity, KeyStoreError> {
        let dir = self.host_dir(context, host)?;
        let key_path = dir.join(KEY_FILE);
        let cert_path = dir.join(CERT_FILE);
        let issued_path = dir.join(ISSUED_TO_FILE);
        let _guard = self
            .identity_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if key_path.exists() && cert_path.exists() {
            let pem = fs::read_to_string(&key_path)?;
            let key_pair = KeyPair::from_pem(&pem).map_err(|e| KeyStoreError::Corrupt {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            let issued_to = fs::read_to_string(&issued_path)
                .ok()
                .and_then(|raw| Uuid::parse_str(raw.trim()).ok());

            if issued_to == Some(self.instance_id) {
                let cert = fs::read(&cert_path)?;
                if cert.is_empty() {
                    return Err(KeyStoreError::Corrupt {
                        path: cert_path,
                        reason: "empty certificate".into(),
                    });
                }
                debug!("Loaded identity for {}/{}", context, host);
                return Ok(Identity {
                    instance_id: self.instance_id,
                    certificate: CertificateDer::from(cert),
                    private_key: key_pair.serialize_der(),
                });
            }

            warn!(
                "Identity for {}/{} was issued to {}; re-signing for instance {}",
                context,
                host,
                issued_to.map_or_else(|| "an unknown instance".to_string(), |id| id.to_string()),
                self.instance_id
            );
            let identity = Identity::self_sign(self.instance_id, key_pair)?;
            write_atomic(&cert_path, identity.certificate())?;
            write_atomic(&issued_path, self.instance_id.to_string().as_bytes())?;
            return Ok(identity);
        }

        let key_pair = KeyPair::generate_for(&PKCS_ED25519)
            .map_err(|e| KeyStoreError::Generation(e.to_string()))?;
        let pem = key_pair.serialize_pem();
        let identity = Identity::self_sign(self.instance_id, key_pair)?;

        fs::create_dir_all(&dir)?;
        write_atomic(&key_path, pem.as_bytes())?;
        write_atomic(&cert_path, identity.certificate())?;
        write_atomic(&issued_path, self.instance_id.to_string().as_bytes())?;
        info!(
            "Generated identity for {}/{} (cert {})",
            context,
            host,
            short_fingerprint(identity.certificate())
        );
        Ok(identity)
    }

    /// Load the certificate pinned for `host`
    pub fn load_pinned_certificate(
        &self,
        context: &str,
        host: &str,
    ) -> Result<CertificateDer<'static>, KeyStoreError> {
        let path = self.host_dir(context, host)?.join(PINNED_FILE);
        match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Ok(CertificateDer::from(bytes)),
            Ok(_) => Err(KeyStoreError::NotFound(host.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeyStoreError::NotFound(host.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pin `der` for `host`, atomically replacing any previous pin
    pub fn save_pinned_certificate(
        &self,
        context: &str,
        host: &str,
        der: &[u8],
    ) -> Result<(), KeyStoreError> {
        if der.is_empty() {
            return Err(KeyStoreError::Corrupt {
                path: PathBuf::from(PINNED_FILE),
                reason: "refusing to pin an empty certificate".into(),
            });
        }
        let dir = self.host_dir(context, host)?;
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(PINNED_FILE), der)?;
        info!("Pinned certificate {} for {}/{}", short_fingerprint(der), context, host);
        Ok(())
    }

    /// Drop the pinned certificate for `host`. Returns whether one existed.
    pub fn forget_host(&self, context: &str, host: &str) -> Result<bool, KeyStoreError> {
        let path = self.host_dir(context, host)?.join(PINNED_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!("Forgot pinned certificate for {}/{}", context, host);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn host_dir(&self, context: &str, host: &str) -> Result<PathBuf, KeyStoreError> {
        validate_context(context)?;
        validate_host(host)?;
        Ok(self.root.join(context).join(host))
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
