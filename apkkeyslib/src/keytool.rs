//! Builds the keytool and jarsigner command lines used to produce and apply signing credentials

use std::path::{Path, PathBuf};

use crate::data::{CertificateRequest, SigningRequest};
use crate::tool::{ToolAction, ToolInvocation};

/// Primary keystore container
pub const KEYSTORE_FILE: &str = "android.jks";
/// Interoperable copy of the keystore
pub const PKCS12_FILE: &str = "android.p12";
/// PEM encoded public certificate
pub const CERTIFICATE_FILE: &str = "certificate.cer";

pub const KEY_ALGORITHM: &str = "RSA";
pub const KEY_SIZE: &str = "2048";
pub const SIGNATURE_ALGORITHM: &str = "SHA256withRSA";
pub const DIGEST_ALGORITHM: &str = "SHA-256";

/// Locations of the two external tools
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolPaths {
    pub keytool: PathBuf,
    pub jarsigner: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            keytool: PathBuf::from("keytool"),
            jarsigner: PathBuf::from("jarsigner"),
        }
    }
}

impl ToolPaths {
    /// Checks that keytool can be run
    pub fn probe(&self, dir: &Path) -> ToolInvocation {
        ToolInvocation::new(ToolAction::Probe, &self.keytool, dir).arg("-help")
    }

    /// Creates an RSA key pair and self-signed certificate inside a new JKS keystore
    pub fn generate_keypair(&self, dir: &Path, request: &CertificateRequest) -> ToolInvocation {
        ToolInvocation::new(ToolAction::GenerateKeyPair, &self.keytool, dir)
            .arg("-genkey")
            .arg("-v")
            .arg("-keystore")
            .arg(KEYSTORE_FILE)
            .arg("-alias")
            .arg(request.alias.as_str())
            .arg("-keyalg")
            .arg(KEY_ALGORITHM)
            .arg("-keysize")
            .arg(KEY_SIZE)
            .arg("-validity")
            .arg(request.validity_days().to_string())
            .arg("-storepass")
            .arg(request.store_password.as_str())
            .arg("-keypass")
            .arg(request.key_password.as_str())
            .arg("-dname")
            .arg(request.distinguished_name())
    }

    /// Exports the public certificate in RFC 7468 (PEM) form
    pub fn export_certificate(&self, dir: &Path, request: &CertificateRequest) -> ToolInvocation {
        ToolInvocation::new(ToolAction::ExportCertificate, &self.keytool, dir)
            .arg("-export")
            .arg("-rfc")
            .arg("-alias")
            .arg(request.alias.as_str())
            .arg("-keystore")
            .arg(KEYSTORE_FILE)
            .arg("-storepass")
            .arg(request.store_password.as_str())
            .arg("-file")
            .arg(CERTIFICATE_FILE)
    }

    /// Copies the JKS keystore into a PKCS #12 keystore protected by the same store password
    pub fn convert_to_pkcs12(&self, dir: &Path, request: &CertificateRequest) -> ToolInvocation {
        ToolInvocation::new(ToolAction::ConvertContainer, &self.keytool, dir)
            .arg("-importkeystore")
            .arg("-srckeystore")
            .arg(KEYSTORE_FILE)
            .arg("-destkeystore")
            .arg(PKCS12_FILE)
            .arg("-deststoretype")
            .arg("PKCS12")
            .arg("-srcstorepass")
            .arg(request.store_password.as_str())
            .arg("-deststorepass")
            .arg(request.store_password.as_str())
    }

    /// Signs `payload` in place using the key stored under the request's alias
    pub fn sign_payload(
        &self,
        dir: &Path,
        keystore: &Path,
        payload: &Path,
        request: &SigningRequest,
    ) -> ToolInvocation {
        ToolInvocation::new(ToolAction::SignPayload, &self.jarsigner, dir)
            .arg("-verbose")
            .arg("-keystore")
            .arg(keystore.to_string_lossy())
            .arg("-storepass")
            .arg(request.store_password.as_str())
            .arg("-keypass")
            .arg(request.key_password.as_str())
            .arg("-sigalg")
            .arg(SIGNATURE_ALGORITHM)
            .arg("-digestalg")
            .arg(DIGEST_ALGORITHM)
            .arg(payload.to_string_lossy())
            .arg(request.alias.as_str())
    }

    pub fn verify_signature(&self, dir: &Path, payload: &Path) -> ToolInvocation {
        ToolInvocation::new(ToolAction::VerifySignature, &self.jarsigner, dir)
            .arg("-verify")
            .arg("-verbose")
            .arg(payload.to_string_lossy())
    }
}
