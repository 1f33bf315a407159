#![forbid(unsafe_code)]

//! Security properties: the per-invocation configuration for inbound and
//! outbound processing, including the secure-processing limits and the
//! outbound algorithm defaults derived from the key material.

use crate::key::KeyMaterial;
use forsmark_core::{algorithm, Error, QName, Result};

/// An outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Sign,
    Encrypt,
}

/// How the signing key is identified inside the emitted `KeyInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyIdentifierType {
    /// X509Data with issuer name and serial number.
    X509IssuerSerial,
    /// A KeyName element.
    KeyName,
    /// No KeyInfo at all.
    None,
}

/// An element selected for signing or encryption.
#[derive(Debug, Clone)]
pub struct SecurePart {
    pub name: QName,
}

impl SecurePart {
    pub fn new(name: QName) -> Self {
        Self { name }
    }
}

/// Per-invocation configuration.
#[derive(Default)]
pub struct XmlSecurityProperties {
    // ── Inbound ──────────────────────────────────────────────────────
    pub signature_verification: bool,
    pub decryption: bool,
    /// Actions that must have occurred by document end; a missing one is
    /// an error.
    pub required_actions: Vec<Action>,
    pub max_references_per_manifest: usize,
    pub max_transforms_per_reference: usize,
    pub allow_manifests: bool,
    pub allow_external_references: bool,
    pub base_uri: Option<String>,
    pub signature_verification_key: Option<KeyMaterial>,
    pub decryption_key: Option<KeyMaterial>,

    // ── Outbound ─────────────────────────────────────────────────────
    pub actions: Vec<Action>,
    pub signature_key: Option<KeyMaterial>,
    pub signature_algorithm: Option<String>,
    pub signature_digest_algorithm: Option<String>,
    pub signature_c14n_algorithm: Option<String>,
    pub signature_key_identifier: Option<KeyIdentifierType>,
    pub signature_key_name: Option<String>,
    pub signature_parts: Vec<SecurePart>,
    pub encryption_key: Option<KeyMaterial>,
    pub encryption_key_transport_algorithm: Option<String>,
    pub encryption_symmetric_algorithm: Option<String>,
    pub encryption_parts: Vec<SecurePart>,
}

impl XmlSecurityProperties {
    pub fn new() -> Self {
        Self {
            signature_verification: true,
            decryption: true,
            max_references_per_manifest: 30,
            max_transforms_per_reference: 5,
            allow_manifests: false,
            allow_external_references: false,
            ..Default::default()
        }
    }

    /// Validate an inbound configuration.
    pub fn validate_inbound(&self) -> Result<()> {
        if self.max_references_per_manifest == 0 {
            return Err(Error::InvalidConfiguration(
                "max_references_per_manifest must be at least 1".into(),
            ));
        }
        if self.max_transforms_per_reference == 0 {
            return Err(Error::InvalidConfiguration(
                "max_transforms_per_reference must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Validate an outbound configuration and fill in the defaults the
    /// caller left open.
    pub fn validate_and_apply_defaults_outbound(&mut self) -> Result<()> {
        if self.actions.is_empty() {
            return Err(Error::InvalidConfiguration(
                "no outbound action configured".into(),
            ));
        }
        for action in self.actions.clone() {
            match action {
                Action::Sign => self.apply_signature_defaults()?,
                Action::Encrypt => self.apply_encryption_defaults()?,
            }
        }
        Ok(())
    }

    fn apply_signature_defaults(&mut self) -> Result<()> {
        let key = self.signature_key.as_ref().ok_or_else(|| {
            Error::InvalidConfiguration("signature action requires a signature key".into())
        })?;
        if self.signature_parts.is_empty() {
            return Err(Error::InvalidConfiguration(
                "signature action requires at least one secure part".into(),
            ));
        }
        if self.signature_algorithm.is_none() {
            // Derived from the class of the signing key.
            let derived = match key {
                KeyMaterial::Rsa { .. } => algorithm::RSA_SHA1,
                KeyMaterial::Dsa { .. } => algorithm::DSA_SHA1,
                KeyMaterial::Symmetric(_) => algorithm::HMAC_SHA1,
                KeyMaterial::EcP256 { .. } => algorithm::ECDSA_SHA256,
                KeyMaterial::EcP384 { .. } => algorithm::ECDSA_SHA384,
            };
            self.signature_algorithm = Some(derived.to_owned());
        }
        if self.signature_digest_algorithm.is_none() {
            self.signature_digest_algorithm = Some(algorithm::SHA1.to_owned());
        }
        if self.signature_c14n_algorithm.is_none() {
            self.signature_c14n_algorithm = Some(algorithm::EXC_C14N.to_owned());
        }
        if self.signature_key_identifier.is_none() {
            self.signature_key_identifier = Some(KeyIdentifierType::X509IssuerSerial);
        }
        Ok(())
    }

    fn apply_encryption_defaults(&mut self) -> Result<()> {
        if self.encryption_key.is_none() {
            return Err(Error::InvalidConfiguration(
                "encrypt action requires an encryption key".into(),
            ));
        }
        if self.encryption_parts.is_empty() {
            return Err(Error::InvalidConfiguration(
                "encrypt action requires at least one secure part".into(),
            ));
        }
        if self.encryption_key_transport_algorithm.is_none() {
            self.encryption_key_transport_algorithm = Some(algorithm::RSA_OAEP.to_owned());
        }
        if self.encryption_symmetric_algorithm.is_none() {
            self.encryption_symmetric_algorithm = Some(algorithm::AES256_CBC.to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_requires_action() {
        let mut props = XmlSecurityProperties::new();
        assert!(matches!(
            props.validate_and_apply_defaults_outbound().unwrap_err(),
            Error::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_signature_defaults_for_symmetric_key() {
        let mut props = XmlSecurityProperties::new();
        props.actions.push(Action::Sign);
        props.signature_key = Some(KeyMaterial::symmetric(vec![0u8; 32]));
        props.signature_parts.push(SecurePart::new(QName::new("", "doc")));
        props.validate_and_apply_defaults_outbound().unwrap();

        assert_eq!(props.signature_algorithm.as_deref(), Some(algorithm::HMAC_SHA1));
        assert_eq!(
            props.signature_digest_algorithm.as_deref(),
            Some(algorithm::SHA1)
        );
        assert_eq!(
            props.signature_c14n_algorithm.as_deref(),
            Some(algorithm::EXC_C14N)
        );
        assert_eq!(
            props.signature_key_identifier,
            Some(KeyIdentifierType::X509IssuerSerial)
        );
    }

    #[test]
    fn test_encryption_defaults() {
        let mut props = XmlSecurityProperties::new();
        props.actions.push(Action::Encrypt);
        props.encryption_key = Some(KeyMaterial::symmetric(vec![0u8; 16]));
        props.encryption_parts.push(SecurePart::new(QName::new("", "doc")));
        props.validate_and_apply_defaults_outbound().unwrap();

        assert_eq!(
            props.encryption_key_transport_algorithm.as_deref(),
            Some(algorithm::RSA_OAEP)
        );
        assert_eq!(
            props.encryption_symmetric_algorithm.as_deref(),
            Some(algorithm::AES256_CBC)
        );
    }

    #[test]
    fn test_sign_without_key_is_invalid() {
        let mut props = XmlSecurityProperties::new();
        props.actions.push(Action::Sign);
        props.signature_parts.push(SecurePart::new(QName::new("", "doc")));
        assert!(props.validate_and_apply_defaults_outbound().is_err());
    }
}
