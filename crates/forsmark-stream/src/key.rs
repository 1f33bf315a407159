#![forbid(unsafe_code)]

//! Key material carried by security tokens and configuration.

use forsmark_core::Error;
use forsmark_crypto::sign::SigningKey;

/// The concrete key material a token can hold for an algorithm URI.
#[derive(Clone)]
pub enum KeyMaterial {
    Rsa {
        private: Option<rsa::RsaPrivateKey>,
        public: rsa::RsaPublicKey,
    },
    Dsa {
        private: Option<dsa::SigningKey>,
        public: dsa::VerifyingKey,
    },
    EcP256 {
        private: Option<p256::ecdsa::SigningKey>,
        public: p256::ecdsa::VerifyingKey,
    },
    EcP384 {
        private: Option<p384::ecdsa::SigningKey>,
        public: p384::ecdsa::VerifyingKey,
    },
    /// AES / 3DES / HMAC key octets.
    Symmetric(Vec<u8>),
}

impl KeyMaterial {
    pub fn rsa_private(private: rsa::RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        KeyMaterial::Rsa {
            private: Some(private),
            public,
        }
    }

    pub fn rsa_public(public: rsa::RsaPublicKey) -> Self {
        KeyMaterial::Rsa {
            private: None,
            public,
        }
    }

    pub fn symmetric(bytes: impl Into<Vec<u8>>) -> Self {
        KeyMaterial::Symmetric(bytes.into())
    }

    /// True for private/public key material (as opposed to a secret key).
    pub fn is_asymmetric(&self) -> bool {
        !matches!(self, KeyMaterial::Symmetric(_))
    }

    pub fn has_private(&self) -> bool {
        match self {
            KeyMaterial::Rsa { private, .. } => private.is_some(),
            KeyMaterial::Dsa { private, .. } => private.is_some(),
            KeyMaterial::EcP256 { private, .. } => private.is_some(),
            KeyMaterial::EcP384 { private, .. } => private.is_some(),
            KeyMaterial::Symmetric(_) => false,
        }
    }

    /// The key length reported on algorithm events: RSA modulus bits, DSA
    /// prime P bits, EC curve order bits, or encoded octets times eight.
    pub fn bits(&self) -> u32 {
        use rsa::traits::PublicKeyParts;
        match self {
            KeyMaterial::Rsa { public, .. } => public.n().bits() as u32,
            KeyMaterial::Dsa { public, .. } => public.components().p().bits() as u32,
            KeyMaterial::EcP256 { .. } => 256,
            KeyMaterial::EcP384 { .. } => 384,
            KeyMaterial::Symmetric(bytes) => bytes.len() as u32 * 8,
        }
    }

    /// The raw octets of a symmetric key.
    pub fn symmetric_bytes(&self) -> Option<&[u8]> {
        match self {
            KeyMaterial::Symmetric(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn rsa_public_key(&self) -> Option<&rsa::RsaPublicKey> {
        match self {
            KeyMaterial::Rsa { public, .. } => Some(public),
            _ => None,
        }
    }

    pub fn rsa_private_key(&self) -> Option<&rsa::RsaPrivateKey> {
        match self {
            KeyMaterial::Rsa {
                private: Some(pk), ..
            } => Some(pk),
            _ => None,
        }
    }

    /// Convert to signing-key material for the signature algorithms.
    pub fn to_signing_key(&self) -> Result<SigningKey, Error> {
        Ok(match self {
            KeyMaterial::Rsa {
                private: Some(pk), ..
            } => SigningKey::Rsa(pk.clone()),
            KeyMaterial::Rsa { public, .. } => SigningKey::RsaPublic(public.clone()),
            KeyMaterial::Dsa {
                private: Some(sk), ..
            } => SigningKey::Dsa(sk.clone()),
            KeyMaterial::Dsa { public, .. } => SigningKey::DsaPublic(public.clone()),
            KeyMaterial::EcP256 {
                private: Some(sk), ..
            } => SigningKey::EcP256(sk.clone()),
            KeyMaterial::EcP256 { public, .. } => SigningKey::EcP256Public(*public),
            KeyMaterial::EcP384 {
                private: Some(sk), ..
            } => SigningKey::EcP384(sk.clone()),
            KeyMaterial::EcP384 { public, .. } => SigningKey::EcP384Public(*public),
            KeyMaterial::Symmetric(bytes) => SigningKey::Hmac(bytes.clone()),
        })
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Rsa { private, .. } => {
                if private.is_some() {
                    write!(f, "RSA private+public key")
                } else {
                    write!(f, "RSA public key")
                }
            }
            KeyMaterial::Dsa { private, .. } => {
                if private.is_some() {
                    write!(f, "DSA private+public key")
                } else {
                    write!(f, "DSA public key")
                }
            }
            KeyMaterial::EcP256 { .. } => write!(f, "EC P-256 key"),
            KeyMaterial::EcP384 { .. } => write!(f, "EC P-384 key"),
            KeyMaterial::Symmetric(k) => write!(f, "symmetric key ({} bytes)", k.len()),
        }
    }
}
