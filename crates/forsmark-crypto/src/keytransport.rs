#![forbid(unsafe_code)]

//! Key transport algorithms (RSA PKCS#1 v1.5, RSA-OAEP).

use forsmark_core::{algorithm, Error};

/// RSA-OAEP parameters taken from an `EncryptionMethod` element.
///
/// Absent values fall back to the XML-Enc defaults: SHA-1 digest and
/// MGF1 with SHA-1.
#[derive(Debug, Clone, Default)]
pub struct OaepParams {
    /// Digest method URI, `None` meaning SHA-1.
    pub digest_uri: Option<String>,
    /// MGF algorithm URI, `None` meaning MGF1 with SHA-1.
    pub mgf_uri: Option<String>,
    /// OAEPparams (P-source) octets.
    pub p_source: Option<Vec<u8>>,
}

/// Trait for key transport algorithms.
pub trait KeyTransportAlgorithm: Send {
    fn uri(&self) -> &'static str;
    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>, Error>;
    fn decrypt(
        &self,
        private_key: &rsa::RsaPrivateKey,
        encrypted: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Create a key transport algorithm from its URI with default parameters.
pub fn from_uri(uri: &str) -> Result<Box<dyn KeyTransportAlgorithm>, Error> {
    from_uri_with_params(uri, OaepParams::default())
}

/// Create a key transport algorithm from its URI and OAEP parameters.
pub fn from_uri_with_params(
    uri: &str,
    params: OaepParams,
) -> Result<Box<dyn KeyTransportAlgorithm>, Error> {
    match uri {
        algorithm::RSA_PKCS1 => Ok(Box::new(RsaPkcs1Transport)),
        algorithm::RSA_OAEP => Ok(Box::new(RsaOaepTransport {
            uri: algorithm::RSA_OAEP,
            params,
        })),
        algorithm::RSA_OAEP_ENC11 => Ok(Box::new(RsaOaepTransport {
            uri: algorithm::RSA_OAEP_ENC11,
            params,
        })),
        _ => Err(Error::UnsupportedAlgorithm(format!("key transport: {uri}"))),
    }
}

struct RsaPkcs1Transport;

impl KeyTransportAlgorithm for RsaPkcs1Transport {
    fn uri(&self) -> &'static str {
        algorithm::RSA_PKCS1
    }

    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>, Error> {
        use rsa::Pkcs1v15Encrypt;
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, key_data)
            .map_err(|e| Error::Crypto(format!("RSA PKCS#1 encrypt: {e}")))
    }

    fn decrypt(
        &self,
        private_key: &rsa::RsaPrivateKey,
        encrypted: &[u8],
    ) -> Result<Vec<u8>, Error> {
        use rsa::Pkcs1v15Encrypt;
        private_key
            .decrypt(Pkcs1v15Encrypt, encrypted)
            .map_err(|e| Error::Crypto(format!("RSA PKCS#1 decrypt: {e}")))
    }
}

struct RsaOaepTransport {
    uri: &'static str,
    params: OaepParams,
}

impl RsaOaepTransport {
    fn padding(&self) -> Result<rsa::Oaep, Error> {
        let digest_uri = self.params.digest_uri.as_deref().unwrap_or(algorithm::SHA1);
        let mgf_uri = self.params.mgf_uri.as_deref().unwrap_or(algorithm::MGF1_SHA1);

        let label = match &self.params.p_source {
            None => None,
            Some(bytes) => Some(String::from_utf8(bytes.clone()).map_err(|_| {
                Error::Crypto("OAEPparams with non-UTF8 octets are not supported".into())
            })?),
        };

        macro_rules! oaep {
            ($digest:ty, $mgf:ty) => {
                match label {
                    Some(label) => {
                        rsa::Oaep::new_with_mgf_hash_and_label::<$digest, $mgf, String>(label)
                    }
                    None => rsa::Oaep::new_with_mgf_hash::<$digest, $mgf>(),
                }
            };
        }
        macro_rules! with_mgf {
            ($digest:ty) => {
                match mgf_uri {
                    algorithm::MGF1_SHA1 => oaep!($digest, sha1::Sha1),
                    algorithm::MGF1_SHA256 => oaep!($digest, sha2::Sha256),
                    algorithm::MGF1_SHA384 => oaep!($digest, sha2::Sha384),
                    algorithm::MGF1_SHA512 => oaep!($digest, sha2::Sha512),
                    _ => return Err(Error::UnsupportedAlgorithm(format!("MGF: {mgf_uri}"))),
                }
            };
        }
        Ok(match digest_uri {
            algorithm::SHA1 => with_mgf!(sha1::Sha1),
            algorithm::SHA256 => with_mgf!(sha2::Sha256),
            algorithm::SHA384 => with_mgf!(sha2::Sha384),
            algorithm::SHA512 => with_mgf!(sha2::Sha512),
            _ => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "OAEP digest: {digest_uri}"
                )))
            }
        })
    }
}

impl KeyTransportAlgorithm for RsaOaepTransport {
    fn uri(&self) -> &'static str {
        self.uri
    }

    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, self.padding()?, key_data)
            .map_err(|e| Error::Crypto(format!("RSA-OAEP encrypt: {e}")))
    }

    fn decrypt(
        &self,
        private_key: &rsa::RsaPrivateKey,
        encrypted: &[u8],
    ) -> Result<Vec<u8>, Error> {
        private_key
            .decrypt(self.padding()?, encrypted)
            .map_err(|e| Error::Crypto(format!("RSA-OAEP decrypt: {e}")))
    }
}
