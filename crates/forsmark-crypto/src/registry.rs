#![forbid(unsafe_code)]

//! The algorithm registry: URI → (family, native name, key length).
//!
//! Built once from a declarative table and immutable afterwards; this is
//! the only process-wide state in the engine. The key length recorded for
//! a symmetric URI is authoritative for both session-key generation and
//! the timing-mitigation padding in the EncryptedKey handler.

use forsmark_core::{algorithm, Error, Result};
use std::collections::HashMap;
use std::sync::OnceLock;

/// The role an algorithm URI plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmFamily {
    Digest,
    Signature,
    Mac,
    BlockCipher,
    KeyWrap,
    KeyTransport,
    Canonicalization,
    Transform,
    Mgf,
}

/// One registered algorithm.
#[derive(Debug, Clone)]
pub struct AlgorithmEntry {
    pub uri: &'static str,
    pub family: AlgorithmFamily,
    /// Conventional short name (`"SHA-256"`, `"AES/CBC"`, ...).
    pub native_name: &'static str,
    /// Required key length in bits; 0 for keyless algorithms.
    pub key_length_bits: u32,
    /// Symbolic key family used when generating symmetric keys
    /// (`"AES"`, `"DESede"`, `"HmacSHA1"`, ...); empty when not keyed.
    pub key_family: &'static str,
    /// Optional provider hint carried through from configuration.
    pub provider_hint: Option<&'static str>,
}

fn table() -> &'static HashMap<&'static str, AlgorithmEntry> {
    static TABLE: OnceLock<HashMap<&'static str, AlgorithmEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use AlgorithmFamily::*;
        let entries = [
            // Digests
            entry(algorithm::SHA1, Digest, "SHA-1", 0, ""),
            entry(algorithm::SHA224, Digest, "SHA-224", 0, ""),
            entry(algorithm::SHA256, Digest, "SHA-256", 0, ""),
            entry(algorithm::SHA384, Digest, "SHA-384", 0, ""),
            entry(algorithm::SHA512, Digest, "SHA-512", 0, ""),
            entry(algorithm::SHA3_256, Digest, "SHA3-256", 0, ""),
            entry(algorithm::SHA3_384, Digest, "SHA3-384", 0, ""),
            entry(algorithm::SHA3_512, Digest, "SHA3-512", 0, ""),
            // Signatures
            entry(algorithm::RSA_SHA1, Signature, "SHA1withRSA", 0, "RSA"),
            entry(algorithm::RSA_SHA256, Signature, "SHA256withRSA", 0, "RSA"),
            entry(algorithm::RSA_SHA384, Signature, "SHA384withRSA", 0, "RSA"),
            entry(algorithm::RSA_SHA512, Signature, "SHA512withRSA", 0, "RSA"),
            entry(algorithm::DSA_SHA1, Signature, "SHA1withDSA", 0, "DSA"),
            entry(algorithm::DSA_SHA256, Signature, "SHA256withDSA", 0, "DSA"),
            entry(algorithm::ECDSA_SHA1, Signature, "SHA1withECDSA", 0, "EC"),
            entry(algorithm::ECDSA_SHA256, Signature, "SHA256withECDSA", 0, "EC"),
            entry(algorithm::ECDSA_SHA384, Signature, "SHA384withECDSA", 0, "EC"),
            entry(algorithm::ECDSA_SHA512, Signature, "SHA512withECDSA", 0, "EC"),
            // MACs
            entry(algorithm::HMAC_SHA1, Mac, "HmacSHA1", 160, "HmacSHA1"),
            entry(algorithm::HMAC_SHA256, Mac, "HmacSHA256", 256, "HmacSHA256"),
            entry(algorithm::HMAC_SHA384, Mac, "HmacSHA384", 384, "HmacSHA384"),
            entry(algorithm::HMAC_SHA512, Mac, "HmacSHA512", 512, "HmacSHA512"),
            // Block ciphers
            entry(algorithm::AES128_CBC, BlockCipher, "AES/CBC", 128, "AES"),
            entry(algorithm::AES192_CBC, BlockCipher, "AES/CBC", 192, "AES"),
            entry(algorithm::AES256_CBC, BlockCipher, "AES/CBC", 256, "AES"),
            entry(algorithm::AES128_GCM, BlockCipher, "AES/GCM", 128, "AES"),
            entry(algorithm::AES192_GCM, BlockCipher, "AES/GCM", 192, "AES"),
            entry(algorithm::AES256_GCM, BlockCipher, "AES/GCM", 256, "AES"),
            entry(algorithm::TRIPLEDES_CBC, BlockCipher, "DESede/CBC", 192, "DESede"),
            // Key wrap
            entry(algorithm::KW_AES128, KeyWrap, "AESWrap", 128, "AES"),
            entry(algorithm::KW_AES192, KeyWrap, "AESWrap", 192, "AES"),
            entry(algorithm::KW_AES256, KeyWrap, "AESWrap", 256, "AES"),
            entry(algorithm::KW_TRIPLEDES, KeyWrap, "DESedeWrap", 192, "DESede"),
            // Key transport
            entry(algorithm::RSA_PKCS1, KeyTransport, "RSA/PKCS1", 0, "RSA"),
            entry(algorithm::RSA_OAEP, KeyTransport, "RSA/OAEP", 0, "RSA"),
            entry(algorithm::RSA_OAEP_ENC11, KeyTransport, "RSA/OAEP", 0, "RSA"),
            // Canonicalization
            entry(algorithm::C14N, Canonicalization, "c14n 1.0", 0, ""),
            entry(algorithm::C14N_WITH_COMMENTS, Canonicalization, "c14n 1.0", 0, ""),
            entry(algorithm::EXC_C14N, Canonicalization, "exc-c14n 1.0", 0, ""),
            entry(
                algorithm::EXC_C14N_WITH_COMMENTS,
                Canonicalization,
                "exc-c14n 1.0",
                0,
                "",
            ),
            // Transforms
            entry(algorithm::BASE64, Transform, "base64", 0, ""),
            entry(algorithm::ENVELOPED_SIGNATURE, Transform, "enveloped-signature", 0, ""),
            // MGF
            entry(algorithm::MGF1_SHA1, Mgf, "MGF1/SHA-1", 0, ""),
            entry(algorithm::MGF1_SHA256, Mgf, "MGF1/SHA-256", 0, ""),
            entry(algorithm::MGF1_SHA384, Mgf, "MGF1/SHA-384", 0, ""),
            entry(algorithm::MGF1_SHA512, Mgf, "MGF1/SHA-512", 0, ""),
        ];
        entries.into_iter().map(|e| (e.uri, e)).collect()
    })
}

fn entry(
    uri: &'static str,
    family: AlgorithmFamily,
    native_name: &'static str,
    key_length_bits: u32,
    key_family: &'static str,
) -> AlgorithmEntry {
    AlgorithmEntry {
        uri,
        family,
        native_name,
        key_length_bits,
        key_family,
        provider_hint: None,
    }
}

/// Look up an algorithm by its URI.
pub fn lookup(uri: &str) -> Result<&'static AlgorithmEntry> {
    table()
        .get(uri)
        .ok_or_else(|| Error::UnsupportedAlgorithm(uri.to_owned()))
}

/// The exact key length in bits required by a keyed algorithm URI.
pub fn key_length_bits(uri: &str) -> Result<u32> {
    let e = lookup(uri)?;
    if e.key_length_bits == 0 {
        return Err(Error::UnsupportedAlgorithm(format!(
            "no key length registered for {uri}"
        )));
    }
    Ok(e.key_length_bits)
}

/// The symbolic key family used when generating a symmetric key for `uri`.
pub fn required_key_family(uri: &str) -> Result<&'static str> {
    let e = lookup(uri)?;
    if e.key_family.is_empty() {
        return Err(Error::UnsupportedAlgorithm(format!(
            "no key family registered for {uri}"
        )));
    }
    Ok(e.key_family)
}
