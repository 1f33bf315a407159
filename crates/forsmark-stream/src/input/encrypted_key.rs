#![forbid(unsafe_code)]

//! The EncryptedKey input handler.
//!
//! Registers a memoizing token provider under the EncryptedKey's id. The
//! produced token carries a lazy resolver: on the first key request it
//! resolves the wrapping token through the KeyInfo, unwraps the session
//! key, and on any unwrap failure substitutes random bytes of the exact
//! length the requested symmetric algorithm mandates, so an attacker
//! cannot distinguish a failed unwrap from a successful one before the
//! downstream cipher runs.

use crate::config::XmlSecurityProperties;
use crate::context::{SecurityContext, TokenProvider};
use crate::input::{token_for_key_info, KeyInfoUse};
use crate::key::KeyMaterial;
use crate::security_event::{KeyUsage, SecurityEvent};
use crate::structures::EncryptedKeyRecord;
use crate::token::{SecurityToken, TokenKind};
use forsmark_core::{algorithm, Error, QName, Result};
use forsmark_crypto::keytransport::OaepParams;
use forsmark_crypto::registry;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Register a provider for this EncryptedKey and fire the token event.
pub fn register(
    record: EncryptedKeyRecord,
    properties: &Rc<XmlSecurityProperties>,
    security: &Rc<SecurityContext>,
) -> Result<Rc<TokenProvider>> {
    register_with_path(record, Vec::new(), properties, security)
}

/// Like [`register`], carrying the element path of the EncryptedKey for
/// token provenance.
pub fn register_with_path(
    record: EncryptedKeyRecord,
    element_path: Vec<QName>,
    properties: &Rc<XmlSecurityProperties>,
    security: &Rc<SecurityContext>,
) -> Result<Rc<TokenProvider>> {
    let id = record.id.clone();
    let properties = properties.clone();

    let factory = Box::new(move |_ctx: &Rc<SecurityContext>| {
        let token = Rc::new(SecurityToken::new(
            Some(record.id.clone()),
            TokenKind::EncryptedKey,
        ));
        token.set_element_path(element_path.clone());
        install_unwrap_resolver(&token, record.clone(), properties.clone());
        Ok(token)
    });

    let provider = TokenProvider::new(&id, factory);
    security.register_token_provider(&id, provider.clone())?;

    // Produce the token now so the observation event carries it.
    let token = provider.token(security)?;
    security.emit(SecurityEvent::TokenObserved {
        token_id: token.id().map(str::to_owned),
        kind: token.kind(),
        correlation_id: id.clone(),
    });

    Ok(provider)
}

fn install_unwrap_resolver(
    token: &Rc<SecurityToken>,
    record: EncryptedKeyRecord,
    properties: Rc<XmlSecurityProperties>,
) {
    let this: Weak<SecurityToken> = Rc::downgrade(token);
    let wrapping_memo: RefCell<Option<Rc<SecurityToken>>> = RefCell::new(None);
    let secret_memo: RefCell<Option<Vec<u8>>> = RefCell::new(None);

    token.set_resolver(Box::new(
        move |ctx: &Rc<SecurityContext>,
              symmetric_uri: &str,
              _usage: KeyUsage,
              correlation_id: &str| {
            if let Some(secret) = secret_memo.borrow().as_ref() {
                return Ok(KeyMaterial::symmetric(secret.clone()));
            }

            let wrapping = match wrapping_memo.borrow().as_ref() {
                Some(w) => w.clone(),
                None => {
                    let wrapping = token_for_key_info(
                        record.key_info.as_ref(),
                        KeyInfoUse::Decryption,
                        &properties,
                        ctx,
                    )?;
                    if let Some(this) = this.upgrade() {
                        wrapping.add_wrapped_token(this.clone());
                        this.set_wrapping_token(wrapping.clone());
                    }
                    *wrapping_memo.borrow_mut() = Some(wrapping.clone());
                    wrapping
                }
            };

            let usage = if wrapping.is_asymmetric() {
                KeyUsage::AsymmetricKeyWrap
            } else {
                KeyUsage::SymmetricKeyWrap
            };

            // Algorithm and key-encryption-key lookups fail loudly; only
            // the unwrap itself is subject to the timing mitigation.
            registry::lookup(&record.method_uri)?;
            let kek = wrapping.secret_key_for(ctx, &record.method_uri, usage, correlation_id)?;

            let secret = match try_unwrap(&record, &kek) {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "unwrapping of the encrypted key failed; \
                         generating a faked key to mitigate timing attacks"
                    );
                    let bits = registry::key_length_bits(symmetric_uri)?;
                    let mut faked = vec![0u8; bits as usize / 8];
                    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut faked);
                    faked
                }
            };
            *secret_memo.borrow_mut() = Some(secret.clone());
            Ok(KeyMaterial::symmetric(secret))
        },
    ));
}

fn try_unwrap(record: &EncryptedKeyRecord, kek: &KeyMaterial) -> Result<Vec<u8>> {
    match record.method_uri.as_str() {
        algorithm::RSA_PKCS1 | algorithm::RSA_OAEP | algorithm::RSA_OAEP_ENC11 => {
            // OAEP parameters default to SHA-1 and MGF1 with SHA-1.
            let params = OaepParams {
                digest_uri: record.oaep_digest_uri.clone(),
                mgf_uri: record.oaep_mgf_uri.clone(),
                p_source: record.oaep_p_source.clone(),
            };
            let transport =
                forsmark_crypto::keytransport::from_uri_with_params(&record.method_uri, params)?;
            let private = kek
                .rsa_private_key()
                .ok_or_else(|| Error::Key("RSA private key required for key transport".into()))?;
            transport.decrypt(private, &record.cipher_value)
        }
        algorithm::KW_AES128
        | algorithm::KW_AES192
        | algorithm::KW_AES256
        | algorithm::KW_TRIPLEDES => {
            let keywrap = forsmark_crypto::keywrap::from_uri(&record.method_uri)?;
            let kek_bytes = kek
                .symmetric_bytes()
                .ok_or_else(|| Error::Key("symmetric KEK required for key wrap".into()))?;
            keywrap.unwrap(kek_bytes, &record.cipher_value)
        }
        other => Err(Error::UnsupportedAlgorithm(format!(
            "EncryptedKey method: {other}"
        ))),
    }
}
