#![forbid(unsafe_code)]

//! Inbound processors: security-header buffering, signature reference
//! verification, EncryptedKey handling, and in-stream decryption.

pub mod decrypt;
pub mod encrypted_key;
pub mod security_header;
pub mod signature;

use crate::config::XmlSecurityProperties;
use crate::context::SecurityContext;
use crate::structures::KeyInfoRecord;
use crate::token::{SecurityToken, TokenKind};
use forsmark_core::{Error, Result};
use std::rc::Rc;

/// Why a KeyInfo is being resolved to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInfoUse {
    Verification,
    Decryption,
}

/// Resolve a KeyInfo to a security token by walking the configured key
/// identifier types: an embedded EncryptedKey, a same-document retrieval
/// reference, then the caller-supplied key for this use.
pub fn token_for_key_info(
    key_info: Option<&KeyInfoRecord>,
    usage: KeyInfoUse,
    properties: &Rc<XmlSecurityProperties>,
    security: &Rc<SecurityContext>,
) -> Result<Rc<SecurityToken>> {
    if let Some(ki) = key_info {
        if let Some(encrypted_key) = &ki.encrypted_key {
            let provider =
                encrypted_key::register((**encrypted_key).clone(), properties, security)?;
            return provider.token(security);
        }
        if let Some(uri) = &ki.retrieval_uri {
            let id = uri.strip_prefix('#').unwrap_or(uri);
            let provider = security.token_provider(id).ok_or_else(|| {
                Error::Key(format!("no token registered for retrieval reference {uri}"))
            })?;
            return provider.token(security);
        }
    }

    let key = match usage {
        KeyInfoUse::Verification => properties.signature_verification_key.clone(),
        KeyInfoUse::Decryption => properties.decryption_key.clone(),
    }
    .ok_or_else(|| Error::Key(format!("no key configured for {usage:?}")))?;

    let certificates = key_info.map(|ki| ki.certificates.clone()).unwrap_or_default();
    let kind = if certificates.is_empty() {
        TokenKind::UserSupplied
    } else {
        TokenKind::X509
    };
    let token = Rc::new(SecurityToken::new(None, kind));
    if !certificates.is_empty() {
        token.set_certificates(certificates);
    }
    if key.is_asymmetric() {
        token.set_public_key(key.clone());
    }
    token.set_secret_key("", key);
    Ok(token)
}

/// Collect the full subtree of an already-delivered start element by
/// pulling from upstream until the element closes.
pub(crate) fn collect_subtree(
    first: forsmark_core::XmlSecEvent,
    upstream: &mut dyn crate::chain::EventSource,
    ctx: &crate::chain::PipelineContext,
) -> Result<Vec<forsmark_core::XmlSecEvent>> {
    use forsmark_core::XmlSecEvent;

    let mut events = vec![first];
    let mut depth = 1usize;
    while depth > 0 {
        let ev = upstream
            .next_event(ctx)?
            .ok_or_else(|| Error::XmlStructure("document ended inside an element".into()))?;
        match &ev {
            XmlSecEvent::StartElement(_) => depth += 1,
            XmlSecEvent::EndElement { .. } => depth -= 1,
            _ => {}
        }
        events.push(ev);
    }
    Ok(events)
}
