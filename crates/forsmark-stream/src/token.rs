#![forbid(unsafe_code)]

//! The security token model.
//!
//! All token flavors collapse into one concrete record with a kind tag and
//! an optional lazy key resolver; subclass behavior from the classical
//! design becomes a dispatch on the tag plus the resolver closure. Key
//! wrapping links form a directed acyclic graph; a per-token recursion
//! guard turns any cycle into a `RecursiveKeyReference` error and is
//! cleared on every exit path, including failures.

use crate::context::SecurityContext;
use crate::key::KeyMaterial;
use crate::security_event::{KeyUsage, SecurityEvent};
use forsmark_core::{Error, QName, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// What produced this token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Symmetric,
    X509,
    EncryptedKey,
    UserSupplied,
}

/// Declared usage of a token, propagated to its wrapping token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUsage {
    Signature,
    Verification,
    Encryption,
    Decryption,
}

/// Lazy key fetch installed on tokens whose key material is derived on
/// first use (EncryptedKey unwrap).
pub type KeyResolver =
    Box<dyn Fn(&Rc<SecurityContext>, &str, KeyUsage, &str) -> Result<KeyMaterial>>;

pub struct SecurityToken {
    id: Option<String>,
    kind: TokenKind,
    /// Recursion guard; belongs to the call site, not global state.
    invoked: Cell<bool>,
    keys: RefCell<HashMap<String, KeyMaterial>>,
    public_key: RefCell<Option<KeyMaterial>>,
    certificates: RefCell<Vec<Vec<u8>>>,
    wrapping: RefCell<Option<Rc<SecurityToken>>>,
    wrapped: RefCell<Vec<Rc<SecurityToken>>>,
    usages: RefCell<Vec<TokenUsage>>,
    element_path: RefCell<Vec<QName>>,
    resolver: RefCell<Option<KeyResolver>>,
    asymmetric: Cell<bool>,
}

impl SecurityToken {
    pub fn new(id: Option<String>, kind: TokenKind) -> Self {
        Self {
            id,
            kind,
            invoked: Cell::new(false),
            keys: RefCell::new(HashMap::new()),
            public_key: RefCell::new(None),
            certificates: RefCell::new(Vec::new()),
            wrapping: RefCell::new(None),
            wrapped: RefCell::new(Vec::new()),
            usages: RefCell::new(Vec::new()),
            element_path: RefCell::new(Vec::new()),
            resolver: RefCell::new(None),
            asymmetric: Cell::new(false),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn is_asymmetric(&self) -> bool {
        self.asymmetric.get()
    }

    /// Bind key material to an algorithm URI.
    pub fn set_secret_key(&self, algorithm_uri: &str, key: KeyMaterial) {
        if key.has_private() {
            self.asymmetric.set(true);
        }
        self.keys.borrow_mut().insert(algorithm_uri.to_owned(), key);
    }

    pub fn set_public_key(&self, key: KeyMaterial) {
        self.asymmetric.set(true);
        *self.public_key.borrow_mut() = Some(key);
    }

    pub fn set_certificates(&self, certs: Vec<Vec<u8>>) {
        if !certs.is_empty() {
            self.asymmetric.set(true);
        }
        *self.certificates.borrow_mut() = certs;
    }

    pub fn certificates(&self) -> Vec<Vec<u8>> {
        self.certificates.borrow().clone()
    }

    pub fn set_element_path(&self, path: Vec<QName>) {
        *self.element_path.borrow_mut() = path;
    }

    pub fn element_path(&self) -> Vec<QName> {
        self.element_path.borrow().clone()
    }

    pub fn set_resolver(&self, resolver: KeyResolver) {
        *self.resolver.borrow_mut() = Some(resolver);
    }

    pub fn set_wrapping_token(&self, token: Rc<SecurityToken>) {
        *self.wrapping.borrow_mut() = Some(token);
    }

    pub fn wrapping_token(&self) -> Option<Rc<SecurityToken>> {
        self.wrapping.borrow().clone()
    }

    pub fn add_wrapped_token(&self, token: Rc<SecurityToken>) {
        self.wrapped.borrow_mut().push(token);
    }

    pub fn wrapped_tokens(&self) -> Vec<Rc<SecurityToken>> {
        self.wrapped.borrow().clone()
    }

    pub fn usages(&self) -> Vec<TokenUsage> {
        self.usages.borrow().clone()
    }

    fn enter(&self) -> Result<()> {
        if self.invoked.get() {
            return Err(Error::RecursiveKeyReference);
        }
        self.invoked.set(true);
        Ok(())
    }

    fn leave(&self) {
        self.invoked.set(false);
    }

    /// Declare a usage; also declared on the wrapping token, transitively,
    /// under the same recursion-guard discipline.
    pub fn add_usage(&self, usage: TokenUsage) -> Result<()> {
        self.enter()?;
        let result = (|| {
            if !self.usages.borrow().contains(&usage) {
                self.usages.borrow_mut().push(usage);
            }
            if let Some(wrapping) = self.wrapping_token() {
                wrapping.add_usage(usage)?;
            }
            Ok(())
        })();
        self.leave();
        result
    }

    /// Fetch the secret key for an algorithm URI.
    ///
    /// Emits an algorithm-used event with the computed key length on
    /// success. Re-entering this token while the fetch is in progress
    /// fails with `RecursiveKeyReference`.
    pub fn secret_key_for(
        &self,
        ctx: &Rc<SecurityContext>,
        algorithm_uri: &str,
        usage: KeyUsage,
        correlation_id: &str,
    ) -> Result<KeyMaterial> {
        if correlation_id.is_empty() {
            return Err(Error::Key("correlation id must not be empty".into()));
        }
        self.enter()?;
        let result = self.fetch_key(ctx, algorithm_uri, usage, correlation_id);
        if let Ok(key) = &result {
            ctx.emit(SecurityEvent::AlgorithmUsed {
                uri: algorithm_uri.to_owned(),
                usage,
                key_length_bits: Some(key.bits()),
                correlation_id: correlation_id.to_owned(),
            });
        }
        self.leave();
        result
    }

    fn fetch_key(
        &self,
        ctx: &Rc<SecurityContext>,
        algorithm_uri: &str,
        usage: KeyUsage,
        correlation_id: &str,
    ) -> Result<KeyMaterial> {
        if let Some(key) = self.keys.borrow().get(algorithm_uri) {
            return Ok(key.clone());
        }
        // User-set keys not tied to a declared algorithm.
        if let Some(key) = self.keys.borrow().get("") {
            return Ok(key.clone());
        }
        let resolver = self.resolver.borrow();
        if let Some(resolver) = resolver.as_ref() {
            let key = resolver(ctx, algorithm_uri, usage, correlation_id)?;
            if key.has_private() {
                self.asymmetric.set(true);
            }
            self.keys
                .borrow_mut()
                .insert(algorithm_uri.to_owned(), key.clone());
            return Ok(key);
        }
        Err(Error::Key(format!(
            "no key material for algorithm {algorithm_uri}"
        )))
    }

    /// Fetch the public key, emitting an algorithm-used event on success.
    pub fn public_key_for(
        &self,
        ctx: &Rc<SecurityContext>,
        algorithm_uri: &str,
        usage: KeyUsage,
        correlation_id: &str,
    ) -> Result<KeyMaterial> {
        if correlation_id.is_empty() {
            return Err(Error::Key("correlation id must not be empty".into()));
        }
        self.enter()?;
        let result = self
            .public_key
            .borrow()
            .clone()
            .or_else(|| {
                // Fall back to asymmetric material in the key table.
                self.keys
                    .borrow()
                    .values()
                    .find(|k| k.is_asymmetric())
                    .cloned()
            })
            .ok_or_else(|| Error::Key("token has no public key".into()));
        if let Ok(key) = &result {
            ctx.emit(SecurityEvent::AlgorithmUsed {
                uri: algorithm_uri.to_owned(),
                usage,
                key_length_bits: Some(key.bits()),
                correlation_id: correlation_id.to_owned(),
            });
        }
        self.leave();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_lookup_and_event() {
        let ctx = SecurityContext::new();
        let token = SecurityToken::new(Some("t".into()), TokenKind::Symmetric);
        token.set_secret_key("urn:alg", KeyMaterial::symmetric(vec![0u8; 32]));

        let key = token
            .secret_key_for(&ctx, "urn:alg", KeyUsage::Decryption, "corr")
            .unwrap();
        assert_eq!(key.bits(), 256);

        let events = ctx.recorded_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SecurityEvent::AlgorithmUsed {
                key_length_bits, ..
            } => assert_eq!(*key_length_bits, Some(256)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_recursion_guard_fails_and_clears() {
        let ctx = SecurityContext::new();
        let token = Rc::new(SecurityToken::new(None, TokenKind::EncryptedKey));
        let inner = Rc::downgrade(&token);
        token.set_resolver(Box::new(move |ctx, uri, usage, corr| {
            // A resolver that consults its own token again.
            let token = inner.upgrade().expect("token alive");
            token.secret_key_for(ctx, uri, usage, corr).map(|_| unreachable!())
        }));

        let err = token
            .secret_key_for(&ctx, "urn:alg", KeyUsage::Decryption, "corr")
            .unwrap_err();
        assert!(matches!(err, Error::RecursiveKeyReference));
        // Guard cleared: a well-behaved fetch afterwards succeeds.
        token.set_secret_key("urn:alg", KeyMaterial::symmetric(vec![1u8; 16]));
        assert!(token
            .secret_key_for(&ctx, "urn:alg", KeyUsage::Decryption, "corr")
            .is_ok());
    }

    #[test]
    fn test_nested_fetch_on_wrapping_token_allowed() {
        // The guard is per token; resolving through a different token is a
        // legal nested fetch.
        let ctx = SecurityContext::new();
        let wrapping = Rc::new(SecurityToken::new(Some("kek".into()), TokenKind::Symmetric));
        wrapping.set_secret_key("urn:wrap", KeyMaterial::symmetric(vec![2u8; 16]));

        let token = Rc::new(SecurityToken::new(Some("ek".into()), TokenKind::EncryptedKey));
        token.set_wrapping_token(wrapping.clone());
        let wrapping2 = wrapping.clone();
        token.set_resolver(Box::new(move |ctx, _uri, usage, corr| {
            wrapping2.secret_key_for(ctx, "urn:wrap", usage, corr)
        }));

        let key = token
            .secret_key_for(&ctx, "urn:data", KeyUsage::Decryption, "corr")
            .unwrap();
        assert_eq!(key.bits(), 128);
        // Memoized on the wrapped token afterwards.
        assert!(token
            .secret_key_for(&ctx, "urn:data", KeyUsage::Decryption, "corr")
            .is_ok());
    }

    #[test]
    fn test_usage_propagates_to_wrapping_token() {
        let wrapping = Rc::new(SecurityToken::new(None, TokenKind::X509));
        let token = SecurityToken::new(None, TokenKind::EncryptedKey);
        token.set_wrapping_token(wrapping.clone());

        token.add_usage(TokenUsage::Decryption).unwrap();
        token.add_usage(TokenUsage::Decryption).unwrap();
        assert_eq!(token.usages(), vec![TokenUsage::Decryption]);
        assert_eq!(wrapping.usages(), vec![TokenUsage::Decryption]);
    }

    #[test]
    fn test_asymmetric_flag_follows_material() {
        let token = SecurityToken::new(None, TokenKind::UserSupplied);
        assert!(!token.is_asymmetric());
        token.set_secret_key("", KeyMaterial::symmetric(vec![0u8; 16]));
        assert!(!token.is_asymmetric());
        token.set_certificates(vec![vec![0x30, 0x82]]);
        assert!(token.is_asymmetric());
    }
}
