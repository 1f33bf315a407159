#![forbid(unsafe_code)]

//! Per-document state: the document context and the security context.
//!
//! Both live exactly as long as the document being processed and are never
//! shared across threads; interior mutability is plain `RefCell`/`Cell`.

use crate::security_event::{SecurityEvent, SecurityEventListener};
use crate::token::SecurityToken;
use forsmark_core::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Stable identity of a processor in a chain, used to key content flags.
pub type ProcessorId = u64;

/// What kind of protected content a processor has established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFlag {
    Signed,
    Encrypted,
}

/// Mutable per-document parse state.
#[derive(Default)]
pub struct DocumentContext {
    pub base_uri: Option<String>,
    pub encoding: Option<String>,
    /// Content flags keyed by the processor that established them, so a
    /// flag lifts when that processor leaves the chain.
    flags: RefCell<Vec<(ProcessorId, ContentFlag)>>,
}

impl DocumentContext {
    pub fn new(base_uri: Option<String>) -> Self {
        Self {
            base_uri,
            encoding: None,
            flags: RefCell::new(Vec::new()),
        }
    }

    pub fn set_content_flag(&self, id: ProcessorId, flag: ContentFlag) {
        self.flags.borrow_mut().push((id, flag));
    }

    pub fn unset_content_flag(&self, id: ProcessorId) {
        self.flags.borrow_mut().retain(|(pid, _)| *pid != id);
    }

    pub fn is_in_signed_content(&self) -> bool {
        self.flags
            .borrow()
            .iter()
            .any(|(_, f)| *f == ContentFlag::Signed)
    }

    pub fn is_in_encrypted_content(&self) -> bool {
        self.flags
            .borrow()
            .iter()
            .any(|(_, f)| *f == ContentFlag::Encrypted)
    }
}

/// A lazy, memoizing factory producing a security token by id.
pub struct TokenProvider {
    id: String,
    factory: Box<dyn Fn(&Rc<SecurityContext>) -> Result<Rc<SecurityToken>>>,
    token: RefCell<Option<Rc<SecurityToken>>>,
}

impl TokenProvider {
    pub fn new(
        id: &str,
        factory: Box<dyn Fn(&Rc<SecurityContext>) -> Result<Rc<SecurityToken>>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: id.to_owned(),
            factory,
            token: RefCell::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this provider has already produced its token.
    pub fn has_produced(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Produce the token, memoizing the first result.
    pub fn token(&self, ctx: &Rc<SecurityContext>) -> Result<Rc<SecurityToken>> {
        if let Some(token) = self.token.borrow().as_ref() {
            return Ok(token.clone());
        }
        let token = (self.factory)(ctx)?;
        *self.token.borrow_mut() = Some(token.clone());
        Ok(token)
    }
}

/// Result of verifying one signature, kept for the caller's summary.
#[derive(Debug, Clone)]
pub struct SignatureVerificationResult {
    pub signature_id: String,
    pub valid: bool,
    pub references: Vec<crate::security_event::ReferenceStatus>,
}

/// Per-document security state: the token provider registry and the
/// security event bus.
#[derive(Default)]
pub struct SecurityContext {
    providers: RefCell<HashMap<String, Rc<TokenProvider>>>,
    listeners: RefCell<Vec<Box<dyn SecurityEventListener>>>,
    dispatching: Cell<bool>,
    deferred_listeners: RefCell<Vec<Box<dyn SecurityEventListener>>>,
    recorded: RefCell<Vec<SecurityEvent>>,
    results: RefCell<Vec<SignatureVerificationResult>>,
}

impl SecurityContext {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register a token provider under an id.
    ///
    /// A duplicate id is rejected only when the existing provider has
    /// already produced a token; an unused registration may be replaced.
    pub fn register_token_provider(&self, id: &str, provider: Rc<TokenProvider>) -> Result<()> {
        let mut providers = self.providers.borrow_mut();
        if let Some(existing) = providers.get(id) {
            if existing.has_produced() {
                return Err(Error::InvalidSecurity(format!(
                    "duplicate token provider id: {id}"
                )));
            }
        }
        providers.insert(id.to_owned(), provider);
        Ok(())
    }

    pub fn token_provider(&self, id: &str) -> Option<Rc<TokenProvider>> {
        self.providers.borrow().get(id).cloned()
    }

    /// Register an event listener.
    ///
    /// Registration during a dispatch is deferred until the dispatch
    /// completes.
    pub fn register_listener(&self, listener: Box<dyn SecurityEventListener>) {
        if self.dispatching.get() {
            self.deferred_listeners.borrow_mut().push(listener);
        } else {
            self.listeners.borrow_mut().push(listener);
        }
    }

    /// Dispatch an event synchronously to all listeners in registration
    /// order.
    pub fn emit(&self, event: SecurityEvent) {
        self.recorded.borrow_mut().push(event.clone());
        if self.dispatching.get() {
            // Nested emit from inside a listener: record only; the
            // listener set is unavailable until the outer dispatch ends.
            return;
        }
        self.dispatching.set(true);
        let mut listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for listener in listeners.iter_mut() {
            listener.on_event(&event);
        }
        let mut slot = self.listeners.borrow_mut();
        *slot = listeners;
        slot.append(&mut self.deferred_listeners.borrow_mut());
        self.dispatching.set(false);
    }

    /// All events emitted so far, in order.
    pub fn recorded_events(&self) -> Vec<SecurityEvent> {
        self.recorded.borrow().clone()
    }

    pub fn push_result(&self, result: SignatureVerificationResult) {
        self.results.borrow_mut().push(result);
    }

    pub fn results(&self) -> Vec<SignatureVerificationResult> {
        self.results.borrow().clone()
    }
}
