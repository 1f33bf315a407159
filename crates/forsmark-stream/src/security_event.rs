#![forbid(unsafe_code)]

//! Security events emitted while a document is processed.
//!
//! Every event carries a correlation id equal to the id of the element
//! that triggered it, so listeners can tie algorithm and token events to
//! the reference or EncryptedKey they belong to.

use crate::token::TokenKind;

/// How a key or algorithm is being used when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Signature,
    Verification,
    Digest,
    Canonicalization,
    Encryption,
    Decryption,
    AsymmetricKeyWrap,
    SymmetricKeyWrap,
}

/// Outcome of one signature reference.
#[derive(Debug, Clone)]
pub struct ReferenceStatus {
    pub uri: String,
    pub processed: bool,
    pub digest_ok: bool,
}

/// A tagged security event.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    TokenObserved {
        token_id: Option<String>,
        kind: TokenKind,
        correlation_id: String,
    },
    AlgorithmUsed {
        uri: String,
        usage: KeyUsage,
        key_length_bits: Option<u32>,
        correlation_id: String,
    },
    VerificationOutcome {
        signature_id: String,
        valid: bool,
        /// Per-reference status, in SignedInfo order.
        references: Vec<ReferenceStatus>,
    },
}

impl SecurityEvent {
    pub fn correlation_id(&self) -> &str {
        match self {
            SecurityEvent::TokenObserved { correlation_id, .. } => correlation_id,
            SecurityEvent::AlgorithmUsed { correlation_id, .. } => correlation_id,
            SecurityEvent::VerificationOutcome { signature_id, .. } => signature_id,
        }
    }
}

/// Listener registered on the security context's event bus.
pub trait SecurityEventListener {
    fn on_event(&mut self, event: &SecurityEvent);
}
