#![forbid(unsafe_code)]

//! Forsmark: a streaming engine for W3C XML Signature and XML Encryption.
//!
//! Signatures are verified or produced and element content decrypted or
//! encrypted as a side effect of pulling or pushing XML parse events;
//! the document is never materialized. See [`stream::InboundXmlSec`] and
//! [`stream::OutboundXmlSec`] for the entry points.

pub use forsmark_c14n as c14n;
pub use forsmark_core as core;
pub use forsmark_crypto as crypto;
pub use forsmark_stream as stream;
