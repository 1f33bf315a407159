#![forbid(unsafe_code)]

//! The streaming XML security pipeline.
//!
//! Wraps an event reader or writer and performs XML Signature verification
//! and XML Encryption decryption (inbound), or signature production and
//! element encryption (outbound), as a side effect of pulling or pushing
//! parse events. The document is never materialized as a tree; signed
//! subtrees are digested exactly in tandem with the parse.
//!
//! Entry points are [`inbound::InboundXmlSec`] and
//! [`outbound::OutboundXmlSec`].

pub mod chain;
pub mod config;
pub mod context;
pub mod digest_sink;
pub mod inbound;
pub mod input;
pub mod key;
pub mod outbound;
pub mod output;
pub mod reader;
pub mod resolver;
pub mod security_event;
pub mod structures;
pub mod token;
pub mod transform;
pub mod writer;

pub use config::{Action, SecurePart, XmlSecurityProperties};
pub use inbound::{InboundXmlSec, XmlSecReader};
pub use key::KeyMaterial;
pub use outbound::{OutboundXmlSec, XmlSecWriter};
pub use security_event::{KeyUsage, ReferenceStatus, SecurityEvent};
