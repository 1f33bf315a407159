#![forbid(unsafe_code)]

//! Cryptographic algorithms for the Forsmark streaming XML security engine.
//!
//! The [`registry`] module is the single authority mapping algorithm URIs
//! to their family, native name, and required key length; the remaining
//! modules hold the concrete implementations it describes.

pub mod cipher;
pub mod digest;
pub mod keytransport;
pub mod keywrap;
pub mod registry;
pub mod sign;

pub use digest::DigestAlgorithm;
pub use registry::{AlgorithmEntry, AlgorithmFamily};
