#![forbid(unsafe_code)]

//! Core types for the Forsmark streaming XML security engine.
//!
//! This crate holds everything the other crates agree on: the error type,
//! the namespace and algorithm URI constants, and the parse-event data
//! model the streaming pipeline is built around.

pub mod algorithm;
pub mod error;
pub mod event;
pub mod ns;

pub use error::{Error, Result};
pub use event::{Attribute, NsDecl, QName, StartElementData, XmlSecEvent};
