#![forbid(unsafe_code)]

/// Errors produced by the Forsmark streaming XML security engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("missing required element: {0}")]
    MissingElement(String),

    #[error("missing required attribute: {0}")]
    MissingAttribute(String),

    /// A secure-processing limit was exceeded before any cryptographic work.
    #[error("secure processing limit exceeded: {0}")]
    LimitExceeded(String),

    /// A secure-processing rule was violated (manifest references,
    /// external references, and the like).
    #[error("invalid security: {0}")]
    InvalidSecurity(String),

    #[error("signature reference was never processed: {0}")]
    UnprocessedReference(String),

    #[error("duplicate signature reference: {0}")]
    DuplicateReference(String),

    #[error("digest mismatch for reference: {0}")]
    DigestMismatch(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("recursive key reference detected")]
    RecursiveKeyReference,

    #[error("key error: {0}")]
    Key(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("base64 decode error: {0}")]
    Base64(String),

    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("invalid XML structure: {0}")]
    XmlStructure(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
