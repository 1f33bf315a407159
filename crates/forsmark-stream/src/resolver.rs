#![forbid(unsafe_code)]

//! Resource resolvers for signature references.
//!
//! A same-document reference is matched against the live start element —
//! never by a post-parse lookup. External references resolve to a byte
//! stream, and only when configuration allows them.

use forsmark_core::{ns, Error, Result, StartElementData};

/// Matches and fetches the resource a reference URI points at.
pub trait ResourceResolver {
    /// Test a live start element against this resolver's URI.
    fn matches(&self, start: &StartElementData) -> bool;

    /// Whether the URI is a same-document fragment.
    fn is_same_document(&self) -> bool;

    /// Fetch the bytes of an external reference.
    fn resolve_external(&self) -> Result<Vec<u8>>;
}

/// Resolver for `#fragment` (and whole-document, `""`) references.
pub struct SameDocumentResolver {
    fragment: String,
}

impl SameDocumentResolver {
    pub fn new(fragment: &str) -> Self {
        Self {
            fragment: fragment.to_owned(),
        }
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }
}

impl ResourceResolver for SameDocumentResolver {
    fn matches(&self, start: &StartElementData) -> bool {
        if self.fragment.is_empty() {
            // URI="" selects the document element.
            return start.element_path.len() == 1;
        }
        let id = start
            .attribute(ns::attr::ID)
            .or_else(|| start.attribute("ID"))
            .or_else(|| start.attribute("id"))
            .or_else(|| start.attribute_ns(ns::XML, "id"));
        id == Some(self.fragment.as_str())
    }

    fn is_same_document(&self) -> bool {
        true
    }

    fn resolve_external(&self) -> Result<Vec<u8>> {
        Err(Error::InvalidSecurity(
            "same-document reference has no external resource".into(),
        ))
    }
}

/// Resolver for `file:` and relative URIs against a base URI.
pub struct FileResolver {
    uri: String,
    base_uri: Option<String>,
}

impl FileResolver {
    pub fn new(uri: &str, base_uri: Option<&str>) -> Self {
        Self {
            uri: uri.to_owned(),
            base_uri: base_uri.map(str::to_owned),
        }
    }
}

impl ResourceResolver for FileResolver {
    fn matches(&self, _start: &StartElementData) -> bool {
        false
    }

    fn is_same_document(&self) -> bool {
        false
    }

    fn resolve_external(&self) -> Result<Vec<u8>> {
        let path = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
        if path.contains("://") {
            return Err(Error::Io(std::io::Error::other(format!(
                "unsupported external reference scheme: {}",
                self.uri
            ))));
        }
        let resolved = match (&self.base_uri, std::path::Path::new(path).is_absolute()) {
            (Some(base), false) => std::path::Path::new(base).join(path),
            _ => std::path::PathBuf::from(path),
        };
        Ok(std::fs::read(&resolved)?)
    }
}

/// Pick the first resolver in registry order that handles this URI.
///
/// The returned resolver is reused for every test of the reference it was
/// built for; reference-to-resolver binding is by allocation.
pub fn resolver_for(uri: &str, base_uri: Option<&str>) -> Result<Box<dyn ResourceResolver>> {
    if uri.is_empty() || uri.starts_with('#') {
        let fragment = uri.strip_prefix('#').unwrap_or("");
        Ok(Box::new(SameDocumentResolver::new(fragment)))
    } else {
        Ok(Box::new(FileResolver::new(uri, base_uri)))
    }
}
