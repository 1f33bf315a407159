#![forbid(unsafe_code)]

//! The parse-event data model the streaming pipeline operates on.
//!
//! An [`XmlSecEvent`] is one step of a document parse: start/end element,
//! character data, comment, processing instruction, or the document
//! boundaries. Start elements carry their attributes, the namespace
//! declarations written on them, and their ancestor chain of qualified
//! names (the element path).

use std::fmt;

/// A qualified XML name.
///
/// Two names are equal iff namespace URI and local name are equal; the
/// prefix is carried only for serialization and canonicalization.
#[derive(Debug, Clone, Default)]
pub struct QName {
    pub namespace_uri: String,
    pub local_name: String,
    pub prefix: String,
}

impl QName {
    pub fn new(namespace_uri: &str, local_name: &str) -> Self {
        Self {
            namespace_uri: namespace_uri.to_owned(),
            local_name: local_name.to_owned(),
            prefix: String::new(),
        }
    }

    pub fn with_prefix(namespace_uri: &str, local_name: &str, prefix: &str) -> Self {
        Self {
            namespace_uri: namespace_uri.to_owned(),
            local_name: local_name.to_owned(),
            prefix: prefix.to_owned(),
        }
    }

    /// The name as written in a document: `prefix:local` or `local`.
    pub fn qualified(&self) -> String {
        if self.prefix.is_empty() {
            self.local_name.clone()
        } else {
            format!("{}:{}", self.prefix, self.local_name)
        }
    }
}

impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.namespace_uri == other.namespace_uri && self.local_name == other.local_name
    }
}

impl Eq for QName {}

impl std::hash::Hash for QName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace_uri.hash(state);
        self.local_name.hash(state);
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_uri.is_empty() {
            write!(f, "{}", self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace_uri, self.local_name)
        }
    }
}

/// An attribute on a start element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

impl Attribute {
    pub fn new(name: QName, value: &str) -> Self {
        Self {
            name,
            value: value.to_owned(),
        }
    }
}

/// A namespace declaration written on a start element.
///
/// An empty prefix is the default namespace; an empty URI un-declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsDecl {
    pub prefix: String,
    pub uri: String,
}

impl NsDecl {
    pub fn new(prefix: &str, uri: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            uri: uri.to_owned(),
        }
    }
}

/// Payload of a start-element event.
#[derive(Debug, Clone)]
pub struct StartElementData {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    pub namespaces: Vec<NsDecl>,
    /// Ancestor chain of qualified names, outermost first, including self.
    pub element_path: Vec<QName>,
}

impl StartElementData {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
            namespaces: Vec::new(),
            element_path: Vec::new(),
        }
    }

    /// Look up an unqualified attribute by local name.
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace_uri.is_empty() && a.name.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Look up a namespace-qualified attribute.
    pub fn attribute_ns(&self, namespace_uri: &str, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace_uri == namespace_uri && a.name.local_name == local_name)
            .map(|a| a.value.as_str())
    }
}

/// One event of a streaming XML parse.
#[derive(Debug, Clone)]
pub enum XmlSecEvent {
    StartDocument,
    EndDocument,
    StartElement(StartElementData),
    EndElement { name: QName },
    Characters { text: String },
    Comment { text: String },
    ProcessingInstruction { target: String, data: String },
}

impl XmlSecEvent {
    /// Convenience constructor for a start element.
    pub fn start_element(
        name: QName,
        attributes: Vec<Attribute>,
        namespaces: Vec<NsDecl>,
    ) -> Self {
        XmlSecEvent::StartElement(StartElementData {
            name,
            attributes,
            namespaces,
            element_path: Vec::new(),
        })
    }

    pub fn end_element(name: QName) -> Self {
        XmlSecEvent::EndElement { name }
    }

    pub fn characters(text: &str) -> Self {
        XmlSecEvent::Characters {
            text: text.to_owned(),
        }
    }

    pub fn as_start_element(&self) -> Option<&StartElementData> {
        match self {
            XmlSecEvent::StartElement(data) => Some(data),
            _ => None,
        }
    }

    /// The element name, for start and end element events.
    pub fn name(&self) -> Option<&QName> {
        match self {
            XmlSecEvent::StartElement(data) => Some(&data.name),
            XmlSecEvent::EndElement { name } => Some(name),
            _ => None,
        }
    }

    /// The ancestor chain for start elements; empty for other events.
    pub fn element_path(&self) -> &[QName] {
        match self {
            XmlSecEvent::StartElement(data) => &data.element_path,
            _ => &[],
        }
    }
}
