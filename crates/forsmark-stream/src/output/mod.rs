#![forbid(unsafe_code)]

//! Outbound processors: signature emission and element encryption.

pub mod encrypt;
pub mod signature;

use forsmark_core::{Attribute, NsDecl, QName, XmlSecEvent};

pub(crate) const DS_PREFIX: &str = "ds";
pub(crate) const XENC_PREFIX: &str = "xenc";

/// Shorthand for building the XML-DSig / XML-Enc elements the outbound
/// processors emit.
pub(crate) fn dsig_name(local: &str) -> QName {
    QName::with_prefix(forsmark_core::ns::DSIG, local, DS_PREFIX)
}

pub(crate) fn xenc_name(local: &str) -> QName {
    QName::with_prefix(forsmark_core::ns::ENC, local, XENC_PREFIX)
}

pub(crate) struct ElementBuilder {
    events: Vec<XmlSecEvent>,
    open: Vec<QName>,
}

impl ElementBuilder {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            open: Vec::new(),
        }
    }

    pub fn open(&mut self, name: QName) -> &mut Self {
        self.open_with(name, Vec::new(), Vec::new())
    }

    pub fn open_with(
        &mut self,
        name: QName,
        attributes: Vec<Attribute>,
        namespaces: Vec<NsDecl>,
    ) -> &mut Self {
        self.events.push(XmlSecEvent::start_element(
            name.clone(),
            attributes,
            namespaces,
        ));
        self.open.push(name);
        self
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        self.events.push(XmlSecEvent::characters(text));
        self
    }

    pub fn close(&mut self) -> &mut Self {
        if let Some(name) = self.open.pop() {
            self.events.push(XmlSecEvent::end_element(name));
        }
        self
    }

    pub fn finish(mut self) -> Vec<XmlSecEvent> {
        while !self.open.is_empty() {
            self.close();
        }
        self.events
    }
}
