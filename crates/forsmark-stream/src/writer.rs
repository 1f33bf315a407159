#![forbid(unsafe_code)]

//! Event serializer: the push-mode sink at the end of the outbound chain.

use forsmark_c14n::escape;
use forsmark_core::{NsDecl, Result, StartElementData, XmlSecEvent};
use std::collections::BTreeMap;
use std::io::Write;

/// Serializes events to a byte sink as they arrive.
pub struct EventWriter<'a> {
    out: Box<dyn Write + 'a>,
}

impl<'a> EventWriter<'a> {
    pub fn new(out: Box<dyn Write + 'a>) -> Self {
        Self { out }
    }

    pub fn event(&mut self, ev: &XmlSecEvent) -> Result<()> {
        match ev {
            XmlSecEvent::StartDocument | XmlSecEvent::EndDocument => {}
            XmlSecEvent::StartElement(data) => self.start_element(data)?,
            XmlSecEvent::EndElement { name } => {
                self.out.write_all(b"</")?;
                self.out.write_all(name.qualified().as_bytes())?;
                self.out.write_all(b">")?;
            }
            XmlSecEvent::Characters { text } => {
                escape::write_text(&mut *self.out, text)?;
            }
            XmlSecEvent::Comment { text } => {
                self.out.write_all(b"<!--")?;
                self.out.write_all(text.as_bytes())?;
                self.out.write_all(b"-->")?;
            }
            XmlSecEvent::ProcessingInstruction { target, data } => {
                self.out.write_all(b"<?")?;
                self.out.write_all(target.as_bytes())?;
                if !data.is_empty() {
                    self.out.write_all(b" ")?;
                    self.out.write_all(data.as_bytes())?;
                }
                self.out.write_all(b"?>")?;
            }
        }
        Ok(())
    }

    fn start_element(&mut self, data: &StartElementData) -> Result<()> {
        self.out.write_all(b"<")?;
        self.out.write_all(data.name.qualified().as_bytes())?;
        for decl in &data.namespaces {
            if decl.prefix.is_empty() {
                self.out.write_all(b" xmlns=\"")?;
            } else {
                self.out.write_all(b" xmlns:")?;
                self.out.write_all(decl.prefix.as_bytes())?;
                self.out.write_all(b"=\"")?;
            }
            escape::write_attr_value(&mut *self.out, &decl.uri)?;
            self.out.write_all(b"\"")?;
        }
        for attr in &data.attributes {
            self.out.write_all(b" ")?;
            self.out.write_all(attr.name.qualified().as_bytes())?;
            self.out.write_all(b"=\"")?;
            escape::write_attr_value(&mut *self.out, &attr.value)?;
            self.out.write_all(b"\"")?;
        }
        self.out.write_all(b">")?;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Serialize a subtree to a standalone string, re-declaring the inherited
/// namespace bindings on the apex so the result parses on its own.
pub fn serialize_fragment(
    events: &[XmlSecEvent],
    inherited_ns: &BTreeMap<String, String>,
) -> Result<String> {
    let mut bytes: Vec<u8> = Vec::new();
    {
        let mut writer = EventWriter::new(Box::new(&mut bytes));
        let mut first_element = true;
        for ev in events {
            if first_element {
                if let XmlSecEvent::StartElement(data) = ev {
                    let mut data = data.clone();
                    let declared: Vec<String> =
                        data.namespaces.iter().map(|d| d.prefix.clone()).collect();
                    for (prefix, uri) in inherited_ns {
                        if prefix == "xml" || declared.contains(prefix) {
                            continue;
                        }
                        data.namespaces.push(NsDecl::new(prefix, uri));
                    }
                    writer.event(&XmlSecEvent::StartElement(data))?;
                    first_element = false;
                    continue;
                }
            }
            writer.event(ev)?;
        }
        writer.finish()?;
    }
    String::from_utf8(bytes).map_err(|e| forsmark_core::Error::XmlStructure(e.to_string()))
}
