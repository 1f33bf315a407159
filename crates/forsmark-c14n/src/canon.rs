#![forbid(unsafe_code)]

//! Event-driven canonicalizer.
//!
//! Receives one [`XmlSecEvent`] at a time and writes the canonical form to
//! an `io::Write` sink. The namespace context of ancestors outside the
//! canonicalized subtree is supplied up front, so a same-document reference
//! can be canonicalized while the surrounding document is still streaming.

use crate::{escape, C14nMode};
use forsmark_core::{Attribute, Error, NsDecl, Result, StartElementData, XmlSecEvent};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;

/// Streaming canonicalizer for one event subtree or document.
pub struct EventCanonicalizer {
    mode: C14nMode,
    inclusive_prefixes: HashSet<String>,
    out: Box<dyn Write>,
    /// In-scope prefix → URI after each open element; slot 0 is the
    /// inherited context of the subtree's ancestors.
    inscope: Vec<BTreeMap<String, String>>,
    /// Prefix → URI as rendered on open output elements.
    rendered: Vec<BTreeMap<String, String>>,
    /// Qualified names of open elements, for end tags.
    open: Vec<String>,
    /// Inherited `xml:*` attributes, emitted on the apex in inclusive mode.
    inherited_xml_attrs: Vec<Attribute>,
    seen_apex: bool,
    past_root: bool,
}

impl EventCanonicalizer {
    pub fn new(mode: C14nMode, out: Box<dyn Write>, inclusive_prefixes: Vec<String>) -> Self {
        Self::with_inherited(mode, out, inclusive_prefixes, BTreeMap::new(), Vec::new())
    }

    /// Create a canonicalizer seeded with the namespace and `xml:*`
    /// attribute context of the subtree's ancestors.
    pub fn with_inherited(
        mode: C14nMode,
        out: Box<dyn Write>,
        inclusive_prefixes: Vec<String>,
        inherited_ns: BTreeMap<String, String>,
        inherited_xml_attrs: Vec<Attribute>,
    ) -> Self {
        Self {
            mode,
            inclusive_prefixes: inclusive_prefixes.into_iter().collect(),
            out,
            inscope: vec![inherited_ns],
            rendered: vec![BTreeMap::new()],
            open: Vec::new(),
            inherited_xml_attrs,
            seen_apex: false,
            past_root: false,
        }
    }

    /// Feed one event.
    pub fn event(&mut self, ev: &XmlSecEvent) -> Result<()> {
        match ev {
            XmlSecEvent::StartDocument | XmlSecEvent::EndDocument => Ok(()),
            XmlSecEvent::StartElement(data) => self.start_element(data),
            XmlSecEvent::EndElement { .. } => self.end_element(),
            XmlSecEvent::Characters { text } => {
                escape::write_text(&mut *self.out, text)?;
                Ok(())
            }
            XmlSecEvent::Comment { text } => self.comment(text),
            XmlSecEvent::ProcessingInstruction { target, data } => self.pi(target, data),
        }
    }

    /// Flush the sink after the last event.
    pub fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn start_element(&mut self, data: &StartElementData) -> Result<()> {
        // Merge this element's declarations into the in-scope context.
        let mut inscope = self.inscope.last().cloned().unwrap_or_default();
        for decl in &data.namespaces {
            if decl.uri.is_empty() {
                inscope.remove(&decl.prefix);
            } else {
                inscope.insert(decl.prefix.clone(), decl.uri.clone());
            }
        }

        let rendered = self.rendered.last().cloned().unwrap_or_default();
        let is_apex = !self.seen_apex;
        self.seen_apex = true;

        let ns_decls = if self.mode.is_exclusive() {
            self.exclusive_ns_decls(data, &inscope, &rendered)
        } else {
            self.inclusive_ns_decls(&inscope, &rendered, is_apex)
        };

        // Attribute list; the apex of an inclusive subtree inherits the
        // ancestors' xml:* attributes it does not override.
        let mut attrs: Vec<Attribute> = Vec::new();
        if is_apex && !self.mode.is_exclusive() {
            for inherited in &self.inherited_xml_attrs {
                let overridden = data
                    .attributes
                    .iter()
                    .any(|a| a.name == inherited.name);
                if !overridden {
                    attrs.push(inherited.clone());
                }
            }
        }
        attrs.extend(data.attributes.iter().cloned());
        attrs.sort_by(attr_order);

        let qname = data.name.qualified();
        self.out.write_all(b"<")?;
        self.out.write_all(qname.as_bytes())?;
        for decl in &ns_decls {
            self.write_ns_decl(decl)?;
        }
        for attr in &attrs {
            self.write_attribute(attr)?;
        }
        self.out.write_all(b">")?;

        let mut child_rendered = rendered;
        for decl in &ns_decls {
            child_rendered.insert(decl.prefix.clone(), decl.uri.clone());
        }
        self.inscope.push(inscope);
        self.rendered.push(child_rendered);
        self.open.push(qname);
        Ok(())
    }

    fn end_element(&mut self) -> Result<()> {
        let qname = self
            .open
            .pop()
            .ok_or_else(|| Error::XmlStructure("unbalanced end element".into()))?;
        self.inscope.pop();
        self.rendered.pop();
        self.out.write_all(b"</")?;
        self.out.write_all(qname.as_bytes())?;
        self.out.write_all(b">")?;
        if self.open.is_empty() {
            self.past_root = true;
        }
        Ok(())
    }

    /// Namespace declarations to render in inclusive (Canonical XML 1.0)
    /// mode: every in-scope binding whose value differs from what an output
    /// ancestor rendered. At the apex that is the full namespace axis.
    fn inclusive_ns_decls(
        &self,
        inscope: &BTreeMap<String, String>,
        rendered: &BTreeMap<String, String>,
        _is_apex: bool,
    ) -> Vec<NsDecl> {
        let mut decls: Vec<NsDecl> = Vec::new();
        for (prefix, uri) in inscope {
            if prefix == "xml" {
                continue;
            }
            if rendered.get(prefix) != Some(uri) {
                decls.push(NsDecl::new(prefix, uri));
            }
        }
        // Default namespace un-declaration.
        if !inscope.contains_key("") {
            if let Some(prev) = rendered.get("") {
                if !prev.is_empty() {
                    decls.push(NsDecl::new("", ""));
                }
            }
        }
        decls.sort_by(ns_order);
        decls
    }

    /// Namespace declarations to render in exclusive mode: only visibly
    /// utilized prefixes plus the InclusiveNamespaces prefix list.
    fn exclusive_ns_decls(
        &self,
        data: &StartElementData,
        inscope: &BTreeMap<String, String>,
        rendered: &BTreeMap<String, String>,
    ) -> Vec<NsDecl> {
        let mut utilized: HashSet<String> = HashSet::new();
        utilized.insert(data.name.prefix.clone());
        for attr in &data.attributes {
            if !attr.name.namespace_uri.is_empty() && !attr.name.prefix.is_empty() {
                utilized.insert(attr.name.prefix.clone());
            }
        }
        for p in &self.inclusive_prefixes {
            if p == "#default" {
                utilized.insert(String::new());
            } else {
                utilized.insert(p.clone());
            }
        }

        let mut decls: Vec<NsDecl> = Vec::new();
        for prefix in &utilized {
            if prefix == "xml" {
                continue;
            }
            match inscope.get(prefix) {
                Some(uri) => {
                    if rendered.get(prefix) != Some(uri) {
                        decls.push(NsDecl::new(prefix, uri));
                    }
                }
                None => {
                    if prefix.is_empty() {
                        if let Some(prev) = rendered.get("") {
                            if !prev.is_empty() {
                                decls.push(NsDecl::new("", ""));
                            }
                        }
                    }
                }
            }
        }
        decls.sort_by(ns_order);
        decls
    }

    fn write_ns_decl(&mut self, decl: &NsDecl) -> Result<()> {
        if decl.prefix.is_empty() {
            self.out.write_all(b" xmlns=\"")?;
        } else {
            self.out.write_all(b" xmlns:")?;
            self.out.write_all(decl.prefix.as_bytes())?;
            self.out.write_all(b"=\"")?;
        }
        escape::write_attr_value(&mut *self.out, &decl.uri)?;
        self.out.write_all(b"\"")?;
        Ok(())
    }

    fn write_attribute(&mut self, attr: &Attribute) -> Result<()> {
        self.out.write_all(b" ")?;
        self.out.write_all(attr.name.qualified().as_bytes())?;
        self.out.write_all(b"=\"")?;
        escape::write_attr_value(&mut *self.out, &attr.value)?;
        self.out.write_all(b"\"")?;
        Ok(())
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        if !self.mode.with_comments() {
            return Ok(());
        }
        let at_document_level = self.open.is_empty();
        if at_document_level && self.past_root {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(b"<!--")?;
        self.out.write_all(text.as_bytes())?;
        self.out.write_all(b"-->")?;
        if at_document_level && !self.past_root {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn pi(&mut self, target: &str, data: &str) -> Result<()> {
        let at_document_level = self.open.is_empty();
        if at_document_level && self.past_root {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(b"<?")?;
        self.out.write_all(target.as_bytes())?;
        if !data.is_empty() {
            self.out.write_all(b" ")?;
            escape::write_pi_data(&mut *self.out, data)?;
        }
        self.out.write_all(b"?>")?;
        if at_document_level && !self.past_root {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Namespace declarations sort by prefix, the default namespace first.
fn ns_order(a: &NsDecl, b: &NsDecl) -> std::cmp::Ordering {
    match (a.prefix.is_empty(), b.prefix.is_empty()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.prefix.cmp(&b.prefix),
    }
}

/// Attributes sort with unqualified names first (by local name), then by
/// (namespace URI, local name).
fn attr_order(a: &Attribute, b: &Attribute) -> std::cmp::Ordering {
    match (
        a.name.namespace_uri.is_empty(),
        b.name.namespace_uri.is_empty(),
    ) {
        (true, true) => a.name.local_name.cmp(&b.name.local_name),
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (false, false) => a
            .name
            .namespace_uri
            .cmp(&b.name.namespace_uri)
            .then(a.name.local_name.cmp(&b.name.local_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forsmark_core::QName;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A Vec<u8> sink shared with the test after the canonicalizer owns it.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn canonicalize(mode: C14nMode, events: &[XmlSecEvent]) -> String {
        let buf = SharedBuf::default();
        let mut c14n = EventCanonicalizer::new(mode, Box::new(buf.clone()), Vec::new());
        for ev in events {
            c14n.event(ev).unwrap();
        }
        c14n.finish().unwrap();
        let bytes = buf.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn elem(ns_uri: &str, local: &str, prefix: &str) -> QName {
        QName::with_prefix(ns_uri, local, prefix)
    }

    #[test]
    fn test_simple_element() {
        let events = vec![
            XmlSecEvent::start_element(elem("", "doc", ""), vec![], vec![]),
            XmlSecEvent::characters("hi"),
            XmlSecEvent::end_element(elem("", "doc", "")),
        ];
        assert_eq!(canonicalize(C14nMode::Inclusive, &events), "<doc>hi</doc>");
    }

    #[test]
    fn test_attribute_sorting() {
        let events = vec![
            XmlSecEvent::start_element(
                elem("", "e", ""),
                vec![
                    Attribute::new(QName::new("", "b"), "2"),
                    Attribute::new(QName::new("", "a"), "1"),
                ],
                vec![],
            ),
            XmlSecEvent::end_element(elem("", "e", "")),
        ];
        assert_eq!(
            canonicalize(C14nMode::Inclusive, &events),
            "<e a=\"1\" b=\"2\"></e>"
        );
    }

    #[test]
    fn test_namespace_rendering_inclusive() {
        let events = vec![
            XmlSecEvent::start_element(
                elem("urn:a", "root", "a"),
                vec![],
                vec![NsDecl::new("a", "urn:a"), NsDecl::new("b", "urn:b")],
            ),
            XmlSecEvent::start_element(elem("urn:b", "child", "b"), vec![], vec![]),
            XmlSecEvent::end_element(elem("urn:b", "child", "b")),
            XmlSecEvent::end_element(elem("urn:a", "root", "a")),
        ];
        // Both declarations render on the apex, nothing re-renders below.
        assert_eq!(
            canonicalize(C14nMode::Inclusive, &events),
            "<a:root xmlns:a=\"urn:a\" xmlns:b=\"urn:b\"><b:child></b:child></a:root>"
        );
    }

    #[test]
    fn test_namespace_rendering_exclusive() {
        let events = vec![
            XmlSecEvent::start_element(
                elem("urn:a", "root", "a"),
                vec![],
                vec![NsDecl::new("a", "urn:a"), NsDecl::new("b", "urn:b")],
            ),
            XmlSecEvent::start_element(elem("urn:b", "child", "b"), vec![], vec![]),
            XmlSecEvent::end_element(elem("urn:b", "child", "b")),
            XmlSecEvent::end_element(elem("urn:a", "root", "a")),
        ];
        // Only visibly utilized prefixes render, where first utilized.
        assert_eq!(
            canonicalize(C14nMode::Exclusive, &events),
            "<a:root xmlns:a=\"urn:a\"><b:child xmlns:b=\"urn:b\"></b:child></a:root>"
        );
    }

    #[test]
    fn test_exclusive_prefix_list() {
        let buf = SharedBuf::default();
        let mut c14n = EventCanonicalizer::new(
            C14nMode::Exclusive,
            Box::new(buf.clone()),
            vec!["b".to_owned()],
        );
        let events = vec![
            XmlSecEvent::start_element(
                elem("urn:a", "root", "a"),
                vec![],
                vec![NsDecl::new("a", "urn:a"), NsDecl::new("b", "urn:b")],
            ),
            XmlSecEvent::end_element(elem("urn:a", "root", "a")),
        ];
        for ev in &events {
            c14n.event(ev).unwrap();
        }
        c14n.finish().unwrap();
        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(text, "<a:root xmlns:a=\"urn:a\" xmlns:b=\"urn:b\"></a:root>");
    }

    #[test]
    fn test_inherited_namespace_context() {
        // A subtree canonicalized with an inherited default namespace
        // re-declares it on the apex in inclusive mode.
        let buf = SharedBuf::default();
        let mut inherited = BTreeMap::new();
        inherited.insert(String::new(), "urn:doc".to_owned());
        let mut c14n = EventCanonicalizer::with_inherited(
            C14nMode::Inclusive,
            Box::new(buf.clone()),
            Vec::new(),
            inherited,
            Vec::new(),
        );
        c14n.event(&XmlSecEvent::start_element(
            elem("urn:doc", "part", ""),
            vec![],
            vec![],
        ))
        .unwrap();
        c14n.event(&XmlSecEvent::end_element(elem("urn:doc", "part", "")))
            .unwrap();
        c14n.finish().unwrap();
        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert_eq!(text, "<part xmlns=\"urn:doc\"></part>");
    }

    #[test]
    fn test_comments_mode() {
        let events = vec![
            XmlSecEvent::start_element(elem("", "doc", ""), vec![], vec![]),
            XmlSecEvent::Comment {
                text: " c ".to_owned(),
            },
            XmlSecEvent::end_element(elem("", "doc", "")),
        ];
        assert_eq!(canonicalize(C14nMode::Inclusive, &events), "<doc></doc>");
        assert_eq!(
            canonicalize(C14nMode::InclusiveWithComments, &events),
            "<doc><!-- c --></doc>"
        );
    }

    #[test]
    fn test_document_level_comment_separators() {
        let events = vec![
            XmlSecEvent::Comment {
                text: "pre".to_owned(),
            },
            XmlSecEvent::start_element(elem("", "doc", ""), vec![], vec![]),
            XmlSecEvent::end_element(elem("", "doc", "")),
            XmlSecEvent::Comment {
                text: "post".to_owned(),
            },
        ];
        assert_eq!(
            canonicalize(C14nMode::InclusiveWithComments, &events),
            "<!--pre-->\n<doc></doc>\n<!--post-->"
        );
    }

    #[test]
    fn test_text_escaping_in_canon() {
        let events = vec![
            XmlSecEvent::start_element(elem("", "d", ""), vec![], vec![]),
            XmlSecEvent::characters("a<b&c"),
            XmlSecEvent::end_element(elem("", "d", "")),
        ];
        assert_eq!(
            canonicalize(C14nMode::Inclusive, &events),
            "<d>a&lt;b&amp;c</d>"
        );
    }
}
