#![forbid(unsafe_code)]

//! Pull-parser adapter: turns XML text into [`XmlSecEvent`] sequences.
//!
//! The engine itself consumes events from any source; this adapter exists
//! so callers (and the decryption processor, which re-parses plaintext)
//! can feed documents in directly. Element paths are derived from the
//! parse stack rather than stored on every node.

use forsmark_core::{Attribute, Error, NsDecl, QName, Result, StartElementData, XmlSecEvent};
use std::collections::BTreeMap;

fn parsing_options() -> roxmltree::ParsingOptions {
    roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    }
}

/// Parse a complete document into events, including the document
/// boundaries.
pub fn events_from_str(xml: &str) -> Result<Vec<XmlSecEvent>> {
    let doc = roxmltree::Document::parse_with_options(xml, parsing_options())
        .map_err(|e| Error::XmlParse(e.to_string()))?;

    let mut events = vec![XmlSecEvent::StartDocument];
    let mut path: Vec<QName> = Vec::new();
    for child in doc.root().children() {
        walk(child, &mut events, &mut path, &BTreeMap::new())?;
    }
    events.push(XmlSecEvent::EndDocument);
    Ok(events)
}

/// Parse an XML fragment with inherited namespace bindings, returning the
/// fragment's events without document boundaries. Element paths are rooted
/// at `base_path`.
pub fn events_from_fragment(
    fragment: &str,
    inherited_ns: &BTreeMap<String, String>,
    base_path: &[QName],
) -> Result<Vec<XmlSecEvent>> {
    // Wrap the fragment in a synthetic element carrying the inherited
    // bindings so prefixes declared on ancestors resolve.
    let mut wrapper = String::from("<forsmark-fragment-wrapper");
    for (prefix, uri) in inherited_ns {
        if prefix == "xml" {
            continue;
        }
        if prefix.is_empty() {
            wrapper.push_str(&format!(" xmlns=\"{uri}\""));
        } else {
            wrapper.push_str(&format!(" xmlns:{prefix}=\"{uri}\""));
        }
    }
    wrapper.push('>');
    wrapper.push_str(fragment);
    wrapper.push_str("</forsmark-fragment-wrapper>");

    let doc = roxmltree::Document::parse_with_options(&wrapper, parsing_options())
        .map_err(|e| Error::XmlParse(e.to_string()))?;

    let root = doc.root_element();
    let mut events = Vec::new();
    let mut path: Vec<QName> = base_path.to_vec();
    let wrapper_ns: BTreeMap<String, String> = inscope_namespaces(root);
    for child in root.children() {
        walk(child, &mut events, &mut path, &wrapper_ns)?;
    }
    Ok(events)
}

fn inscope_namespaces(node: roxmltree::Node<'_, '_>) -> BTreeMap<String, String> {
    node.namespaces()
        .map(|ns| (ns.name().unwrap_or("").to_owned(), ns.uri().to_owned()))
        .collect()
}

fn walk(
    node: roxmltree::Node<'_, '_>,
    events: &mut Vec<XmlSecEvent>,
    path: &mut Vec<QName>,
    parent_ns: &BTreeMap<String, String>,
) -> Result<()> {
    match node.node_type() {
        roxmltree::NodeType::Element => {
            let name = QName::with_prefix(
                node.tag_name().namespace().unwrap_or(""),
                node.tag_name().name(),
                node.tag_name()
                    .namespace()
                    .and_then(|uri| node.lookup_prefix(uri))
                    .unwrap_or(""),
            );

            // Declarations on this element: the difference between its
            // in-scope bindings and the parent's.
            let own_ns = inscope_namespaces(node);
            let mut namespaces: Vec<NsDecl> = Vec::new();
            for (prefix, uri) in &own_ns {
                if prefix == "xml" {
                    continue;
                }
                if parent_ns.get(prefix) != Some(uri) {
                    namespaces.push(NsDecl::new(prefix, uri));
                }
            }
            for prefix in parent_ns.keys() {
                if prefix != "xml" && !own_ns.contains_key(prefix) {
                    namespaces.push(NsDecl::new(prefix, ""));
                }
            }

            let attributes: Vec<Attribute> = node
                .attributes()
                .map(|a| {
                    Attribute::new(
                        QName::with_prefix(
                            a.namespace().unwrap_or(""),
                            a.name(),
                            a.namespace()
                                .and_then(|uri| node.lookup_prefix(uri))
                                .unwrap_or(""),
                        ),
                        a.value(),
                    )
                })
                .collect();

            path.push(name.clone());
            events.push(XmlSecEvent::StartElement(StartElementData {
                name: name.clone(),
                attributes,
                namespaces,
                element_path: path.clone(),
            }));
            for child in node.children() {
                walk(child, events, path, &own_ns)?;
            }
            path.pop();
            events.push(XmlSecEvent::EndElement { name });
        }
        roxmltree::NodeType::Text => {
            if let Some(text) = node.text() {
                events.push(XmlSecEvent::Characters {
                    text: text.to_owned(),
                });
            }
        }
        roxmltree::NodeType::Comment => {
            events.push(XmlSecEvent::Comment {
                text: node.text().unwrap_or("").to_owned(),
            });
        }
        roxmltree::NodeType::PI => {
            events.push(XmlSecEvent::ProcessingInstruction {
                target: node.tag_name().name().to_owned(),
                data: node.text().unwrap_or("").to_owned(),
            });
        }
        roxmltree::NodeType::Root => {}
    }
    Ok(())
}
