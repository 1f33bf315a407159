#![forbid(unsafe_code)]

//! Plain data records for the XML-DSig / XML-Enc structures the pipeline
//! consumes, parsed from buffered event slices.

use forsmark_core::{ns, Attribute, Error, NsDecl, QName, Result, XmlSecEvent};
use std::collections::BTreeMap;

/// Generate a document-unique id for elements that carry none.
pub fn generate_id() -> String {
    format!("F-{:016x}", rand::random::<u64>())
}

/// Decode base64 text, ignoring embedded whitespace.
pub fn decode_b64(text: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    let clean: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(clean)
        .map_err(|e| Error::Base64(e.to_string()))
}

pub fn encode_b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransformRecord {
    pub uri: String,
    /// InclusiveNamespaces PrefixList for exclusive canonicalization.
    pub inclusive_prefixes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReferenceRecord {
    /// Generated when the element carries no Id.
    pub id: String,
    pub uri: Option<String>,
    pub type_uri: Option<String>,
    pub digest_uri: String,
    pub digest_value: Vec<u8>,
    pub transforms: Vec<TransformRecord>,
}

#[derive(Debug, Clone)]
pub struct SignedInfoRecord {
    pub c14n_uri: String,
    pub c14n_prefixes: Vec<String>,
    pub signature_uri: String,
    /// Order is significant: the reported reference index equals the
    /// sequence index.
    pub references: Vec<ReferenceRecord>,
}

#[derive(Debug, Clone)]
pub struct KeyInfoRecord {
    pub key_name: Option<String>,
    /// DER certificate octets from X509Data.
    pub certificates: Vec<Vec<u8>>,
    pub retrieval_uri: Option<String>,
    pub encrypted_key: Option<Box<EncryptedKeyRecord>>,
}

#[derive(Debug, Clone)]
pub struct SignatureRecord {
    pub id: String,
    pub signed_info: SignedInfoRecord,
    pub signature_value: Vec<u8>,
    pub key_info: Option<KeyInfoRecord>,
    /// Namespace bindings in scope at the Signature element, for
    /// canonicalizing SignedInfo on its own.
    pub inscope_ns: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EncryptedKeyRecord {
    pub id: String,
    pub method_uri: String,
    pub oaep_digest_uri: Option<String>,
    pub oaep_mgf_uri: Option<String>,
    pub oaep_p_source: Option<Vec<u8>>,
    pub key_info: Option<KeyInfoRecord>,
    pub cipher_value: Vec<u8>,
    /// DataReference / KeyReference URIs for propagation.
    pub reference_uris: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EncryptedDataRecord {
    pub id: Option<String>,
    pub type_uri: Option<String>,
    pub method_uri: String,
    pub key_info: Option<KeyInfoRecord>,
    pub cipher_value: Vec<u8>,
}

// ── Event-slice tree ─────────────────────────────────────────────────

/// A buffered element subtree, materialized only for the small security
/// structures (Signature, EncryptedKey, EncryptedData headers).
#[derive(Debug)]
pub struct ElementTree {
    pub name: QName,
    pub attributes: Vec<Attribute>,
    pub namespaces: Vec<NsDecl>,
    pub children: Vec<TreeNode>,
}

#[derive(Debug)]
pub enum TreeNode {
    Element(ElementTree),
    Text(String),
}

impl ElementTree {
    /// Build from a subtree slice: the first event must be the start
    /// element, the last its matching end element.
    pub fn from_events(events: &[XmlSecEvent]) -> Result<ElementTree> {
        let mut iter = events.iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::XmlStructure("empty event slice".into()))?;
        let XmlSecEvent::StartElement(data) = first else {
            return Err(Error::XmlStructure(
                "event slice does not begin with a start element".into(),
            ));
        };
        let mut stack: Vec<ElementTree> = vec![ElementTree {
            name: data.name.clone(),
            attributes: data.attributes.clone(),
            namespaces: data.namespaces.clone(),
            children: Vec::new(),
        }];
        for ev in iter {
            match ev {
                XmlSecEvent::StartElement(data) => {
                    stack.push(ElementTree {
                        name: data.name.clone(),
                        attributes: data.attributes.clone(),
                        namespaces: data.namespaces.clone(),
                        children: Vec::new(),
                    });
                }
                XmlSecEvent::EndElement { .. } => {
                    let done = stack
                        .pop()
                        .ok_or_else(|| Error::XmlStructure("unbalanced end element".into()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(TreeNode::Element(done)),
                        None => return Ok(done),
                    }
                }
                XmlSecEvent::Characters { text } => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(TreeNode::Text(text.clone()));
                    }
                }
                _ => {}
            }
        }
        Err(Error::XmlStructure("unterminated element subtree".into()))
    }

    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.namespace_uri.is_empty() && a.name.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    pub fn child(&self, ns_uri: &str, local_name: &str) -> Option<&ElementTree> {
        self.children.iter().find_map(|c| match c {
            TreeNode::Element(e)
                if e.name.namespace_uri == ns_uri && e.name.local_name == local_name =>
            {
                Some(e)
            }
            _ => None,
        })
    }

    pub fn children_named(&self, ns_uri: &str, local_name: &str) -> Vec<&ElementTree> {
        self.children
            .iter()
            .filter_map(|c| match c {
                TreeNode::Element(e)
                    if e.name.namespace_uri == ns_uri && e.name.local_name == local_name =>
                {
                    Some(e)
                }
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content of direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                TreeNode::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ── Parsers ──────────────────────────────────────────────────────────

fn required_algorithm(tree: &ElementTree, what: &str) -> Result<String> {
    tree.attribute(ns::attr::ALGORITHM)
        .map(str::to_owned)
        .ok_or_else(|| Error::MissingAttribute(format!("Algorithm on {what}")))
}

fn inclusive_prefixes(tree: &ElementTree) -> Vec<String> {
    for child in &tree.children {
        if let TreeNode::Element(e) = child {
            if e.name.local_name == ns::node::INCLUSIVE_NAMESPACES {
                if let Some(list) = e.attribute(ns::attr::PREFIX_LIST) {
                    return list.split_whitespace().map(str::to_owned).collect();
                }
            }
        }
    }
    Vec::new()
}

/// Parse a buffered `ds:Signature` subtree.
pub fn parse_signature(
    events: &[XmlSecEvent],
    inscope_ns: BTreeMap<String, String>,
) -> Result<SignatureRecord> {
    let tree = ElementTree::from_events(events)?;

    let signed_info_tree = tree
        .child(ns::DSIG, ns::node::SIGNED_INFO)
        .ok_or_else(|| Error::MissingElement(ns::node::SIGNED_INFO.into()))?;

    let c14n_tree = signed_info_tree
        .child(ns::DSIG, ns::node::CANONICALIZATION_METHOD)
        .ok_or_else(|| Error::MissingElement(ns::node::CANONICALIZATION_METHOD.into()))?;
    let sig_method_tree = signed_info_tree
        .child(ns::DSIG, ns::node::SIGNATURE_METHOD)
        .ok_or_else(|| Error::MissingElement(ns::node::SIGNATURE_METHOD.into()))?;

    let mut references = Vec::new();
    for ref_tree in signed_info_tree.children_named(ns::DSIG, ns::node::REFERENCE) {
        references.push(parse_reference(ref_tree)?);
    }

    let signature_value = decode_b64(
        &tree
            .child(ns::DSIG, ns::node::SIGNATURE_VALUE)
            .ok_or_else(|| Error::MissingElement(ns::node::SIGNATURE_VALUE.into()))?
            .text(),
    )?;

    let key_info = tree
        .child(ns::DSIG, ns::node::KEY_INFO)
        .map(parse_key_info)
        .transpose()?;

    Ok(SignatureRecord {
        id: tree
            .attribute(ns::attr::ID)
            .map(str::to_owned)
            .unwrap_or_else(generate_id),
        signed_info: SignedInfoRecord {
            c14n_uri: required_algorithm(c14n_tree, ns::node::CANONICALIZATION_METHOD)?,
            c14n_prefixes: inclusive_prefixes(c14n_tree),
            signature_uri: required_algorithm(sig_method_tree, ns::node::SIGNATURE_METHOD)?,
            references,
        },
        signature_value,
        key_info,
        inscope_ns,
    })
}

fn parse_reference(tree: &ElementTree) -> Result<ReferenceRecord> {
    let digest_method = tree
        .child(ns::DSIG, ns::node::DIGEST_METHOD)
        .ok_or_else(|| Error::MissingElement(ns::node::DIGEST_METHOD.into()))?;
    let digest_value = decode_b64(
        &tree
            .child(ns::DSIG, ns::node::DIGEST_VALUE)
            .ok_or_else(|| Error::MissingElement(ns::node::DIGEST_VALUE.into()))?
            .text(),
    )?;

    let mut transforms = Vec::new();
    if let Some(transforms_tree) = tree.child(ns::DSIG, ns::node::TRANSFORMS) {
        for t in transforms_tree.children_named(ns::DSIG, ns::node::TRANSFORM) {
            transforms.push(TransformRecord {
                uri: required_algorithm(t, ns::node::TRANSFORM)?,
                inclusive_prefixes: inclusive_prefixes(t),
            });
        }
    }

    Ok(ReferenceRecord {
        id: tree
            .attribute(ns::attr::ID)
            .map(str::to_owned)
            .unwrap_or_else(generate_id),
        uri: tree.attribute(ns::attr::URI).map(str::to_owned),
        type_uri: tree.attribute(ns::attr::TYPE).map(str::to_owned),
        digest_uri: required_algorithm(digest_method, ns::node::DIGEST_METHOD)?,
        digest_value,
        transforms,
    })
}

pub fn parse_key_info(tree: &ElementTree) -> Result<KeyInfoRecord> {
    let key_name = tree
        .child(ns::DSIG, ns::node::KEY_NAME)
        .map(|t| t.text().trim().to_owned());

    let mut certificates = Vec::new();
    if let Some(x509_data) = tree.child(ns::DSIG, ns::node::X509_DATA) {
        for cert in x509_data.children_named(ns::DSIG, ns::node::X509_CERTIFICATE) {
            certificates.push(decode_b64(&cert.text())?);
        }
    }

    let retrieval_uri = tree
        .child(ns::DSIG, ns::node::RETRIEVAL_METHOD)
        .and_then(|t| t.attribute(ns::attr::URI))
        .map(str::to_owned);

    let encrypted_key = tree
        .child(ns::ENC, ns::node::ENCRYPTED_KEY)
        .map(parse_encrypted_key_tree)
        .transpose()?
        .map(Box::new);

    Ok(KeyInfoRecord {
        key_name,
        certificates,
        retrieval_uri,
        encrypted_key,
    })
}

/// Parse a buffered `xenc:EncryptedKey` subtree.
pub fn parse_encrypted_key(events: &[XmlSecEvent]) -> Result<EncryptedKeyRecord> {
    parse_encrypted_key_tree(&ElementTree::from_events(events)?)
}

pub fn parse_encrypted_key_tree(tree: &ElementTree) -> Result<EncryptedKeyRecord> {
    let method = tree
        .child(ns::ENC, ns::node::ENCRYPTION_METHOD)
        .ok_or_else(|| Error::MissingElement("EncryptionMethod on EncryptedKey".into()))?;
    let method_uri = required_algorithm(method, ns::node::ENCRYPTION_METHOD)?;

    // RSA-OAEP parameters; DigestMethod may arrive in either namespace.
    let oaep_digest_uri = method
        .child(ns::DSIG, ns::node::DIGEST_METHOD)
        .or_else(|| method.child(ns::ENC, ns::node::DIGEST_METHOD))
        .and_then(|t| t.attribute(ns::attr::ALGORITHM))
        .map(str::to_owned);
    let oaep_mgf_uri = method
        .child(ns::ENC11, ns::node::RSA_MGF)
        .or_else(|| method.child(ns::ENC, ns::node::RSA_MGF))
        .and_then(|t| t.attribute(ns::attr::ALGORITHM))
        .map(str::to_owned);
    let oaep_p_source = method
        .child(ns::ENC, ns::node::RSA_OAEP_PARAMS)
        .map(|t| decode_b64(&t.text()))
        .transpose()?;

    let cipher_value = decode_b64(
        &tree
            .child(ns::ENC, ns::node::CIPHER_DATA)
            .and_then(|cd| cd.child(ns::ENC, ns::node::CIPHER_VALUE))
            .ok_or_else(|| Error::MissingElement("CipherValue on EncryptedKey".into()))?
            .text(),
    )?;

    let key_info = tree
        .child(ns::DSIG, ns::node::KEY_INFO)
        .map(parse_key_info)
        .transpose()?;

    let mut reference_uris = Vec::new();
    if let Some(list) = tree.child(ns::ENC, ns::node::REFERENCE_LIST) {
        for r in list.children_named(ns::ENC, ns::node::DATA_REFERENCE) {
            if let Some(uri) = r.attribute(ns::attr::URI) {
                reference_uris.push(uri.to_owned());
            }
        }
        for r in list.children_named(ns::ENC, ns::node::KEY_REFERENCE) {
            if let Some(uri) = r.attribute(ns::attr::URI) {
                reference_uris.push(uri.to_owned());
            }
        }
    }

    Ok(EncryptedKeyRecord {
        id: tree
            .attribute(ns::attr::ID)
            .map(str::to_owned)
            .unwrap_or_else(generate_id),
        method_uri,
        oaep_digest_uri,
        oaep_mgf_uri,
        oaep_p_source,
        key_info,
        cipher_value,
        reference_uris,
    })
}

/// Parse a buffered `xenc:EncryptedData` subtree.
pub fn parse_encrypted_data(events: &[XmlSecEvent]) -> Result<EncryptedDataRecord> {
    let tree = ElementTree::from_events(events)?;
    let method = tree
        .child(ns::ENC, ns::node::ENCRYPTION_METHOD)
        .ok_or_else(|| Error::MissingElement("EncryptionMethod on EncryptedData".into()))?;

    let cipher_value = decode_b64(
        &tree
            .child(ns::ENC, ns::node::CIPHER_DATA)
            .and_then(|cd| cd.child(ns::ENC, ns::node::CIPHER_VALUE))
            .ok_or_else(|| Error::MissingElement("CipherValue on EncryptedData".into()))?
            .text(),
    )?;

    Ok(EncryptedDataRecord {
        id: tree.attribute(ns::attr::ID).map(str::to_owned),
        type_uri: tree.attribute(ns::attr::TYPE).map(str::to_owned),
        method_uri: required_algorithm(method, ns::node::ENCRYPTION_METHOD)?,
        key_info: tree
            .child(ns::DSIG, ns::node::KEY_INFO)
            .map(parse_key_info)
            .transpose()?,
        cipher_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader;

    fn subtree(xml: &str) -> Vec<XmlSecEvent> {
        let events = reader::events_from_str(xml).unwrap();
        events[1..events.len() - 1].to_vec()
    }

    #[test]
    fn test_parse_signature_structure() {
        let xml = r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="sig1">
  <ds:SignedInfo>
    <ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>
    <ds:SignatureMethod Algorithm="http://www.w3.org/2000/09/xmldsig#hmac-sha1"/>
    <ds:Reference URI="#data">
      <ds:Transforms>
        <ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#">
          <ec:InclusiveNamespaces xmlns:ec="http://www.w3.org/2001/10/xml-exc-c14n#" PrefixList="a b"/>
        </ds:Transform>
      </ds:Transforms>
      <ds:DigestMethod Algorithm="http://www.w3.org/2000/09/xmldsig#sha1"/>
      <ds:DigestValue>qZk+NkcGgWq6PiVxeFDCbJzQ2J0=</ds:DigestValue>
    </ds:Reference>
  </ds:SignedInfo>
  <ds:SignatureValue>AAEC</ds:SignatureValue>
  <ds:KeyInfo><ds:KeyName>hmac</ds:KeyName></ds:KeyInfo>
</ds:Signature>"##;
        let record = parse_signature(&subtree(xml), BTreeMap::new()).unwrap();
        assert_eq!(record.id, "sig1");
        assert_eq!(
            record.signed_info.c14n_uri,
            "http://www.w3.org/2001/10/xml-exc-c14n#"
        );
        assert_eq!(record.signed_info.references.len(), 1);
        let reference = &record.signed_info.references[0];
        assert_eq!(reference.uri.as_deref(), Some("#data"));
        assert_eq!(reference.digest_value.len(), 20);
        assert_eq!(reference.transforms.len(), 1);
        assert_eq!(reference.transforms[0].inclusive_prefixes, vec!["a", "b"]);
        assert_eq!(record.signature_value, vec![0, 1, 2]);
        assert_eq!(
            record.key_info.unwrap().key_name.as_deref(),
            Some("hmac")
        );
    }

    #[test]
    fn test_parse_signature_generates_reference_id() {
        let xml = r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
  <ds:SignedInfo>
    <ds:CanonicalizationMethod Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"/>
    <ds:SignatureMethod Algorithm="http://www.w3.org/2000/09/xmldsig#hmac-sha1"/>
    <ds:Reference URI="#x">
      <ds:DigestMethod Algorithm="http://www.w3.org/2000/09/xmldsig#sha1"/>
      <ds:DigestValue>AAA=</ds:DigestValue>
    </ds:Reference>
  </ds:SignedInfo>
  <ds:SignatureValue>AAA=</ds:SignatureValue>
</ds:Signature>"##;
        let record = parse_signature(&subtree(xml), BTreeMap::new()).unwrap();
        assert!(!record.id.is_empty());
        assert!(!record.signed_info.references[0].id.is_empty());
    }

    #[test]
    fn test_parse_encrypted_key_with_oaep_params() {
        let xml = r##"<xenc:EncryptedKey xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" Id="ek1">
  <xenc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p">
    <ds:DigestMethod xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>
  </xenc:EncryptionMethod>
  <xenc:CipherData><xenc:CipherValue>AAECAw==</xenc:CipherValue></xenc:CipherData>
  <xenc:ReferenceList><xenc:DataReference URI="#ed1"/></xenc:ReferenceList>
</xenc:EncryptedKey>"##;
        let record = parse_encrypted_key(&subtree(xml)).unwrap();
        assert_eq!(record.id, "ek1");
        assert_eq!(
            record.method_uri,
            "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p"
        );
        assert_eq!(
            record.oaep_digest_uri.as_deref(),
            Some("http://www.w3.org/2001/04/xmlenc#sha256")
        );
        assert_eq!(record.oaep_mgf_uri, None);
        assert_eq!(record.cipher_value, vec![0, 1, 2, 3]);
        assert_eq!(record.reference_uris, vec!["#ed1"]);
    }

    #[test]
    fn test_encrypted_key_requires_method() {
        let xml = r#"<xenc:EncryptedKey xmlns:xenc="http://www.w3.org/2001/04/xmlenc#">
  <xenc:CipherData><xenc:CipherValue>AAA=</xenc:CipherValue></xenc:CipherData>
</xenc:EncryptedKey>"#;
        assert!(matches!(
            parse_encrypted_key(&subtree(xml)).unwrap_err(),
            Error::MissingElement(_)
        ));
    }

    #[test]
    fn test_parse_encrypted_data() {
        let xml = r#"<xenc:EncryptedData xmlns:xenc="http://www.w3.org/2001/04/xmlenc#" Id="ed1"
    Type="http://www.w3.org/2001/04/xmlenc#Element">
  <xenc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes256-cbc"/>
  <xenc:CipherData><xenc:CipherValue>/u36zt6tFYA=</xenc:CipherValue></xenc:CipherData>
</xenc:EncryptedData>"#;
        let record = parse_encrypted_data(&subtree(xml)).unwrap();
        assert_eq!(record.id.as_deref(), Some("ed1"));
        assert_eq!(
            record.type_uri.as_deref(),
            Some("http://www.w3.org/2001/04/xmlenc#Element")
        );
        assert_eq!(record.cipher_value.len(), 8);
    }
}
