#![forbid(unsafe_code)]

//! Composable transforms terminating in a digest sink.
//!
//! Transforms compose in reverse declaration order: the first-declared
//! transform receives the reference's input (events for same-document
//! references, bytes for external ones) and the innermost stage writes
//! canonical bytes into the digest sink.

use crate::digest_sink::SharedDigestSink;
use crate::security_event::{KeyUsage, SecurityEvent};
use crate::structures::{ReferenceRecord, TransformRecord};
use crate::{context::SecurityContext, reader};
use forsmark_c14n::{C14nMode, EventCanonicalizer};
use forsmark_core::{algorithm, Attribute, Error, Result, XmlSecEvent};
use std::collections::BTreeMap;
use std::io::Write;

/// One stage of a transform chain.
pub trait Transformer {
    /// Feed a parse event.
    fn event(&mut self, ev: &XmlSecEvent) -> Result<()>;

    /// Feed raw bytes.
    fn bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Flush this stage and every stage after it.
    fn finish(&mut self) -> Result<()>;
}

// ── Canonicalization stage ───────────────────────────────────────────

/// Event-consuming, byte-producing canonicalization stage.
pub struct C14nTransformer {
    canon: EventCanonicalizer,
}

impl C14nTransformer {
    pub fn new(
        mode: C14nMode,
        sink: SharedDigestSink,
        inclusive_prefixes: Vec<String>,
        inherited_ns: BTreeMap<String, String>,
        inherited_xml_attrs: Vec<Attribute>,
    ) -> Self {
        Self {
            canon: EventCanonicalizer::with_inherited(
                mode,
                Box::new(sink),
                inclusive_prefixes,
                inherited_ns,
                inherited_xml_attrs,
            ),
        }
    }
}

impl Transformer for C14nTransformer {
    fn event(&mut self, ev: &XmlSecEvent) -> Result<()> {
        self.canon.event(ev)
    }

    fn bytes(&mut self, data: &[u8]) -> Result<()> {
        // Byte input (external references) is parsed back into events.
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Transform(format!("canonicalization input not UTF-8: {e}")))?;
        for ev in reader::events_from_str(text)? {
            self.canon.event(&ev)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.canon.finish()
    }
}

// ── Enveloped-signature stage ────────────────────────────────────────

/// Drops the enclosing signature's subtree from the event stream.
pub struct EnvelopedSignatureTransformer {
    next: Box<dyn Transformer>,
    skip_depth: usize,
    dropped: bool,
}

impl EnvelopedSignatureTransformer {
    pub fn new(next: Box<dyn Transformer>) -> Self {
        Self {
            next,
            skip_depth: 0,
            dropped: false,
        }
    }
}

impl Transformer for EnvelopedSignatureTransformer {
    fn event(&mut self, ev: &XmlSecEvent) -> Result<()> {
        if self.skip_depth > 0 {
            match ev {
                XmlSecEvent::StartElement(_) => self.skip_depth += 1,
                XmlSecEvent::EndElement { .. } => self.skip_depth -= 1,
                _ => {}
            }
            return Ok(());
        }
        if !self.dropped {
            if let XmlSecEvent::StartElement(data) = ev {
                if data.name.namespace_uri == forsmark_core::ns::DSIG
                    && data.name.local_name == forsmark_core::ns::node::SIGNATURE
                {
                    self.skip_depth = 1;
                    self.dropped = true;
                    return Ok(());
                }
            }
        }
        self.next.event(ev)
    }

    fn bytes(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::Transform(
            "enveloped-signature transform requires event input".into(),
        ))
    }

    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

// ── Base64 stage ─────────────────────────────────────────────────────

/// Collects text content, base64-decodes it, and hands the octets on.
pub struct Base64DecodeTransformer {
    next: Box<dyn Transformer>,
    buffer: String,
}

impl Base64DecodeTransformer {
    pub fn new(next: Box<dyn Transformer>) -> Self {
        Self {
            next,
            buffer: String::new(),
        }
    }
}

impl Transformer for Base64DecodeTransformer {
    fn event(&mut self, ev: &XmlSecEvent) -> Result<()> {
        if let XmlSecEvent::Characters { text } = ev {
            self.buffer.push_str(text);
        }
        Ok(())
    }

    fn bytes(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.push_str(
            std::str::from_utf8(data)
                .map_err(|e| Error::Transform(format!("base64 input not UTF-8: {e}")))?,
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let decoded = crate::structures::decode_b64(&self.buffer)?;
        self.buffer.clear();
        self.next.bytes(&decoded)?;
        self.next.finish()
    }
}

// ── Raw sink stage ───────────────────────────────────────────────────

/// Terminal byte stage writing straight into the digest sink.
pub struct SinkTransformer {
    sink: SharedDigestSink,
}

impl SinkTransformer {
    pub fn new(sink: SharedDigestSink) -> Self {
        Self { sink }
    }
}

impl Transformer for SinkTransformer {
    fn event(&mut self, _ev: &XmlSecEvent) -> Result<()> {
        Err(Error::Transform("byte stage cannot consume events".into()))
    }

    fn bytes(&mut self, data: &[u8]) -> Result<()> {
        self.sink.0.borrow_mut().write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Chain construction ───────────────────────────────────────────────

/// Create the digest sink for a reference and fire the digest algorithm
/// event, correlation id equal to the reference id.
pub fn digest_sink_for(
    reference: &ReferenceRecord,
    security: &SecurityContext,
) -> Result<SharedDigestSink> {
    forsmark_crypto::registry::lookup(&reference.digest_uri)?;
    let sink = SharedDigestSink::new(&reference.digest_uri)?;
    security.emit(SecurityEvent::AlgorithmUsed {
        uri: reference.digest_uri.clone(),
        usage: KeyUsage::Digest,
        key_length_bits: None,
        correlation_id: reference.id.clone(),
    });
    Ok(sink)
}

/// Build the transform chain for a reference, terminating in `sink`.
///
/// Rules carried over exactly: no declared transforms means Canonical XML
/// 1.0 omit-comments; a sole enveloped-signature transform gets that same
/// canonicalization appended after it; the transform count is limited
/// before any stage is constructed.
pub fn build_transform_chain(
    reference: &ReferenceRecord,
    sink: SharedDigestSink,
    inherited_ns: BTreeMap<String, String>,
    inherited_xml_attrs: Vec<Attribute>,
    max_transforms: usize,
    security: &SecurityContext,
) -> Result<Box<dyn Transformer>> {
    let mut declared: Vec<TransformRecord> = reference.transforms.clone();
    if declared.is_empty() {
        declared.push(TransformRecord {
            uri: algorithm::C14N.to_owned(),
            inclusive_prefixes: Vec::new(),
        });
    } else if declared.len() == 1 && declared[0].uri == algorithm::ENVELOPED_SIGNATURE {
        declared.push(TransformRecord {
            uri: algorithm::C14N.to_owned(),
            inclusive_prefixes: Vec::new(),
        });
    }

    if declared.len() > max_transforms {
        return Err(Error::LimitExceeded(format!(
            "{} transforms declared, at most {} allowed",
            declared.len(),
            max_transforms
        )));
    }

    let mut chain: Option<Box<dyn Transformer>> = None;
    for record in declared.iter().rev() {
        security.emit(SecurityEvent::AlgorithmUsed {
            uri: record.uri.clone(),
            usage: KeyUsage::Canonicalization,
            key_length_bits: None,
            correlation_id: reference.id.clone(),
        });

        chain = Some(match (record.uri.as_str(), chain) {
            (algorithm::ENVELOPED_SIGNATURE, Some(next)) => {
                Box::new(EnvelopedSignatureTransformer::new(next))
            }
            (algorithm::BASE64, Some(next)) => Box::new(Base64DecodeTransformer::new(next)),
            (algorithm::BASE64, None) => Box::new(Base64DecodeTransformer::new(Box::new(
                SinkTransformer::new(sink.clone()),
            ))),
            (uri, None) => match C14nMode::from_uri(uri) {
                Some(mode) => Box::new(C14nTransformer::new(
                    mode,
                    sink.clone(),
                    record.inclusive_prefixes.clone(),
                    inherited_ns.clone(),
                    inherited_xml_attrs.clone(),
                )),
                None => return Err(Error::UnsupportedAlgorithm(format!("transform: {uri}"))),
            },
            (uri, Some(_)) => {
                return Err(Error::Transform(format!(
                    "unsupported transform composition at {uri}"
                )))
            }
        });
    }

    chain.ok_or_else(|| Error::Transform("empty transform chain".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::generate_id;
    use forsmark_core::algorithm;

    fn reference_with(transforms: Vec<TransformRecord>) -> ReferenceRecord {
        ReferenceRecord {
            id: generate_id(),
            uri: Some("#x".into()),
            type_uri: None,
            digest_uri: algorithm::SHA256.to_owned(),
            digest_value: Vec::new(),
            transforms,
        }
    }

    fn digest_of_events(chain_ref: &ReferenceRecord, xml: &str) -> Vec<u8> {
        let security = SecurityContext::new();
        let sink = SharedDigestSink::new(algorithm::SHA256).unwrap();
        let mut chain = build_transform_chain(
            chain_ref,
            sink.clone(),
            BTreeMap::new(),
            Vec::new(),
            5,
            &security,
        )
        .unwrap();
        let events = reader::events_from_str(xml).unwrap();
        for ev in &events[1..events.len() - 1] {
            chain.event(ev).unwrap();
        }
        chain.finish().unwrap();
        sink.close().unwrap();
        sink.take_digest().unwrap()
    }

    #[test]
    fn test_default_chain_is_inclusive_c14n() {
        let reference = reference_with(Vec::new());
        let digest = digest_of_events(&reference, "<doc >x</doc>");
        let expected =
            forsmark_crypto::digest::digest(algorithm::SHA256, b"<doc>x</doc>").unwrap();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_enveloped_gets_implicit_c14n_appended() {
        let reference = reference_with(vec![TransformRecord {
            uri: algorithm::ENVELOPED_SIGNATURE.to_owned(),
            inclusive_prefixes: Vec::new(),
        }]);
        let xml = r#"<doc><ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo></ds:SignedInfo></ds:Signature><body>x</body></doc>"#;
        let digest = digest_of_events(&reference, xml);
        // The signature subtree is dropped before canonicalization.
        let expected =
            forsmark_crypto::digest::digest(algorithm::SHA256, b"<doc><body>x</body></doc>")
                .unwrap();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_transform_limit_enforced_before_construction() {
        let reference = reference_with(vec![
            TransformRecord {
                uri: algorithm::ENVELOPED_SIGNATURE.to_owned(),
                inclusive_prefixes: Vec::new(),
            };
            3
        ]);
        let security = SecurityContext::new();
        let sink = SharedDigestSink::new(algorithm::SHA256).unwrap();
        let Err(err) = build_transform_chain(
            &reference,
            sink,
            BTreeMap::new(),
            Vec::new(),
            2,
            &security,
        ) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn test_base64_transform_decodes_text() {
        let reference = reference_with(vec![TransformRecord {
            uri: algorithm::BASE64.to_owned(),
            inclusive_prefixes: Vec::new(),
        }]);
        let digest = digest_of_events(&reference, "<data>aGVsbG8=</data>");
        let expected = forsmark_crypto::digest::digest(algorithm::SHA256, b"hello").unwrap();
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_algorithm_events_fire_per_transform() {
        let reference = reference_with(vec![TransformRecord {
            uri: algorithm::ENVELOPED_SIGNATURE.to_owned(),
            inclusive_prefixes: Vec::new(),
        }]);
        let security = SecurityContext::new();
        let sink = SharedDigestSink::new(algorithm::SHA256).unwrap();
        build_transform_chain(
            &reference,
            sink,
            BTreeMap::new(),
            Vec::new(),
            5,
            &security,
        )
        .unwrap();
        // Enveloped plus the implicit c14n.
        assert_eq!(security.recorded_events().len(), 2);
    }
}
