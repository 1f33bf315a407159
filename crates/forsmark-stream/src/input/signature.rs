#![forbid(unsafe_code)]

//! Signature reference verification over the live event stream.
//!
//! One [`SignatureVerifyInputProcessor`] is installed per parsed
//! signature. Secure-processing limits are enforced at construction,
//! before any digest is computed. Every subsequent start element is
//! tested against the same-document resolvers; a match spawns an
//! [`InternalReferenceVerifier`] that digests the subtree exactly in
//! tandem with the parse and compares in constant time when the element
//! closes. External references are fetched and digested at document end.

use crate::chain::{EventSource, InputProcessor, PipelineContext};
use crate::config::XmlSecurityProperties;
use crate::context::{
    ContentFlag, ProcessorId, SecurityContext, SignatureVerificationResult,
};
use crate::digest_sink::SharedDigestSink;
use crate::input::{token_for_key_info, KeyInfoUse};
use crate::resolver::{resolver_for, ResourceResolver, SameDocumentResolver};
use crate::security_event::{KeyUsage, ReferenceStatus, SecurityEvent};
use crate::structures::{encode_b64, ReferenceRecord, SignatureRecord};
use crate::transform::{build_transform_chain, Transformer};
use forsmark_core::{ns, Attribute, Error, QName, Result, XmlSecEvent};
use forsmark_crypto::registry;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::rc::Rc;

/// Verification state shared between the dispatcher, its verifiers, and
/// the header processor that checked the SignatureValue.
pub struct SignatureState {
    pub signature_id: String,
    pub signature_valid: bool,
    pub statuses: Vec<Option<ReferenceStatus>>,
    processed: HashSet<usize>,
    claimed_fragments: HashSet<String>,
}

impl SignatureState {
    pub fn new(signature_id: &str, reference_count: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            signature_id: signature_id.to_owned(),
            signature_valid: false,
            statuses: vec![None; reference_count],
            processed: HashSet::new(),
            claimed_fragments: HashSet::new(),
        }))
    }
}

/// Canonicalize a buffered event subtree in one shot.
pub fn canonicalize_events(
    events: &[XmlSecEvent],
    c14n_uri: &str,
    inclusive_prefixes: Vec<String>,
    inherited_ns: BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    struct VecSink(Rc<RefCell<Vec<u8>>>);
    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mode = forsmark_c14n::C14nMode::from_uri(c14n_uri)
        .ok_or_else(|| Error::UnsupportedAlgorithm(format!("canonicalization: {c14n_uri}")))?;
    let out = Rc::new(RefCell::new(Vec::new()));
    let mut canon = forsmark_c14n::EventCanonicalizer::with_inherited(
        mode,
        Box::new(VecSink(out.clone())),
        inclusive_prefixes,
        inherited_ns,
        Vec::new(),
    );
    for ev in events {
        canon.event(ev)?;
    }
    canon.finish()?;
    let bytes = out.borrow().clone();
    Ok(bytes)
}

/// Extract the SignedInfo subtree from buffered signature events.
pub fn signed_info_events(signature_events: &[XmlSecEvent]) -> Result<&[XmlSecEvent]> {
    let mut start = None;
    let mut depth = 0usize;
    for (i, ev) in signature_events.iter().enumerate() {
        match ev {
            XmlSecEvent::StartElement(data) => {
                if start.is_none()
                    && data.name.namespace_uri == ns::DSIG
                    && data.name.local_name == ns::node::SIGNED_INFO
                {
                    start = Some(i);
                    depth = 1;
                    continue;
                }
                if start.is_some() {
                    depth += 1;
                }
            }
            XmlSecEvent::EndElement { .. } => {
                if let Some(s) = start {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(&signature_events[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    Err(Error::MissingElement(ns::node::SIGNED_INFO.into()))
}

/// Check the SignatureValue against the canonicalized SignedInfo.
pub fn verify_signature_value(
    signature_events: &[XmlSecEvent],
    record: &SignatureRecord,
    properties: &Rc<XmlSecurityProperties>,
    security: &Rc<SecurityContext>,
) -> Result<bool> {
    let si_events = signed_info_events(signature_events)?;
    let canonical = canonicalize_events(
        si_events,
        &record.signed_info.c14n_uri,
        record.signed_info.c14n_prefixes.clone(),
        record.inscope_ns.clone(),
    )?;

    let token = token_for_key_info(
        record.key_info.as_ref(),
        KeyInfoUse::Verification,
        properties,
        security,
    )?;
    security.emit(SecurityEvent::TokenObserved {
        token_id: token.id().map(str::to_owned),
        kind: token.kind(),
        correlation_id: record.id.clone(),
    });

    let signature_uri = &record.signed_info.signature_uri;
    let entry = registry::lookup(signature_uri)?;
    let key = match entry.family {
        registry::AlgorithmFamily::Mac => {
            token.secret_key_for(security, signature_uri, KeyUsage::Verification, &record.id)?
        }
        _ => token.public_key_for(security, signature_uri, KeyUsage::Verification, &record.id)?,
    };

    let alg = forsmark_crypto::sign::from_uri(signature_uri)?;
    alg.verify(&key.to_signing_key()?, &canonical, &record.signature_value)
}

fn constant_time_digest_eq(expected: &[u8], computed: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if expected.len() != computed.len() {
        return false;
    }
    expected.ct_eq(computed).into()
}

/// The per-signature dispatcher: tests live start elements against the
/// reference resolvers and tracks what remains to be processed.
pub struct SignatureVerifyInputProcessor {
    id: ProcessorId,
    record: SignatureRecord,
    same_document: Vec<(SameDocumentResolver, usize)>,
    external: Vec<(Box<dyn ResourceResolver>, usize)>,
    state: Rc<RefCell<SignatureState>>,
    /// Live namespace scope, for seeding subtree canonicalizers.
    ns_stack: Vec<BTreeMap<String, String>>,
    /// Live inheritable xml:* attributes.
    xml_attr_stack: Vec<Vec<Attribute>>,
}

impl SignatureVerifyInputProcessor {
    /// Construct the dispatcher, enforcing every secure-processing rule
    /// before any cryptographic work.
    pub fn new(
        id: ProcessorId,
        record: SignatureRecord,
        properties: &XmlSecurityProperties,
        state: Rc<RefCell<SignatureState>>,
    ) -> Result<Self> {
        let references = &record.signed_info.references;
        if references.len() > properties.max_references_per_manifest {
            return Err(Error::LimitExceeded(format!(
                "{} references declared, at most {} allowed",
                references.len(),
                properties.max_references_per_manifest
            )));
        }

        let mut same_document = Vec::new();
        let mut external = Vec::new();
        for (index, reference) in references.iter().enumerate() {
            if !properties.allow_manifests
                && reference.type_uri.as_deref() == Some(ns::DSIG_TYPE_MANIFEST)
            {
                return Err(Error::InvalidSecurity(
                    "manifest references are not allowed".into(),
                ));
            }
            let uri = reference
                .uri
                .as_deref()
                .ok_or_else(|| Error::InvalidSecurity("Reference without URI".into()))?;
            let resolver = resolver_for(uri, properties.base_uri.as_deref())?;
            if resolver.is_same_document() {
                let fragment = uri.strip_prefix('#').unwrap_or("");
                same_document.push((SameDocumentResolver::new(fragment), index));
            } else {
                if !properties.allow_external_references {
                    return Err(Error::InvalidSecurity(
                        "external references are not allowed".into(),
                    ));
                }
                external.push((resolver, index));
            }
        }

        Ok(Self {
            id,
            record,
            same_document,
            external,
            state,
            ns_stack: vec![BTreeMap::new()],
            xml_attr_stack: vec![Vec::new()],
        })
    }

    fn push_scope(&mut self, data: &forsmark_core::StartElementData) {
        let mut scope = self.ns_stack.last().cloned().unwrap_or_default();
        for decl in &data.namespaces {
            if decl.uri.is_empty() {
                scope.remove(&decl.prefix);
            } else {
                scope.insert(decl.prefix.clone(), decl.uri.clone());
            }
        }
        self.ns_stack.push(scope);

        let mut xml_attrs = self.xml_attr_stack.last().cloned().unwrap_or_default();
        for attr in &data.attributes {
            if attr.name.namespace_uri == ns::XML {
                xml_attrs.retain(|a| a.name != attr.name);
                xml_attrs.push(attr.clone());
            }
        }
        self.xml_attr_stack.push(xml_attrs);
    }

    fn pop_scope(&mut self) {
        if self.ns_stack.len() > 1 {
            self.ns_stack.pop();
            self.xml_attr_stack.pop();
        }
    }

    fn handle_start_element(
        &mut self,
        event: &XmlSecEvent,
        ctx: &PipelineContext,
    ) -> Result<()> {
        let Some(data) = event.as_start_element() else {
            return Ok(());
        };

        // Inherited context excludes the matched element's own
        // declarations: the element is the apex of the digested subtree.
        let parent_ns = self.ns_stack.last().cloned().unwrap_or_default();
        let parent_xml_attrs = self.xml_attr_stack.last().cloned().unwrap_or_default();
        self.push_scope(data);

        let matched: Vec<(String, usize)> = self
            .same_document
            .iter()
            .filter(|(resolver, _)| resolver.matches(data))
            .map(|(resolver, index)| (resolver.fragment().to_owned(), *index))
            .collect();

        for (fragment, index) in matched {
            {
                let mut state = self.state.borrow_mut();
                if state.processed.contains(&index) || !state.claimed_fragments.insert(fragment) {
                    return Err(Error::DuplicateReference(
                        self.record.signed_info.references[index]
                            .uri
                            .clone()
                            .unwrap_or_default(),
                    ));
                }
                state.processed.insert(index);
            }

            let reference = self.record.signed_info.references[index].clone();
            let sink = crate::transform::digest_sink_for(&reference, &ctx.security)?;
            let chain = build_transform_chain(
                &reference,
                sink.clone(),
                parent_ns.clone(),
                parent_xml_attrs.clone(),
                ctx.properties.max_transforms_per_reference,
                &ctx.security,
            )?;

            let verifier_id = ctx.allocate_id();
            let mut verifier = InternalReferenceVerifier {
                id: verifier_id,
                reference_index: index,
                reference,
                start_name: data.name.clone(),
                depth: 0,
                done: false,
                chain,
                sink,
                state: self.state.clone(),
            };
            // The triggering event is fed by hand; the verifier only
            // receives events from the chain once it is installed.
            verifier.consume(event, ctx)?;
            if !verifier.done {
                ctx.document.set_content_flag(verifier_id, ContentFlag::Signed);
                ctx.add_processor_after(self.id, Box::new(verifier));
            }
        }
        Ok(())
    }

    fn verify_external_references(&mut self, ctx: &PipelineContext) -> Result<()> {
        for (resolver, index) in &self.external {
            let reference = &self.record.signed_info.references[*index];
            let data = resolver.resolve_external()?;

            let sink = crate::transform::digest_sink_for(reference, &ctx.security)?;
            if reference.transforms.is_empty() {
                // External octets digest as-is when no transform is
                // declared.
                sink.0.borrow_mut().write_all(&data)?;
            } else {
                let mut chain = build_transform_chain(
                    reference,
                    sink.clone(),
                    BTreeMap::new(),
                    Vec::new(),
                    ctx.properties.max_transforms_per_reference,
                    &ctx.security,
                )?;
                chain.bytes(&data)?;
                chain.finish()?;
            }
            sink.close()?;
            let computed = sink.take_digest()?;

            let uri = reference.uri.clone().unwrap_or_default();
            let ok = constant_time_digest_eq(&reference.digest_value, &computed);
            let mut state = self.state.borrow_mut();
            state.statuses[*index] = Some(ReferenceStatus {
                uri: uri.clone(),
                processed: true,
                digest_ok: ok,
            });
            state.processed.insert(*index);
            if !ok {
                return Err(Error::DigestMismatch(uri));
            }
        }
        Ok(())
    }
}

impl InputProcessor for SignatureVerifyInputProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn next_event(
        &mut self,
        upstream: &mut dyn EventSource,
        ctx: &PipelineContext,
    ) -> Result<Option<XmlSecEvent>> {
        let event = upstream.next_event(ctx)?;
        if let Some(event) = &event {
            match event {
                XmlSecEvent::StartElement(_) => self.handle_start_element(event, ctx)?,
                XmlSecEvent::EndElement { .. } => self.pop_scope(),
                _ => {}
            }
        }
        Ok(event)
    }

    fn finish(&mut self, ctx: &PipelineContext) -> Result<()> {
        self.verify_external_references(ctx)?;

        // A reference that never produced a status was never carried to
        // completion, even if its resolver fired.
        let state = self.state.borrow();
        let mut references = Vec::with_capacity(state.statuses.len());
        for (index, status) in state.statuses.iter().enumerate() {
            match status {
                Some(status) => references.push(status.clone()),
                None => {
                    return Err(Error::UnprocessedReference(
                        self.record.signed_info.references[index]
                            .uri
                            .clone()
                            .unwrap_or_default(),
                    ))
                }
            }
        }

        // The verification outcome fires only once every reference has
        // been resolved.
        let valid = state.signature_valid && references.iter().all(|r| r.digest_ok);
        ctx.security.emit(SecurityEvent::VerificationOutcome {
            signature_id: state.signature_id.clone(),
            valid,
            references: references.clone(),
        });
        ctx.security.push_result(SignatureVerificationResult {
            signature_id: state.signature_id.clone(),
            valid,
            references,
        });
        Ok(())
    }
}

/// Digests one matched reference in tandem with the parse.
///
/// idle until its first event, active while the subtree is open, done
/// when the depth returns to zero on the opening qualified name; once
/// done, no further events are delivered to it.
pub struct InternalReferenceVerifier {
    id: ProcessorId,
    reference_index: usize,
    reference: ReferenceRecord,
    start_name: QName,
    depth: usize,
    done: bool,
    chain: Box<dyn Transformer>,
    sink: SharedDigestSink,
    state: Rc<RefCell<SignatureState>>,
}

impl InternalReferenceVerifier {
    fn consume(&mut self, event: &XmlSecEvent, ctx: &PipelineContext) -> Result<()> {
        self.chain.event(event)?;
        match event {
            XmlSecEvent::StartElement(_) => self.depth += 1,
            XmlSecEvent::EndElement { name } => {
                self.depth -= 1;
                if self.depth == 0 && *name == self.start_name {
                    self.finalize(ctx)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finalize(&mut self, ctx: &PipelineContext) -> Result<()> {
        self.chain.finish()?;
        self.sink.close()?;
        let computed = self.sink.take_digest()?;
        let uri = self.reference.uri.clone().unwrap_or_default();

        tracing::debug!(
            reference = %uri,
            calculated = %encode_b64(&computed),
            stored = %encode_b64(&self.reference.digest_value),
            "comparing reference digest"
        );

        let ok = constant_time_digest_eq(&self.reference.digest_value, &computed);
        self.state.borrow_mut().statuses[self.reference_index] = Some(ReferenceStatus {
            uri: uri.clone(),
            processed: true,
            digest_ok: ok,
        });

        self.done = true;
        ctx.remove_processor(self.id);
        if !ok {
            return Err(Error::DigestMismatch(uri));
        }
        Ok(())
    }
}

impl InputProcessor for InternalReferenceVerifier {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn next_event(
        &mut self,
        upstream: &mut dyn EventSource,
        ctx: &PipelineContext,
    ) -> Result<Option<XmlSecEvent>> {
        let event = upstream.next_event(ctx)?;
        if let Some(event) = &event {
            if !self.done {
                self.consume(event, ctx)?;
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::{SignedInfoRecord, TransformRecord};
    use forsmark_core::algorithm;

    fn reference(uri: Option<&str>, type_uri: Option<&str>) -> ReferenceRecord {
        ReferenceRecord {
            id: crate::structures::generate_id(),
            uri: uri.map(str::to_owned),
            type_uri: type_uri.map(str::to_owned),
            digest_uri: algorithm::SHA256.to_owned(),
            digest_value: vec![0u8; 32],
            transforms: vec![TransformRecord {
                uri: algorithm::C14N.to_owned(),
                inclusive_prefixes: Vec::new(),
            }],
        }
    }

    fn record_with_references(references: Vec<ReferenceRecord>) -> SignatureRecord {
        SignatureRecord {
            id: "sig".into(),
            signed_info: SignedInfoRecord {
                c14n_uri: algorithm::EXC_C14N.to_owned(),
                c14n_prefixes: Vec::new(),
                signature_uri: algorithm::HMAC_SHA1.to_owned(),
                references,
            },
            signature_value: Vec::new(),
            key_info: None,
            inscope_ns: BTreeMap::new(),
        }
    }

    fn dispatcher(
        record: SignatureRecord,
        properties: &XmlSecurityProperties,
    ) -> Result<SignatureVerifyInputProcessor> {
        let state = SignatureState::new("sig", record.signed_info.references.len());
        SignatureVerifyInputProcessor::new(7, record, properties, state)
    }

    #[test]
    fn test_reference_limit_enforced() {
        let mut properties = XmlSecurityProperties::new();
        properties.max_references_per_manifest = 2;
        let record = record_with_references(vec![
            reference(Some("#a"), None),
            reference(Some("#b"), None),
            reference(Some("#c"), None),
        ]);
        let Err(err) = dispatcher(record, &properties) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::LimitExceeded(_)));
    }

    #[test]
    fn test_manifest_reference_rejected() {
        let properties = XmlSecurityProperties::new();
        let record = record_with_references(vec![reference(
            Some("#a"),
            Some(ns::DSIG_TYPE_MANIFEST),
        )]);
        let Err(err) = dispatcher(record, &properties) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::InvalidSecurity(_)));
    }

    #[test]
    fn test_manifest_reference_allowed_when_configured() {
        let mut properties = XmlSecurityProperties::new();
        properties.allow_manifests = true;
        let record = record_with_references(vec![reference(
            Some("#a"),
            Some(ns::DSIG_TYPE_MANIFEST),
        )]);
        assert!(dispatcher(record, &properties).is_ok());
    }

    #[test]
    fn test_reference_without_uri_rejected() {
        let properties = XmlSecurityProperties::new();
        let record = record_with_references(vec![reference(None, None)]);
        let Err(err) = dispatcher(record, &properties) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::InvalidSecurity(_)));
    }

    #[test]
    fn test_external_reference_rejected_by_default() {
        let properties = XmlSecurityProperties::new();
        let record = record_with_references(vec![reference(Some("http://example/"), None)]);
        let Err(err) = dispatcher(record, &properties) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::InvalidSecurity(_)));
    }

    #[test]
    fn test_signed_info_extraction() {
        let xml = r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
<ds:SignedInfo><ds:SignatureMethod Algorithm="x"/></ds:SignedInfo>
<ds:SignatureValue>AAA=</ds:SignatureValue>
</ds:Signature>"#;
        let events = crate::reader::events_from_str(xml).unwrap();
        let subtree = &events[1..events.len() - 1];
        let si = signed_info_events(subtree).unwrap();
        assert!(matches!(
            si.first(),
            Some(XmlSecEvent::StartElement(data)) if data.name.local_name == "SignedInfo"
        ));
        assert!(matches!(
            si.last(),
            Some(XmlSecEvent::EndElement { name }) if name.local_name == "SignedInfo"
        ));
    }
}
