#![forbid(unsafe_code)]

//! The signature output processor.
//!
//! Watches for the configured secure part, stamps it with a generated Id,
//! side-digests its events through the same transform chain the inbound
//! verifier uses, and emits a complete enveloped `ds:Signature` element
//! just before the part closes.

use crate::chain::{EventSink, OutputProcessor, PipelineContext};
use crate::config::{KeyIdentifierType, SecurePart, XmlSecurityProperties};
use crate::context::ProcessorId;
use crate::input::signature::canonicalize_events;
use crate::key::KeyMaterial;
use crate::output::{dsig_name, ElementBuilder, DS_PREFIX};
use crate::security_event::{KeyUsage, SecurityEvent};
use crate::structures::{encode_b64, generate_id, ReferenceRecord, TransformRecord};
use crate::transform::{build_transform_chain, digest_sink_for, Transformer};
use crate::digest_sink::SharedDigestSink;
use forsmark_core::{algorithm, ns, Attribute, Error, NsDecl, QName, Result, XmlSecEvent};
use std::collections::BTreeMap;
use std::rc::Rc;

enum State {
    Idle,
    Digesting {
        depth: usize,
        part_name: QName,
        chain: Box<dyn Transformer>,
        sink: SharedDigestSink,
        reference: ReferenceRecord,
    },
    Done,
}

pub struct SignatureOutputProcessor {
    id: ProcessorId,
    part: SecurePart,
    properties: Rc<XmlSecurityProperties>,
    state: State,
    ns_stack: Vec<BTreeMap<String, String>>,
}

impl SignatureOutputProcessor {
    pub fn new(id: ProcessorId, part: SecurePart, properties: Rc<XmlSecurityProperties>) -> Self {
        Self {
            id,
            part,
            properties,
            state: State::Idle,
            ns_stack: vec![BTreeMap::new()],
        }
    }

    fn track(&mut self, event: &XmlSecEvent) {
        match event {
            XmlSecEvent::StartElement(data) => {
                let mut scope = self.ns_stack.last().cloned().unwrap_or_default();
                for decl in &data.namespaces {
                    if decl.uri.is_empty() {
                        scope.remove(&decl.prefix);
                    } else {
                        scope.insert(decl.prefix.clone(), decl.uri.clone());
                    }
                }
                self.ns_stack.push(scope);
            }
            XmlSecEvent::EndElement { .. } => {
                if self.ns_stack.len() > 1 {
                    self.ns_stack.pop();
                }
            }
            _ => {}
        }
    }

    fn begin_part(
        &mut self,
        data: &forsmark_core::StartElementData,
        ctx: &PipelineContext,
    ) -> Result<XmlSecEvent> {
        let digest_uri = self
            .properties
            .signature_digest_algorithm
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("digest algorithm unset".into()))?;
        let c14n_uri = self
            .properties
            .signature_c14n_algorithm
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("c14n algorithm unset".into()))?;

        // Reuse an existing Id or stamp a generated one on the part.
        let mut data = data.clone();
        let part_id = match data.attribute(ns::attr::ID) {
            Some(id) => id.to_owned(),
            None => {
                let id = generate_id();
                data.attributes
                    .push(Attribute::new(QName::new("", ns::attr::ID), &id));
                id
            }
        };

        let reference = ReferenceRecord {
            id: generate_id(),
            uri: Some(format!("#{part_id}")),
            type_uri: None,
            digest_uri,
            digest_value: Vec::new(),
            transforms: vec![
                TransformRecord {
                    uri: algorithm::ENVELOPED_SIGNATURE.to_owned(),
                    inclusive_prefixes: Vec::new(),
                },
                TransformRecord {
                    uri: c14n_uri,
                    inclusive_prefixes: Vec::new(),
                },
            ],
        };

        let inherited_ns = self.ns_stack.last().cloned().unwrap_or_default();
        let sink = digest_sink_for(&reference, &ctx.security)?;
        let mut chain = build_transform_chain(
            &reference,
            sink.clone(),
            inherited_ns,
            Vec::new(),
            self.properties.max_transforms_per_reference,
            &ctx.security,
        )?;

        let rewritten = XmlSecEvent::StartElement(data.clone());
        chain.event(&rewritten)?;
        self.state = State::Digesting {
            depth: 1,
            part_name: data.name.clone(),
            chain,
            sink,
            reference,
        };
        Ok(rewritten)
    }

    /// Build and emit the whole `ds:Signature` element.
    fn emit_signature(
        &mut self,
        reference: ReferenceRecord,
        digest: Vec<u8>,
        downstream: &mut dyn EventSink,
        ctx: &PipelineContext,
    ) -> Result<()> {
        let signature_uri = self
            .properties
            .signature_algorithm
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("signature algorithm unset".into()))?;
        let si_c14n_uri = self
            .properties
            .signature_c14n_algorithm
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("c14n algorithm unset".into()))?;
        let key = self
            .properties
            .signature_key
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("signature key unset".into()))?;

        let signature_id = generate_id();

        // SignedInfo, built once and reused for both canonicalization and
        // emission.
        let mut si = ElementBuilder::new();
        si.open(dsig_name(ns::node::SIGNED_INFO));
        si.open_with(
            dsig_name(ns::node::CANONICALIZATION_METHOD),
            vec![Attribute::new(
                QName::new("", ns::attr::ALGORITHM),
                &si_c14n_uri,
            )],
            Vec::new(),
        );
        si.close();
        si.open_with(
            dsig_name(ns::node::SIGNATURE_METHOD),
            vec![Attribute::new(
                QName::new("", ns::attr::ALGORITHM),
                &signature_uri,
            )],
            Vec::new(),
        );
        si.close();
        si.open_with(
            dsig_name(ns::node::REFERENCE),
            vec![Attribute::new(
                QName::new("", ns::attr::URI),
                reference.uri.as_deref().unwrap_or(""),
            )],
            Vec::new(),
        );
        si.open(dsig_name(ns::node::TRANSFORMS));
        for transform in &reference.transforms {
            si.open_with(
                dsig_name(ns::node::TRANSFORM),
                vec![Attribute::new(
                    QName::new("", ns::attr::ALGORITHM),
                    &transform.uri,
                )],
                Vec::new(),
            );
            si.close();
        }
        si.close();
        si.open_with(
            dsig_name(ns::node::DIGEST_METHOD),
            vec![Attribute::new(
                QName::new("", ns::attr::ALGORITHM),
                &reference.digest_uri,
            )],
            Vec::new(),
        );
        si.close();
        si.open(dsig_name(ns::node::DIGEST_VALUE));
        si.text(&encode_b64(&digest));
        si.close();
        si.close(); // Reference
        let signed_info = si.finish();

        // Canonicalize with the ds binding that the Signature element
        // will declare.
        let mut inherited = BTreeMap::new();
        inherited.insert(DS_PREFIX.to_owned(), ns::DSIG.to_owned());
        let canonical =
            canonicalize_events(&signed_info, &si_c14n_uri, Vec::new(), inherited)?;

        ctx.security.emit(SecurityEvent::AlgorithmUsed {
            uri: signature_uri.clone(),
            usage: KeyUsage::Signature,
            key_length_bits: Some(key.bits()),
            correlation_id: signature_id.clone(),
        });
        let alg = forsmark_crypto::sign::from_uri(&signature_uri)?;
        let signature_value = alg.sign(&key.to_signing_key()?, &canonical)?;

        // Assemble the Signature element.
        downstream.write_event(
            XmlSecEvent::start_element(
                dsig_name(ns::node::SIGNATURE),
                vec![Attribute::new(QName::new("", ns::attr::ID), &signature_id)],
                vec![NsDecl::new(DS_PREFIX, ns::DSIG)],
            ),
            ctx,
        )?;
        for event in signed_info {
            downstream.write_event(event, ctx)?;
        }
        downstream.write_event(
            XmlSecEvent::start_element(dsig_name(ns::node::SIGNATURE_VALUE), vec![], vec![]),
            ctx,
        )?;
        downstream.write_event(XmlSecEvent::characters(&encode_b64(&signature_value)), ctx)?;
        downstream.write_event(
            XmlSecEvent::end_element(dsig_name(ns::node::SIGNATURE_VALUE)),
            ctx,
        )?;
        for event in self.key_info_events(&key)? {
            downstream.write_event(event, ctx)?;
        }
        downstream.write_event(XmlSecEvent::end_element(dsig_name(ns::node::SIGNATURE)), ctx)?;
        Ok(())
    }

    /// KeyInfo per the configured key identifier type. Without parsed
    /// certificate metadata an issuer-serial identifier degrades to a
    /// KeyName when one is configured, else KeyInfo is omitted.
    fn key_info_events(&self, _key: &KeyMaterial) -> Result<Vec<XmlSecEvent>> {
        let identifier = self
            .properties
            .signature_key_identifier
            .unwrap_or(KeyIdentifierType::X509IssuerSerial);
        let key_name = match identifier {
            KeyIdentifierType::None => None,
            KeyIdentifierType::KeyName | KeyIdentifierType::X509IssuerSerial => {
                self.properties.signature_key_name.clone()
            }
        };
        let Some(key_name) = key_name else {
            return Ok(Vec::new());
        };
        let mut builder = ElementBuilder::new();
        builder.open(dsig_name(ns::node::KEY_INFO));
        builder.open(dsig_name(ns::node::KEY_NAME));
        builder.text(&key_name);
        builder.close();
        Ok(builder.finish())
    }
}

impl OutputProcessor for SignatureOutputProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn write_event(
        &mut self,
        event: XmlSecEvent,
        downstream: &mut dyn EventSink,
        ctx: &PipelineContext,
    ) -> Result<()> {
        match self.state {
            State::Idle => {
                if let XmlSecEvent::StartElement(data) = &event {
                    if data.name == self.part.name {
                        let data = data.clone();
                        self.track(&event);
                        let rewritten = self.begin_part(&data, ctx)?;
                        return downstream.write_event(rewritten, ctx);
                    }
                }
                self.track(&event);
                downstream.write_event(event, ctx)
            }
            State::Digesting { .. } => {
                let finalize = {
                    let State::Digesting {
                        depth,
                        chain,
                        part_name,
                        ..
                    } = &mut self.state
                    else {
                        unreachable!()
                    };
                    match &event {
                        XmlSecEvent::StartElement(_) => {
                            *depth += 1;
                            chain.event(&event)?;
                            false
                        }
                        XmlSecEvent::EndElement { name } => {
                            *depth -= 1;
                            chain.event(&event)?;
                            *depth == 0 && name == part_name
                        }
                        _ => {
                            chain.event(&event)?;
                            false
                        }
                    }
                };
                if finalize {
                    let State::Digesting {
                        mut chain,
                        sink,
                        reference,
                        ..
                    } = std::mem::replace(&mut self.state, State::Done)
                    else {
                        unreachable!()
                    };
                    chain.finish()?;
                    sink.close()?;
                    let digest = sink.take_digest()?;
                    // The signature lands inside the part, ahead of the
                    // end element now being forwarded.
                    self.emit_signature(reference, digest, downstream, ctx)?;
                }
                self.track(&event);
                downstream.write_event(event, ctx)
            }
            State::Done => {
                self.track(&event);
                downstream.write_event(event, ctx)
            }
        }
    }

    fn close(&mut self, _downstream: &mut dyn EventSink, _ctx: &PipelineContext) -> Result<()> {
        match self.state {
            State::Digesting { .. } => Err(Error::XmlStructure(
                "document ended inside the signed part".into(),
            )),
            _ => Ok(()),
        }
    }
}
