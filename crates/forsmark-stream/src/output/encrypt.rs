#![forbid(unsafe_code)]

//! The encryption output processor.
//!
//! Swallows the configured secure part, serializes it, encrypts it under
//! a freshly generated session key of exactly the length the symmetric
//! algorithm mandates, and emits an `xenc:EncryptedData` element carrying
//! the wrapped session key in an embedded `xenc:EncryptedKey`.

use crate::chain::{EventSink, OutputProcessor, PipelineContext};
use crate::config::{SecurePart, XmlSecurityProperties};
use crate::context::ProcessorId;
use crate::key::KeyMaterial;
use crate::output::{dsig_name, xenc_name, ElementBuilder, DS_PREFIX, XENC_PREFIX};
use crate::security_event::{KeyUsage, SecurityEvent};
use crate::structures::{encode_b64, generate_id};
use crate::writer;
use forsmark_core::{algorithm, ns, Attribute, Error, NsDecl, QName, Result, XmlSecEvent};
use forsmark_crypto::registry;
use std::collections::BTreeMap;
use std::rc::Rc;

enum State {
    Idle,
    Buffering {
        depth: usize,
        part_name: QName,
        events: Vec<XmlSecEvent>,
    },
}

pub struct EncryptOutputProcessor {
    id: ProcessorId,
    part: SecurePart,
    properties: Rc<XmlSecurityProperties>,
    state: State,
    ns_stack: Vec<BTreeMap<String, String>>,
}

impl EncryptOutputProcessor {
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

    /// Wrap the session key for the configured transport token: RSA key
    /// transport for asymmetric keys, AES key wrap for symmetric ones.
    fn wrap_session_key(
        &self,
        session_key: &[u8],
        correlation_id: &str,
        ctx: &PipelineContext,
    ) -> Result<(String, Vec<u8>)> {
        let kek = self
            .properties
            .encryption_key
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("encryption key unset".into()))?;

        if kek.is_asymmetric() {
            let transport_uri = self
                .properties
                .encryption_key_transport_algorithm
                .clone()
                .ok_or_else(|| Error::InvalidConfiguration("key transport unset".into()))?;
            let public = kek
                .rsa_public_key()
                .ok_or_else(|| Error::Key("RSA public key required for key transport".into()))?;
            ctx.security.emit(SecurityEvent::AlgorithmUsed {
                uri: transport_uri.clone(),
                usage: KeyUsage::AsymmetricKeyWrap,
                key_length_bits: Some(kek.bits()),
                correlation_id: correlation_id.to_owned(),
            });
            let transport = forsmark_crypto::keytransport::from_uri(&transport_uri)?;
            Ok((transport_uri, transport.encrypt(public, session_key)?))
        } else {
            let kek_bytes = kek
                .symmetric_bytes()
                .ok_or_else(|| Error::Key("symmetric KEK required".into()))?;
            let wrap_uri = match kek_bytes.len() {
                16 => algorithm::KW_AES128,
                24 => algorithm::KW_AES192,
                32 => algorithm::KW_AES256,
                other => {
                    return Err(Error::Key(format!(
                        "no key wrap algorithm for a {other} byte key"
                    )))
                }
            };
            ctx.security.emit(SecurityEvent::AlgorithmUsed {
                uri: wrap_uri.to_owned(),
                usage: KeyUsage::SymmetricKeyWrap,
                key_length_bits: Some(kek.bits()),
                correlation_id: correlation_id.to_owned(),
            });
            let keywrap = forsmark_crypto::keywrap::from_uri(wrap_uri)?;
            Ok((wrap_uri.to_owned(), keywrap.wrap(kek_bytes, session_key)?))
        }
    }

    fn encrypt_part(
        &mut self,
        events: Vec<XmlSecEvent>,
        downstream: &mut dyn EventSink,
        ctx: &PipelineContext,
    ) -> Result<()> {
        let symmetric_uri = self
            .properties
            .encryption_symmetric_algorithm
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("symmetric algorithm unset".into()))?;

        // The session key length comes from the registry, never from the
        // key material at hand.
        let bits = registry::key_length_bits(&symmetric_uri)?;
        let mut session_key = vec![0u8; bits as usize / 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut session_key);

        let data_id = generate_id();
        let key_id = generate_id();

        ctx.security.emit(SecurityEvent::AlgorithmUsed {
            uri: symmetric_uri.clone(),
            usage: KeyUsage::Encryption,
            key_length_bits: Some(bits),
            correlation_id: data_id.clone(),
        });

        let inherited_ns = self.ns_stack.last().cloned().unwrap_or_default();
        let plaintext = writer::serialize_fragment(&events, &inherited_ns)?;
        let cipher = forsmark_crypto::cipher::from_uri(&symmetric_uri)?;
        let ciphertext = cipher.encrypt(&session_key, plaintext.as_bytes())?;

        let (wrap_uri, wrapped_key) = self.wrap_session_key(&session_key, &key_id, ctx)?;

        let mut builder = ElementBuilder::new();
        builder.open_with(
            xenc_name(ns::node::ENCRYPTED_DATA),
            vec![
                Attribute::new(QName::new("", ns::attr::ID), &data_id),
                Attribute::new(QName::new("", ns::attr::TYPE), ns::ENC_TYPE_ELEMENT),
            ],
            vec![NsDecl::new(XENC_PREFIX, ns::ENC)],
        );
        builder.open_with(
            xenc_name(ns::node::ENCRYPTION_METHOD),
            vec![Attribute::new(
                QName::new("", ns::attr::ALGORITHM),
                &symmetric_uri,
            )],
            Vec::new(),
        );
        builder.close();
        builder.open_with(
            dsig_name(ns::node::KEY_INFO),
            Vec::new(),
            vec![NsDecl::new(DS_PREFIX, ns::DSIG)],
        );
        builder.open_with(
            xenc_name(ns::node::ENCRYPTED_KEY),
            vec![Attribute::new(QName::new("", ns::attr::ID), &key_id)],
            Vec::new(),
        );
        builder.open_with(
            xenc_name(ns::node::ENCRYPTION_METHOD),
            vec![Attribute::new(QName::new("", ns::attr::ALGORITHM), &wrap_uri)],
            Vec::new(),
        );
        builder.close();
        builder.open(xenc_name(ns::node::CIPHER_DATA));
        builder.open(xenc_name(ns::node::CIPHER_VALUE));
        builder.text(&encode_b64(&wrapped_key));
        builder.close();
        builder.close();
        builder.close(); // EncryptedKey
        builder.close(); // KeyInfo
        builder.open(xenc_name(ns::node::CIPHER_DATA));
        builder.open(xenc_name(ns::node::CIPHER_VALUE));
        builder.text(&encode_b64(&ciphertext));
        builder.close();
        builder.close();

        for event in builder.finish() {
            downstream.write_event(event, ctx)?;
        }
        Ok(())
    }
}

impl OutputProcessor for EncryptOutputProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn write_event(
        &mut self,
        event: XmlSecEvent,
        downstream: &mut dyn EventSink,
        ctx: &PipelineContext,
    ) -> Result<()> {
        match &mut self.state {
            State::Idle => {
                if let XmlSecEvent::StartElement(data) = &event {
                    if data.name == self.part.name {
                        self.state = State::Buffering {
                            depth: 1,
                            part_name: data.name.clone(),
                            events: vec![event],
                        };
                        return Ok(());
                    }
                }
                self.track(&event);
                downstream.write_event(event, ctx)
            }
            State::Buffering {
                depth,
                part_name,
                events,
            } => {
                match &event {
                    XmlSecEvent::StartElement(_) => *depth += 1,
                    XmlSecEvent::EndElement { name } => {
                        *depth -= 1;
                        if *depth == 0 && name == part_name {
                            let mut buffered = std::mem::take(events);
                            buffered.push(event);
                            self.state = State::Idle;
                            return self.encrypt_part(buffered, downstream, ctx);
                        }
                    }
                    _ => {}
                }
                events.push(event);
                Ok(())
            }
        }
    }

    fn close(&mut self, _downstream: &mut dyn EventSink, _ctx: &PipelineContext) -> Result<()> {
        match self.state {
            State::Buffering { .. } => Err(Error::XmlStructure(
                "document ended inside the encrypted part".into(),
            )),
            State::Idle => Ok(()),
        }
    }
}
