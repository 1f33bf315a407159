#![forbid(unsafe_code)]

//! In-stream decryption of `xenc:EncryptedData` elements.
//!
//! The processor buffers each EncryptedData subtree, resolves the session
//! key token (an embedded or referenced EncryptedKey, or the configured
//! decryption key), decrypts the cipher value, re-parses the plaintext
//! with the namespace context of the surrounding document, and emits the
//! decrypted events in place of the encrypted content.

use crate::chain::{EventSource, InputProcessor, PipelineContext};
use crate::context::{ContentFlag, ProcessorId};
use crate::input::{collect_subtree, token_for_key_info, KeyInfoUse};
use crate::reader;
use crate::security_event::KeyUsage;
use crate::structures::{generate_id, parse_encrypted_data};
use crate::token::TokenUsage;
use forsmark_core::{ns, Error, QName, Result, XmlSecEvent};
use std::collections::{BTreeMap, VecDeque};

pub struct DecryptInputProcessor {
    id: ProcessorId,
    queue: VecDeque<XmlSecEvent>,
    ns_stack: Vec<BTreeMap<String, String>>,
}

impl DecryptInputProcessor {
    pub fn new(id: ProcessorId) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
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

    fn is_encrypted_data(data: &forsmark_core::StartElementData) -> bool {
        data.name.namespace_uri == ns::ENC && data.name.local_name == ns::node::ENCRYPTED_DATA
    }

    fn decrypt_subtree(
        &mut self,
        subtree: Vec<XmlSecEvent>,
        parent_scope: BTreeMap<String, String>,
        parent_path: Vec<QName>,
        ctx: &PipelineContext,
    ) -> Result<Vec<XmlSecEvent>> {
        let record = parse_encrypted_data(&subtree)?;
        let correlation_id = record.id.clone().unwrap_or_else(generate_id);

        let token = token_for_key_info(
            record.key_info.as_ref(),
            KeyInfoUse::Decryption,
            &ctx.properties,
            &ctx.security,
        )?;
        token.add_usage(TokenUsage::Decryption)?;

        let key = token.secret_key_for(
            &ctx.security,
            &record.method_uri,
            KeyUsage::Decryption,
            &correlation_id,
        )?;
        let key_bytes = key
            .symmetric_bytes()
            .ok_or_else(|| Error::Key("decryption requires a symmetric session key".into()))?;

        let cipher = forsmark_crypto::cipher::from_uri(&record.method_uri)?;
        let plaintext = cipher.decrypt(key_bytes, &record.cipher_value)?;
        let text = String::from_utf8(plaintext)
            .map_err(|e| Error::XmlParse(format!("decrypted content is not UTF-8: {e}")))?;

        reader::events_from_fragment(&text, &parent_scope, &parent_path)
    }
}

impl InputProcessor for DecryptInputProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn next_event(
        &mut self,
        upstream: &mut dyn EventSource,
        ctx: &PipelineContext,
    ) -> Result<Option<XmlSecEvent>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                if self.queue.is_empty() {
                    ctx.document.unset_content_flag(self.id);
                }
                return Ok(Some(event));
            }

            let Some(event) = upstream.next_event(ctx)? else {
                return Ok(None);
            };
            if let XmlSecEvent::StartElement(data) = &event {
                if Self::is_encrypted_data(data) {
                    let parent_scope = self.ns_stack.last().cloned().unwrap_or_default();
                    let parent_path =
                        data.element_path[..data.element_path.len().saturating_sub(1)].to_vec();
                    let subtree = collect_subtree(event, upstream, ctx)?;
                    let decrypted =
                        self.decrypt_subtree(subtree, parent_scope, parent_path, ctx)?;
                    if !decrypted.is_empty() {
                        ctx.document.set_content_flag(self.id, ContentFlag::Encrypted);
                        self.queue.extend(decrypted);
                    }
                    continue;
                }
            }
            self.track(&event);
            return Ok(Some(event));
        }
    }
}
