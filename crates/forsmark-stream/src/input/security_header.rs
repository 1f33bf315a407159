#![forbid(unsafe_code)]

//! The innermost inbound processor.
//!
//! Buffers events from the document start until the first signature has
//! been read to its end element, parses the signature structure, checks
//! the SignatureValue, installs the reference dispatcher, and then
//! replays the buffered stream through it. The replay is what lets a
//! one-pass engine verify references that precede or envelop their
//! signature. Standalone EncryptedKey headers register token providers as
//! they are encountered.

use crate::chain::{EventSource, InputProcessor, PipelineContext};
use crate::context::ProcessorId;
use crate::input::signature::{
    verify_signature_value, SignatureState, SignatureVerifyInputProcessor,
};
use crate::input::{collect_subtree, encrypted_key};
use crate::structures::{parse_encrypted_key, parse_signature};
use forsmark_core::{ns, Error, Result, StartElementData, XmlSecEvent};
use std::collections::{BTreeMap, VecDeque};

enum Mode {
    /// Accumulating history until the first signature is complete.
    Buffer,
    /// History replayed; fresh events flow through with scanning only.
    Stream,
}

pub struct SecurityHeaderProcessor {
    id: ProcessorId,
    /// Dispatchers are installed on the caller side of this processor.
    anchor_id: ProcessorId,
    mode: Mode,
    history: Vec<XmlSecEvent>,
    queue: VecDeque<XmlSecEvent>,
    ns_stack: Vec<BTreeMap<String, String>>,
}

impl SecurityHeaderProcessor {
    pub fn new(id: ProcessorId, anchor_id: ProcessorId, buffer_for_signatures: bool) -> Self {
        Self {
            id,
            anchor_id,
            mode: if buffer_for_signatures {
                Mode::Buffer
            } else {
                Mode::Stream
            },
            history: Vec::new(),
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

    fn is_signature_start(data: &StartElementData) -> bool {
        data.name.namespace_uri == ns::DSIG && data.name.local_name == ns::node::SIGNATURE
    }

    /// A header-level EncryptedKey: not inside a Signature's KeyInfo and
    /// not inside an EncryptedData.
    fn is_standalone_encrypted_key(data: &StartElementData) -> bool {
        if data.name.namespace_uri != ns::ENC || data.name.local_name != ns::node::ENCRYPTED_KEY {
            return false;
        }
        let ancestors = &data.element_path[..data.element_path.len().saturating_sub(1)];
        !ancestors.iter().any(|q| {
            (q.namespace_uri == ns::DSIG && q.local_name == ns::node::KEY_INFO)
                || (q.namespace_uri == ns::ENC && q.local_name == ns::node::ENCRYPTED_DATA)
        })
    }

    /// Parse a complete signature subtree, check its SignatureValue, and
    /// queue the dispatcher installation.
    fn process_signature(
        &mut self,
        subtree: &[XmlSecEvent],
        parent_scope: BTreeMap<String, String>,
        ctx: &PipelineContext,
    ) -> Result<()> {
        // Bindings in scope at SignedInfo include the Signature element's
        // own declarations.
        let mut inscope = parent_scope;
        if let Some(XmlSecEvent::StartElement(data)) = subtree.first() {
            for decl in &data.namespaces {
                if decl.uri.is_empty() {
                    inscope.remove(&decl.prefix);
                } else {
                    inscope.insert(decl.prefix.clone(), decl.uri.clone());
                }
            }
        }

        let record = parse_signature(subtree, inscope)?;
        let state = SignatureState::new(&record.id, record.signed_info.references.len());

        // Secure-processing checks happen in the dispatcher constructor,
        // before any cryptographic operation.
        let dispatcher = SignatureVerifyInputProcessor::new(
            ctx.allocate_id(),
            record.clone(),
            &ctx.properties,
            state.clone(),
        )?;

        let valid = verify_signature_value(subtree, &record, &ctx.properties, &ctx.security)?;
        if !valid {
            return Err(Error::SignatureInvalid(record.id));
        }
        state.borrow_mut().signature_valid = true;

        ctx.add_processor_after(self.anchor_id, Box::new(dispatcher));
        Ok(())
    }

    fn handle_encrypted_key(
        &mut self,
        subtree: &[XmlSecEvent],
        ctx: &PipelineContext,
    ) -> Result<()> {
        let record = parse_encrypted_key(subtree)?;
        let path = subtree
            .first()
            .map(|e| e.element_path().to_vec())
            .unwrap_or_default();
        encrypted_key::register_with_path(record, path, &ctx.properties, &ctx.security)?;
        Ok(())
    }
}

impl InputProcessor for SecurityHeaderProcessor {
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
                return Ok(Some(event));
            }

            match self.mode {
                Mode::Stream => {
                    let Some(event) = upstream.next_event(ctx)? else {
                        return Ok(None);
                    };
                    self.track(&event);
                    if let XmlSecEvent::StartElement(data) = &event {
                        if ctx.properties.signature_verification && Self::is_signature_start(data)
                        {
                            let parent_scope =
                                self.ns_stack[self.ns_stack.len() - 2].clone();
                            let subtree = collect_subtree(event, upstream, ctx)?;
                            self.track_end_of_subtree();
                            self.process_signature(&subtree, parent_scope, ctx)?;
                            self.queue.extend(subtree);
                            continue;
                        }
                        if ctx.properties.decryption && Self::is_standalone_encrypted_key(data) {
                            let subtree = collect_subtree(event, upstream, ctx)?;
                            self.track_end_of_subtree();
                            self.handle_encrypted_key(&subtree, ctx)?;
                            self.queue.extend(subtree);
                            continue;
                        }
                    }
                    return Ok(Some(event));
                }
                Mode::Buffer => {
                    let Some(event) = upstream.next_event(ctx)? else {
                        // No signature in the document; replay everything.
                        self.mode = Mode::Stream;
                        self.queue.extend(std::mem::take(&mut self.history));
                        if self.queue.is_empty() {
                            return Ok(None);
                        }
                        continue;
                    };
                    self.track(&event);
                    if let XmlSecEvent::StartElement(data) = &event {
                        if Self::is_signature_start(data) {
                            let parent_scope =
                                self.ns_stack[self.ns_stack.len() - 2].clone();
                            let subtree = collect_subtree(event, upstream, ctx)?;
                            self.track_end_of_subtree();
                            self.process_signature(&subtree, parent_scope, ctx)?;
                            self.history.extend(subtree);
                            self.mode = Mode::Stream;
                            self.queue.extend(std::mem::take(&mut self.history));
                            continue;
                        }
                        if ctx.properties.decryption && Self::is_standalone_encrypted_key(data) {
                            let subtree = collect_subtree(event, upstream, ctx)?;
                            self.track_end_of_subtree();
                            self.handle_encrypted_key(&subtree, ctx)?;
                            self.history.extend(subtree);
                            continue;
                        }
                    }
                    self.history.push(event);
                }
            }
        }
    }
}

impl SecurityHeaderProcessor {
    /// `collect_subtree` consumed the element's end event without going
    /// through `track`; rebalance the namespace stack.
    fn track_end_of_subtree(&mut self) {
        if self.ns_stack.len() > 1 {
            self.ns_stack.pop();
        }
    }
}
