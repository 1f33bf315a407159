#![forbid(unsafe_code)]

//! The inbound entry point: wrap an event sequence and pull events out
//! while signatures verify and encrypted content decrypts in passing.

use crate::chain::{InputProcessorChain, PipelineContext, VecEventSource};
use crate::config::XmlSecurityProperties;
use crate::context::{DocumentContext, SecurityContext, SignatureVerificationResult};
use crate::input::decrypt::DecryptInputProcessor;
use crate::input::security_header::SecurityHeaderProcessor;
use crate::security_event::SecurityEvent;
use forsmark_core::{Result, XmlSecEvent};
use std::rc::Rc;

/// Configured inbound engine; one instance can process many documents.
pub struct InboundXmlSec {
    properties: Rc<XmlSecurityProperties>,
}

impl InboundXmlSec {
    pub fn new(properties: XmlSecurityProperties) -> Result<Self> {
        properties.validate_inbound()?;
        Ok(Self {
            properties: Rc::new(properties),
        })
    }

    /// Begin processing one document's events.
    pub fn process(&self, events: Vec<XmlSecEvent>) -> Result<XmlSecReader> {
        let ctx = PipelineContext::new(
            Rc::new(DocumentContext::new(self.properties.base_uri.clone())),
            SecurityContext::new(),
            self.properties.clone(),
        );

        let mut chain = InputProcessorChain::new(Box::new(VecEventSource::new(events)));
        // Decryption sits closest to the source so the signature scanner,
        // and every verifier it installs, sees plaintext events.
        if self.properties.decryption {
            chain.push(Box::new(DecryptInputProcessor::new(ctx.allocate_id())));
        }
        let header_id = ctx.allocate_id();
        chain.push(Box::new(SecurityHeaderProcessor::new(
            header_id,
            header_id,
            self.properties.signature_verification,
        )));

        Ok(XmlSecReader {
            chain,
            ctx,
            finished: false,
        })
    }
}

/// Pull-mode reader over the secured document.
pub struct XmlSecReader {
    chain: InputProcessorChain,
    ctx: PipelineContext,
    finished: bool,
}

impl XmlSecReader {
    /// The next document event, or `None` once the stream is exhausted
    /// and all end-of-document checks have run.
    pub fn next_event(&mut self) -> Result<Option<XmlSecEvent>> {
        if self.finished {
            return Ok(None);
        }
        match self.chain.next_event(&self.ctx)? {
            Some(event) => Ok(Some(event)),
            None => {
                self.chain.finish(&self.ctx)?;
                self.check_required_actions()?;
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn check_required_actions(&self) -> Result<()> {
        use crate::config::Action;
        use crate::security_event::KeyUsage;
        for action in &self.ctx.properties.required_actions {
            let satisfied = match action {
                Action::Sign => !self.ctx.security.results().is_empty(),
                Action::Encrypt => self.ctx.security.recorded_events().iter().any(|e| {
                    matches!(
                        e,
                        SecurityEvent::AlgorithmUsed {
                            usage: KeyUsage::Decryption,
                            ..
                        }
                    )
                }),
            };
            if !satisfied {
                return Err(forsmark_core::Error::InvalidSecurity(format!(
                    "required action {action:?} was not performed"
                )));
            }
        }
        Ok(())
    }

    /// Drain the remaining events.
    pub fn read_to_end(&mut self) -> Result<Vec<XmlSecEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    /// Per-signature verification results, in document order; complete
    /// once `next_event` has returned `None`.
    pub fn verification_results(&self) -> Vec<SignatureVerificationResult> {
        self.ctx.security.results()
    }

    /// Whether every signature seen verified successfully.
    pub fn verified(&self) -> bool {
        let results = self.verification_results();
        !results.is_empty() && results.iter().all(|r| r.valid)
    }

    /// All security events emitted while processing, in order.
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.ctx.security.recorded_events()
    }
}
