#![forbid(unsafe_code)]

//! The outbound entry point: wrap a byte sink and push events in while
//! signatures and encrypted elements are produced in passing.

use crate::chain::{EventSink, OutputProcessorChain, PipelineContext};
use crate::config::{Action, XmlSecurityProperties};
use crate::context::{DocumentContext, SecurityContext};
use crate::output::encrypt::EncryptOutputProcessor;
use crate::output::signature::SignatureOutputProcessor;
use crate::writer::EventWriter;
use forsmark_core::{Error, Result, XmlSecEvent};
use std::io::Write;
use std::rc::Rc;

/// Configured outbound engine.
pub struct OutboundXmlSec {
    properties: Rc<XmlSecurityProperties>,
}

impl OutboundXmlSec {
    /// Validate the configuration and apply the documented defaults.
    pub fn new(mut properties: XmlSecurityProperties) -> Result<Self> {
        properties.validate_and_apply_defaults_outbound()?;
        Ok(Self {
            properties: Rc::new(properties),
        })
    }

    /// Begin writing one document into `out`.
    pub fn process(&self, out: Box<dyn Write>) -> Result<XmlSecWriter> {
        let ctx = PipelineContext::new(
            Rc::new(DocumentContext::new(self.properties.base_uri.clone())),
            SecurityContext::new(),
            self.properties.clone(),
        );

        let mut chain = OutputProcessorChain::new(Box::new(SerializerSink {
            writer: EventWriter::new(out),
        }));
        for action in &self.properties.actions {
            match action {
                Action::Sign => {
                    for part in &self.properties.signature_parts {
                        chain.push(Box::new(SignatureOutputProcessor::new(
                            ctx.allocate_id(),
                            part.clone(),
                            self.properties.clone(),
                        )));
                    }
                }
                Action::Encrypt => {
                    for part in &self.properties.encryption_parts {
                        chain.push(Box::new(EncryptOutputProcessor::new(
                            ctx.allocate_id(),
                            part.clone(),
                            self.properties.clone(),
                        )));
                    }
                }
            }
        }

        Ok(XmlSecWriter {
            chain,
            ctx,
            closed: false,
        })
    }
}

struct SerializerSink {
    writer: EventWriter<'static>,
}

impl EventSink for SerializerSink {
    fn write_event(&mut self, event: XmlSecEvent, _ctx: &PipelineContext) -> Result<()> {
        self.writer.event(&event)
    }

    fn flush_sink(&mut self, _ctx: &PipelineContext) -> Result<()> {
        self.writer.finish()
    }
}

/// Push-mode writer over the secured document.
pub struct XmlSecWriter {
    chain: OutputProcessorChain,
    ctx: PipelineContext,
    closed: bool,
}

impl XmlSecWriter {
    pub fn write(&mut self, event: XmlSecEvent) -> Result<()> {
        if self.closed {
            return Err(Error::Io(std::io::Error::other("writer already closed")));
        }
        self.chain.write_event(event, &self.ctx)
    }

    /// Write a whole event sequence.
    pub fn write_all(&mut self, events: Vec<XmlSecEvent>) -> Result<()> {
        for event in events {
            self.write(event)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.chain.close(&self.ctx)?;
        self.closed = true;
        Ok(())
    }
}
