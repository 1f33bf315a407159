#![forbid(unsafe_code)]

//! Processor chains.
//!
//! The inbound chain is a vector of processors between the event source
//! and the caller; each processor pulls from the stage nearer the source
//! and may buffer, expand, or tap the events flowing through it.
//! Structural mutations requested while an event is in flight are queued
//! and applied between top-level pulls, so a handler never mutates the
//! list it is being iterated from; newly added processors see events from
//! the next pull onward.
//!
//! The outbound chain is the push-mode mirror: events written by the
//! application flow through the processors toward the serializer sink.

use crate::config::XmlSecurityProperties;
use crate::context::{DocumentContext, ProcessorId, SecurityContext};
use forsmark_core::{Result, XmlSecEvent};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared state every processor can reach while handling an event.
pub struct PipelineContext {
    pub document: Rc<DocumentContext>,
    pub security: Rc<SecurityContext>,
    pub properties: Rc<XmlSecurityProperties>,
    ops: RefCell<Vec<ChainOp>>,
    next_id: Cell<ProcessorId>,
}

enum ChainOp {
    /// Insert on the caller side of the processor with the given id.
    AddAfter(ProcessorId, Box<dyn InputProcessor>),
    Remove(ProcessorId),
}

impl PipelineContext {
    pub fn new(
        document: Rc<DocumentContext>,
        security: Rc<SecurityContext>,
        properties: Rc<XmlSecurityProperties>,
    ) -> Self {
        Self {
            document,
            security,
            properties,
            ops: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    pub fn allocate_id(&self) -> ProcessorId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Queue insertion of a processor on the caller side of `anchor`.
    pub fn add_processor_after(&self, anchor: ProcessorId, processor: Box<dyn InputProcessor>) {
        self.ops
            .borrow_mut()
            .push(ChainOp::AddAfter(anchor, processor));
    }

    /// Queue removal of a processor; its content flags lift with it.
    pub fn remove_processor(&self, id: ProcessorId) {
        self.ops.borrow_mut().push(ChainOp::Remove(id));
    }
}

/// An inbound pipeline stage.
pub trait InputProcessor {
    fn id(&self) -> ProcessorId;

    /// Produce the next event, pulling from `upstream` as needed.
    fn next_event(
        &mut self,
        upstream: &mut dyn EventSource,
        ctx: &PipelineContext,
    ) -> Result<Option<XmlSecEvent>>;

    /// Called once after the source is exhausted.
    fn finish(&mut self, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }
}

/// Anything a processor can pull events from: the rest of the chain, or
/// the document source itself.
pub trait EventSource {
    fn next_event(&mut self, ctx: &PipelineContext) -> Result<Option<XmlSecEvent>>;
}

/// A plain buffered event source feeding the chain.
pub struct VecEventSource {
    events: VecDeque<XmlSecEvent>,
}

impl VecEventSource {
    pub fn new(events: Vec<XmlSecEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

impl EventSource for VecEventSource {
    fn next_event(&mut self, _ctx: &PipelineContext) -> Result<Option<XmlSecEvent>> {
        Ok(self.events.pop_front())
    }
}

/// A view of the chain segment between a processor and the source.
struct ChainSegment<'a> {
    processors: &'a mut [Box<dyn InputProcessor>],
    source: &'a mut dyn EventSource,
}

impl EventSource for ChainSegment<'_> {
    fn next_event(&mut self, ctx: &PipelineContext) -> Result<Option<XmlSecEvent>> {
        match self.processors.split_last_mut() {
            None => self.source.next_event(ctx),
            Some((outermost, rest)) => {
                let mut segment = ChainSegment {
                    processors: rest,
                    source: &mut *self.source,
                };
                outermost.next_event(&mut segment, ctx)
            }
        }
    }
}

/// The inbound processor chain: source-side processor first.
pub struct InputProcessorChain {
    processors: Vec<Box<dyn InputProcessor>>,
    source: Box<dyn EventSource>,
}

impl InputProcessorChain {
    pub fn new(source: Box<dyn EventSource>) -> Self {
        Self {
            processors: Vec::new(),
            source,
        }
    }

    /// Append a processor on the caller side of the existing ones.
    pub fn push(&mut self, processor: Box<dyn InputProcessor>) {
        self.processors.push(processor);
    }

    /// Pull one event through every processor, then apply any queued
    /// structural mutations.
    pub fn next_event(&mut self, ctx: &PipelineContext) -> Result<Option<XmlSecEvent>> {
        let mut segment = ChainSegment {
            processors: &mut self.processors,
            source: &mut *self.source,
        };
        let event = segment.next_event(ctx);
        self.apply_ops(ctx);
        event
    }

    /// Run every processor's finish hook, source side first.
    pub fn finish(&mut self, ctx: &PipelineContext) -> Result<()> {
        let mut processors = std::mem::take(&mut self.processors);
        let mut result = Ok(());
        for processor in processors.iter_mut() {
            if let Err(e) = processor.finish(ctx) {
                result = Err(e);
                break;
            }
        }
        self.processors = processors;
        self.apply_ops(ctx);
        result
    }

    fn apply_ops(&mut self, ctx: &PipelineContext) {
        let ops = std::mem::take(&mut *ctx.ops.borrow_mut());
        for op in ops {
            match op {
                ChainOp::AddAfter(anchor, processor) => {
                    let at = self
                        .processors
                        .iter()
                        .position(|p| p.id() == anchor)
                        .map(|i| i + 1)
                        .unwrap_or(self.processors.len());
                    self.processors.insert(at, processor);
                }
                ChainOp::Remove(id) => {
                    self.processors.retain(|p| p.id() != id);
                    ctx.document.unset_content_flag(id);
                }
            }
        }
    }
}

/// An outbound pipeline stage.
pub trait OutputProcessor {
    fn id(&self) -> ProcessorId;

    /// Handle one event, forwarding whatever should continue downstream.
    fn write_event(
        &mut self,
        event: XmlSecEvent,
        downstream: &mut dyn EventSink,
        ctx: &PipelineContext,
    ) -> Result<()>;

    /// Flush any buffered state at the end of the document.
    fn close(&mut self, _downstream: &mut dyn EventSink, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }
}

/// Anything a processor can push events into: the rest of the chain, or
/// the final serializer.
pub trait EventSink {
    fn write_event(&mut self, event: XmlSecEvent, ctx: &PipelineContext) -> Result<()>;

    /// Flush buffered output; called once when the chain closes.
    fn flush_sink(&mut self, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }
}

struct SinkSegment<'a> {
    processors: &'a mut [Box<dyn OutputProcessor>],
    sink: &'a mut dyn EventSink,
}

impl EventSink for SinkSegment<'_> {
    fn write_event(&mut self, event: XmlSecEvent, ctx: &PipelineContext) -> Result<()> {
        match self.processors.split_first_mut() {
            None => self.sink.write_event(event, ctx),
            Some((first, rest)) => {
                let mut segment = SinkSegment {
                    processors: rest,
                    sink: &mut *self.sink,
                };
                first.write_event(event, &mut segment, ctx)
            }
        }
    }
}

/// The outbound processor chain: caller-side processor first.
pub struct OutputProcessorChain {
    processors: Vec<Box<dyn OutputProcessor>>,
    sink: Box<dyn EventSink>,
}

impl OutputProcessorChain {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            processors: Vec::new(),
            sink,
        }
    }

    pub fn push(&mut self, processor: Box<dyn OutputProcessor>) {
        self.processors.push(processor);
    }

    pub fn write_event(&mut self, event: XmlSecEvent, ctx: &PipelineContext) -> Result<()> {
        let mut segment = SinkSegment {
            processors: &mut self.processors,
            sink: &mut *self.sink,
        };
        segment.write_event(event, ctx)
    }

    /// Close processors caller side first, so each can flush through the
    /// ones below it.
    pub fn close(&mut self, ctx: &PipelineContext) -> Result<()> {
        for i in 0..self.processors.len() {
            let (head, tail) = self.processors.split_at_mut(i + 1);
            let processor = &mut head[i];
            let mut segment = SinkSegment {
                processors: tail,
                sink: &mut *self.sink,
            };
            processor.close(&mut segment, ctx)?;
        }
        self.sink.flush_sink(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forsmark_core::QName;

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(
            Rc::new(DocumentContext::new(None)),
            SecurityContext::new(),
            Rc::new(XmlSecurityProperties::new()),
        )
    }

    /// Tags each event by appending its marker to a shared log.
    struct Tagger {
        id: ProcessorId,
        marker: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl InputProcessor for Tagger {
        fn id(&self) -> ProcessorId {
            self.id
        }

        fn next_event(
            &mut self,
            upstream: &mut dyn EventSource,
            ctx: &PipelineContext,
        ) -> Result<Option<XmlSecEvent>> {
            let event = upstream.next_event(ctx)?;
            if event.is_some() {
                self.log.borrow_mut().push(self.marker.to_owned());
            }
            Ok(event)
        }
    }

    /// Inserts a Tagger after itself upon seeing the first event.
    struct Inserter {
        id: ProcessorId,
        log: Rc<RefCell<Vec<String>>>,
        inserted: bool,
    }

    impl InputProcessor for Inserter {
        fn id(&self) -> ProcessorId {
            self.id
        }

        fn next_event(
            &mut self,
            upstream: &mut dyn EventSource,
            ctx: &PipelineContext,
        ) -> Result<Option<XmlSecEvent>> {
            let event = upstream.next_event(ctx)?;
            if !self.inserted && event.is_some() {
                self.inserted = true;
                ctx.add_processor_after(
                    self.id,
                    Box::new(Tagger {
                        id: ctx.allocate_id(),
                        marker: "late",
                        log: self.log.clone(),
                    }),
                );
            }
            Ok(event)
        }
    }

    fn three_events() -> Vec<XmlSecEvent> {
        vec![
            XmlSecEvent::characters("1"),
            XmlSecEvent::characters("2"),
            XmlSecEvent::characters("3"),
        ]
    }

    #[test]
    fn test_events_flow_source_to_caller() {
        let ctx = test_ctx();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = InputProcessorChain::new(Box::new(VecEventSource::new(three_events())));
        chain.push(Box::new(Tagger {
            id: ctx.allocate_id(),
            marker: "inner",
            log: log.clone(),
        }));
        chain.push(Box::new(Tagger {
            id: ctx.allocate_id(),
            marker: "outer",
            log: log.clone(),
        }));

        assert!(chain.next_event(&ctx).unwrap().is_some());
        assert_eq!(*log.borrow(), vec!["inner", "outer"]);
    }

    #[test]
    fn test_late_added_processor_sees_later_events() {
        let ctx = test_ctx();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = InputProcessorChain::new(Box::new(VecEventSource::new(three_events())));
        chain.push(Box::new(Inserter {
            id: ctx.allocate_id(),
            log: log.clone(),
            inserted: false,
        }));

        // First pull: inserter requests the addition; tagger not yet live.
        chain.next_event(&ctx).unwrap();
        assert!(log.borrow().is_empty());
        // Second and third pulls flow through the late processor.
        chain.next_event(&ctx).unwrap();
        chain.next_event(&ctx).unwrap();
        assert_eq!(*log.borrow(), vec!["late", "late"]);
    }

    #[test]
    fn test_removal_lifts_content_flags() {
        use crate::context::ContentFlag;
        let ctx = test_ctx();
        let id = ctx.allocate_id();
        let mut chain = InputProcessorChain::new(Box::new(VecEventSource::new(three_events())));
        chain.push(Box::new(Tagger {
            id,
            marker: "x",
            log: Rc::new(RefCell::new(Vec::new())),
        }));
        ctx.document.set_content_flag(id, ContentFlag::Signed);
        assert!(ctx.document.is_in_signed_content());

        ctx.remove_processor(id);
        chain.next_event(&ctx).unwrap();
        assert!(!ctx.document.is_in_signed_content());
    }
}
