//! Structured document events.
//!
//! Event-typed chain segments carry a stream of [`Event`] values instead of
//! raw bytes. Producers push events into an [`EventSink`]; serializer stages
//! turn the stream back into bytes at the target end of a chain.

mod writer;

pub use writer::{TextWriterSink, XmlWriterSink};

use std::io::Read;

use crate::errors::BuildError;

/// One item in a structured document stream.
///
/// A well-formed stream starts with `StartDocument`, ends with `EndDocument`,
/// and balances every `StartElement` with an `EndElement` of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Opens the document.
    StartDocument,
    /// Closes the document; sinks flush on this event.
    EndDocument,
    /// Opens an element with its attributes in declaration order.
    StartElement {
        /// Element name.
        name: String,
        /// Attribute name/value pairs.
        attrs: Vec<(String, String)>,
    },
    /// Closes the innermost open element.
    EndElement {
        /// Element name, matching the corresponding `StartElement`.
        name: String,
    },
    /// Character data.
    Text(String),
    /// A comment, passed through by serializers.
    Comment(String),
}

impl Event {
    /// Opens an element without attributes.
    #[must_use]
    pub fn open(name: impl Into<String>) -> Self {
        Self::StartElement {
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    /// Opens an element with attributes.
    #[must_use]
    pub fn open_with(name: impl Into<String>, attrs: Vec<(String, String)>) -> Self {
        Self::StartElement {
            name: name.into(),
            attrs,
        }
    }

    /// Closes an element.
    #[must_use]
    pub fn close(name: impl Into<String>) -> Self {
        Self::EndElement { name: name.into() }
    }

    /// Creates a text event.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// Receives a pushed stream of document events.
///
/// Sinks report failures through `Result` so a broken target stops the
/// producing stage immediately.
pub trait EventSink {
    /// Handles the next event in the stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the sink can no longer accept events; the
    /// producer must stop and propagate it.
    fn handle(&mut self, event: Event) -> Result<(), BuildError>;
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        (**self).handle(event)
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        (**self).handle(event)
    }
}

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn handle(&mut self, _event: Event) -> Result<(), BuildError> {
        Ok(())
    }
}

/// A sink that buffers the stream in memory.
///
/// Used by stages that need the whole stream before acting on it, and by
/// tests asserting on produced events.
#[derive(Debug, Default)]
pub struct BufferSink {
    events: Vec<Event>,
}

impl BufferSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffered events in arrival order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consumes the buffer, yielding the events.
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Replays the buffered stream into another sink.
    ///
    /// # Errors
    ///
    /// Propagates the first failure reported by `sink`.
    pub fn replay(&self, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        for event in &self.events {
            sink.handle(event.clone())?;
        }
        Ok(())
    }
}

impl EventSink for BufferSink {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        self.events.push(event);
        Ok(())
    }
}

/// Parses a byte stream into document events.
///
/// The engine does not ship a markup parser; hosts register one on the
/// project context and the `read` and `parse` stages use it.
pub trait EventParser: Send + Sync {
    /// Parses `input` to completion, pushing events into `sink`.
    ///
    /// # Errors
    ///
    /// Returns a parse failure, ideally with a [`crate::errors::SourceLocation`],
    /// or propagates a sink failure.
    fn parse(&self, input: &mut dyn Read, sink: &mut dyn EventSink) -> Result<(), BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_collects_in_order() {
        let mut sink = BufferSink::new();
        sink.handle(Event::StartDocument).unwrap();
        sink.handle(Event::open("page")).unwrap();
        sink.handle(Event::text("hello")).unwrap();
        sink.handle(Event::close("page")).unwrap();
        sink.handle(Event::EndDocument).unwrap();

        assert_eq!(sink.len(), 5);
        assert_eq!(sink.events()[1], Event::open("page"));
        assert_eq!(sink.events()[2], Event::Text("hello".into()));
    }

    #[test]
    fn test_buffer_sink_replay() {
        let mut first = BufferSink::new();
        first.handle(Event::StartDocument).unwrap();
        first.handle(Event::text("x")).unwrap();
        first.handle(Event::EndDocument).unwrap();

        let mut second = BufferSink::new();
        first.replay(&mut second).unwrap();
        assert_eq!(first.events(), second.events());
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.handle(Event::StartDocument).unwrap();
        sink.handle(Event::Comment("ignored".into())).unwrap();
        sink.handle(Event::EndDocument).unwrap();
    }
}
