//! Serializer sinks that turn event streams back into bytes.

use std::io::Write;

use crate::errors::BuildError;
use crate::event::{Event, EventSink};

/// Serializes a document event stream as XML markup.
///
/// Elements with no content are minimized to the `<name/>` form. Output is
/// flushed when `EndDocument` arrives.
#[derive(Debug)]
pub struct XmlWriterSink<W: Write> {
    out: W,
    pending_open: Option<(String, Vec<(String, String)>)>,
    wrote_declaration: bool,
}

impl<W: Write> XmlWriterSink<W> {
    /// Creates a serializer writing markup into `out`.
    #[must_use]
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending_open: None,
            wrote_declaration: false,
        }
    }

    fn flush_pending(&mut self, minimize: bool) -> std::io::Result<bool> {
        if let Some((name, attrs)) = self.pending_open.take() {
            self.out.write_all(b"<")?;
            self.out.write_all(name.as_bytes())?;
            for (attr, value) in &attrs {
                write!(self.out, " {}=\"{}\"", attr, escape_attr(value))?;
            }
            if minimize {
                self.out.write_all(b"/>")?;
                return Ok(true);
            }
            self.out.write_all(b">")?;
        }
        Ok(false)
    }
}

impl<W: Write> EventSink for XmlWriterSink<W> {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        match event {
            Event::StartDocument => {
                if !self.wrote_declaration {
                    self.out
                        .write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
                    self.wrote_declaration = true;
                }
            }
            Event::EndDocument => {
                self.flush_pending(false)?;
                self.out.flush()?;
            }
            Event::StartElement { name, attrs } => {
                self.flush_pending(false)?;
                self.pending_open = Some((name, attrs));
            }
            Event::EndElement { name } => {
                if !self.flush_pending(true)? {
                    write!(self.out, "</{name}>")?;
                }
            }
            Event::Text(text) => {
                self.flush_pending(false)?;
                self.out.write_all(escape_text(&text).as_bytes())?;
            }
            Event::Comment(text) => {
                self.flush_pending(false)?;
                write!(self.out, "<!--{text}-->")?;
            }
        }
        Ok(())
    }
}

/// Serializes only the character data of an event stream.
///
/// Markup structure is dropped; `Text` events are written verbatim.
#[derive(Debug)]
pub struct TextWriterSink<W: Write> {
    out: W,
}

impl<W: Write> TextWriterSink<W> {
    /// Creates a plain-text serializer writing into `out`.
    #[must_use]
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for TextWriterSink<W> {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        match event {
            Event::Text(text) => self.out.write_all(text.as_bytes())?,
            Event::EndDocument => self.out.flush()?,
            _ => {}
        }
        Ok(())
    }
}

fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn serialize(events: Vec<Event>) -> String {
        let mut buf = Vec::new();
        let mut sink = XmlWriterSink::new(&mut buf);
        for event in events {
            sink.handle(event).unwrap();
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_xml_writer_basic_document() {
        let markup = serialize(vec![
            Event::StartDocument,
            Event::open_with("page", vec![("id".into(), "home".into())]),
            Event::open("title"),
            Event::text("Hello"),
            Event::close("title"),
            Event::close("page"),
            Event::EndDocument,
        ]);
        assert_eq!(
            markup,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<page id=\"home\"><title>Hello</title></page>"
        );
    }

    #[test]
    fn test_xml_writer_minimizes_empty_elements() {
        let markup = serialize(vec![
            Event::StartDocument,
            Event::open("page"),
            Event::open("hr"),
            Event::close("hr"),
            Event::close("page"),
            Event::EndDocument,
        ]);
        assert!(markup.ends_with("<page><hr/></page>"));
    }

    #[test]
    fn test_xml_writer_escapes_text_and_attrs() {
        let markup = serialize(vec![
            Event::StartDocument,
            Event::open_with("a", vec![("href".into(), "x?a=1&b=\"2\"".into())]),
            Event::text("1 < 2 & 3 > 2"),
            Event::close("a"),
            Event::EndDocument,
        ]);
        assert!(markup.contains("href=\"x?a=1&amp;b=&quot;2&quot;\""));
        assert!(markup.contains("1 &lt; 2 &amp; 3 &gt; 2"));
    }

    #[test]
    fn test_xml_writer_comments() {
        let markup = serialize(vec![
            Event::StartDocument,
            Event::open("page"),
            Event::Comment("generated".into()),
            Event::close("page"),
            Event::EndDocument,
        ]);
        assert!(markup.contains("<!--generated-->"));
    }

    #[test]
    fn test_text_writer_drops_markup() {
        let mut buf = Vec::new();
        let mut sink = TextWriterSink::new(&mut buf);
        for event in [
            Event::StartDocument,
            Event::open("page"),
            Event::text("plain "),
            Event::open("b"),
            Event::text("text"),
            Event::close("b"),
            Event::close("page"),
            Event::EndDocument,
        ] {
            sink.handle(event).unwrap();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "plain text");
    }
}
