/*
 * output.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Output sinks.
//!
//! The engine writes rendered text through a [`OutputSink`]. The current
//! sink is swappable mid-execution: attempted sections temporarily point
//! the engine at a buffer, and directive bodies imported as a library run
//! against [`NullSink`] so their literal text is discarded.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Append-only destination for rendered template output.
pub trait OutputSink {
    fn write_str(&mut self, text: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Sink that collects output into a shared string buffer.
///
/// Clones share the same buffer, so a caller can keep one handle and hand
/// another to the engine:
///
/// ```ignore
/// let sink = StringSink::new();
/// let mut env = Environment::new(config, template, data, Box::new(sink.clone()));
/// env.process()?;
/// let rendered = sink.into_string();
/// ```
#[derive(Debug, Clone, Default)]
pub struct StringSink {
    buf: Rc<RefCell<String>>,
}

impl StringSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the buffer contents so far.
    pub fn contents(&self) -> String {
        self.buf.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.borrow().is_empty()
    }

    /// Consume this handle, returning the buffer contents. Other clones
    /// keep observing the shared buffer.
    pub fn into_string(self) -> String {
        self.contents()
    }
}

impl OutputSink for StringSink {
    fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.buf.borrow_mut().push_str(text);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_str(&mut self, _text: &str) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that forwards to any [`std::io::Write`].
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    inner: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> OutputSink for WriterSink<W> {
    fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.inner.write_all(text.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_string_sink_clones_share_buffer() {
        let sink = StringSink::new();
        let mut writer = sink.clone();
        writer.write_str("hello ").unwrap();
        writer.write_str("world").unwrap();
        assert_eq!(sink.contents(), "hello world");
    }

    #[test]
    fn test_null_sink_discards() {
        let mut sink = NullSink;
        sink.write_str("gone").unwrap();
        sink.flush().unwrap();
    }

    #[test]
    fn test_writer_sink_forwards() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_str("abc").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.into_inner(), b"abc");
    }
}
