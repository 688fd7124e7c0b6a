// This module owns diagnostic reporting. MessageSink is a cloneable handle to a shared
// writer (stderr, stdout, or an in-memory capture buffer used by tests) guarded by a
// parking_lot mutex so concurrent contexts can share one sink. Diagnostics wraps a sink
// for one compile call and formats messages in the conventional compiler shape
// "file:line:col: error: msg", keeps error and warning counts, applies the
// ignore-warnings and pedantic switches, and prints internal compiler errors with a
// distinct prefix so they are never mistaken for problems in the user's program.

//! Diagnostic sink and per-compile reporting.

use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

enum SinkTarget {
    Stderr,
    Stdout,
    Buffer(Vec<u8>),
    Writer(Box<dyn Write + Send>),
}

/// Shared destination for compiler messages.
#[derive(Clone)]
pub struct MessageSink {
    target: Arc<Mutex<SinkTarget>>,
}

impl fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.target.lock() {
            SinkTarget::Stderr => "stderr",
            SinkTarget::Stdout => "stdout",
            SinkTarget::Buffer(_) => "buffer",
            SinkTarget::Writer(_) => "writer",
        };
        f.debug_tuple("MessageSink").field(&kind).finish()
    }
}

impl MessageSink {
    pub fn stderr() -> Self {
        Self::from_target(SinkTarget::Stderr)
    }

    pub fn stdout() -> Self {
        Self::from_target(SinkTarget::Stdout)
    }

    /// A sink that records everything written to it; see [`MessageSink::contents`].
    pub fn capture() -> Self {
        Self::from_target(SinkTarget::Buffer(Vec::new()))
    }

    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self::from_target(SinkTarget::Writer(Box::new(w)))
    }

    fn from_target(target: SinkTarget) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
        }
    }

    /// Write raw text. Write failures on the sink are ignored.
    pub fn write_str(&self, text: &str) {
        let mut target = self.target.lock();
        let _ = match &mut *target {
            SinkTarget::Stderr => std::io::stderr().write_all(text.as_bytes()),
            SinkTarget::Stdout => std::io::stdout().write_all(text.as_bytes()),
            SinkTarget::Buffer(buf) => {
                buf.extend_from_slice(text.as_bytes());
                Ok(())
            }
            SinkTarget::Writer(w) => w.write_all(text.as_bytes()),
        };
    }

    pub fn flush(&self) {
        let mut target = self.target.lock();
        let _ = match &mut *target {
            SinkTarget::Stderr => std::io::stderr().flush(),
            SinkTarget::Stdout => std::io::stdout().flush(),
            SinkTarget::Buffer(_) => Ok(()),
            SinkTarget::Writer(w) => w.flush(),
        };
    }

    /// Captured text for a [`MessageSink::capture`] sink, empty otherwise.
    pub fn contents(&self) -> String {
        match &*self.target.lock() {
            SinkTarget::Buffer(buf) => String::from_utf8_lossy(buf).into_owned(),
            _ => String::new(),
        }
    }
}

/// Source position used in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub file: Arc<str>,
    pub line: u32,
    pub col: u32,
}

impl SourcePos {
    pub fn new(file: Arc<str>, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.col)
        }
    }
}

/// Reporter for one compile call.
pub struct Diagnostics {
    sink: MessageSink,
    source_name: Arc<str>,
    ignore_warnings: bool,
    pedantic: bool,
    errors: usize,
    warnings: usize,
}

impl Diagnostics {
    pub fn new(sink: MessageSink, source_name: &str, ignore_warnings: bool, pedantic: bool) -> Self {
        Self {
            sink,
            source_name: Arc::from(source_name),
            ignore_warnings,
            pedantic,
            errors: 0,
            warnings: 0,
        }
    }

    pub fn source_name(&self) -> &Arc<str> {
        &self.source_name
    }

    pub fn error(&mut self, pos: &SourcePos, msg: impl fmt::Display) {
        self.errors += 1;
        self.sink.write_str(&format!("{pos}: error: {msg}\n"));
    }

    pub fn warning(&mut self, pos: &SourcePos, msg: impl fmt::Display) {
        if self.ignore_warnings {
            return;
        }
        self.warnings += 1;
        self.sink.write_str(&format!("{pos}: warning: {msg}\n"));
    }

    /// A construct accepted as an extension: a warning, or an error under `pedantic`.
    pub fn extension(&mut self, pos: &SourcePos, msg: impl fmt::Display) {
        if self.pedantic {
            self.error(pos, msg);
        } else {
            self.warning(pos, msg);
        }
    }

    /// Report a broken IR contract or backend failure.
    pub fn internal(&mut self, msg: impl fmt::Display) {
        self.errors += 1;
        self.sink.write_str(&format!(
            "{}: internal compiler error: {msg}\n",
            self.source_name
        ));
    }

    /// Free-form informational output (verbose mode).
    pub fn note(&mut self, msg: impl fmt::Display) {
        self.sink.write_str(&format!("{msg}\n"));
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn sink(&self) -> &MessageSink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        let sink = MessageSink::capture();
        let mut diag = Diagnostics::new(sink.clone(), "t.c", false, false);
        let pos = SourcePos::new(Arc::from("t.c"), 3, 7);
        diag.error(&pos, "boom");
        diag.warning(&pos, "hmm");
        diag.internal("bad operand");
        assert_eq!(diag.error_count(), 2);
        assert_eq!(diag.warning_count(), 1);
        assert_eq!(
            sink.contents(),
            "t.c:3:7: error: boom\nt.c:3:7: warning: hmm\nt.c: internal compiler error: bad operand\n"
        );
    }

    #[test]
    fn test_pedantic_and_ignore_warnings() {
        let sink = MessageSink::capture();
        let pos = SourcePos::new(Arc::from("x.c"), 1, 1);

        let mut quiet = Diagnostics::new(sink.clone(), "x.c", true, false);
        quiet.extension(&pos, "implicit declaration");
        assert!(!quiet.has_errors());
        assert!(sink.contents().is_empty());

        let mut strict = Diagnostics::new(sink.clone(), "x.c", true, true);
        strict.extension(&pos, "implicit declaration");
        assert!(strict.has_errors());
        assert!(sink.contents().contains("error: implicit declaration"));
    }
}
