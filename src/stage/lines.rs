//! Line framing: raw bytes to one message per line, and back.

use super::{Flow, Stage, StageContext, StageDump};
use crate::buffer::ByteBuffer;
use crate::event::{Event, MessageHead};

/// Frames a raw byte stream into one message per `\n`-terminated line.
///
/// The delimiter (and a preceding `\r`) is stripped. Partial lines are
/// carried across `Data` events as views, not copies. A trailing partial
/// line is flushed as a final message at `StreamEnd`.
pub struct SplitLines {
    max_line_bytes: Option<usize>,
    partial: ByteBuffer,
    /// Bytes of `partial` already known to hold no delimiter.
    scanned: usize,
    overlong: bool,
    lines: u64,
}

impl SplitLines {
    pub fn new(max_line_bytes: Option<usize>) -> Self {
        Self {
            max_line_bytes,
            partial: ByteBuffer::new(),
            scanned: 0,
            overlong: false,
            lines: 0,
        }
    }

    fn clear_partial(&mut self) {
        self.partial.clear();
        self.scanned = 0;
    }

    fn too_long(&self, len: usize) -> bool {
        self.max_line_bytes.is_some_and(|max| len > max)
    }

    fn emit_line(&mut self, mut line: ByteBuffer, cx: &mut StageContext<'_>) {
        let len = line.size();
        if len > 0 && line.slice(len - 1, 1).to_contiguous().as_ref() == b"\r" {
            line = line.slice(0, len - 1);
        }
        if self.too_long(line.size()) {
            cx.violation(format!("line of {} bytes exceeds the limit", line.size()));
            return;
        }

        self.lines += 1;
        cx.emit(Event::MessageStart(MessageHead::new()));
        if !line.is_empty() {
            cx.emit(Event::Data(line));
        }
        cx.emit(Event::MessageEnd);
    }

    fn on_data(&mut self, data: ByteBuffer, cx: &mut StageContext<'_>) {
        self.partial.append(data);

        while let Some(pos) = self.partial.find_from(b'\n', self.scanned) {
            self.scanned = 0;
            let line = self.partial.shift(pos + 1).slice(0, pos);
            if self.overlong {
                // Tail of a line already reported.
                self.overlong = false;
                continue;
            }
            self.emit_line(line, cx);
        }

        self.scanned = self.partial.size();

        if self.overlong {
            self.clear_partial();
        } else if self.too_long(self.partial.size()) {
            cx.violation(format!(
                "unterminated line of {} bytes exceeds the limit",
                self.partial.size()
            ));
            self.clear_partial();
            self.overlong = true;
        }
    }
}

impl Stage for SplitLines {
    fn name(&self) -> &'static str {
        "split-lines"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(SplitLines::new(self.max_line_bytes))
    }

    fn reset(&mut self) {
        self.clear_partial();
        self.overlong = false;
        self.lines = 0;
    }

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        match event {
            Event::Data(data) => self.on_data(data, cx),
            Event::StreamEnd(error) => {
                if !self.partial.is_empty() && !self.overlong {
                    let rest = std::mem::take(&mut self.partial);
                    self.emit_line(rest, cx);
                }
                self.clear_partial();
                cx.emit(Event::StreamEnd(error));
            }
            other => cx.emit(other),
        }
        Flow::Ready
    }

    fn dump(&self, out: &mut StageDump) {
        out.counter("lines", self.lines);
        out.counter("partial_bytes", self.partial.size() as u64);
    }
}

/// Inverse of [`SplitLines`]: writes each message back out as one line.
///
/// `Error` events become `error: <kind>` lines so a line-oriented client
/// sees them.
pub struct JoinLines {
    lines: u64,
    errors: u64,
}

impl JoinLines {
    pub fn new() -> Self {
        Self { lines: 0, errors: 0 }
    }
}

impl Default for JoinLines {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for JoinLines {
    fn name(&self) -> &'static str {
        "join-lines"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(JoinLines::new())
    }

    fn reset(&mut self) {
        self.lines = 0;
        self.errors = 0;
    }

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        match event {
            Event::MessageStart(_) => {}
            Event::MessageEnd => {
                self.lines += 1;
                cx.emit(Event::data("\n"));
            }
            Event::Error(error) => {
                self.errors += 1;
                cx.emit(Event::data(format!("error: {}\n", error.kind())));
            }
            other => cx.emit(other),
        }
        Flow::Ready
    }

    fn dump(&self, out: &mut StageDump) {
        out.counter("lines", self.lines);
        out.counter("errors", self.errors);
    }
}
