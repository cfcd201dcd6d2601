//! Dump text buffer and span editing
//!
//! Passes never mutate the dump in place. Each pass inspects a [`DumpBuffer`]
//! and returns a batch of [`SpanEdit`]s against it; [`DumpBuffer::apply`]
//! then builds the rewritten text in a single left-to-right sweep. Offsets in
//! a batch always refer to the buffer the batch was planned against, so edits
//! never invalidate each other.

use std::ops::Range;
use thiserror::Error;

/// Structural inconsistencies detected while applying an edit batch.
///
/// These indicate a bug in a pass rather than odd input: the run is aborted
/// and no output is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DumpError {
    #[error("edit {start}..{end} is out of bounds for a dump of {len} bytes")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("edit {start}..{end} does not fall on a character boundary")]
    NotCharBoundary { start: usize, end: usize },

    #[error("edit {start}..{end} overlaps a previous edit ending at {previous_end}")]
    Overlapping {
        start: usize,
        end: usize,
        previous_end: usize,
    },
}

/// Replace the bytes in `range` with `replacement`.
///
/// An empty range is a pure insertion, an empty replacement a pure deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEdit {
    pub range: Range<usize>,
    pub replacement: String,
}

impl SpanEdit {
    pub fn replace(range: Range<usize>, replacement: impl Into<String>) -> Self {
        Self {
            range,
            replacement: replacement.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::replace(at..at, text)
    }

    pub fn delete(range: Range<usize>) -> Self {
        Self::replace(range, String::new())
    }

    fn is_insertion(&self) -> bool {
        self.range.is_empty()
    }
}

/// The full text of a schema dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpBuffer {
    text: String,
}

impl DumpBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Offset of the first byte of the line containing `offset`.
    pub fn line_start(&self, offset: usize) -> usize {
        self.text[..offset].rfind('\n').map_or(0, |i| i + 1)
    }

    /// Offset just past the newline terminating the line containing `offset`,
    /// or the end of the buffer for an unterminated last line.
    pub fn line_end(&self, offset: usize) -> usize {
        self.text[offset..]
            .find('\n')
            .map_or(self.text.len(), |i| offset + i + 1)
    }

    /// Walk backwards from `line_start` over whitespace-only lines and return
    /// the start of the first one. Returns `line_start` itself when the
    /// preceding line has content.
    pub fn blank_lines_before(&self, line_start: usize) -> usize {
        let mut start = line_start;
        while start > 0 {
            let previous = self.line_start(start - 1);
            if self.text[previous..start].trim().is_empty() {
                start = previous;
            } else {
                break;
            }
        }
        start
    }

    /// Walk forwards from `line_start` over whitespace-only lines and return
    /// the start of the first line with content, or the end of the buffer.
    pub fn blank_lines_after(&self, line_start: usize) -> usize {
        let mut end = line_start;
        while end < self.text.len() {
            let next = self.line_end(end);
            if self.text[end..next].trim().is_empty() {
                end = next;
            } else {
                break;
            }
        }
        end
    }

    /// True if the line starting at `line_start` holds only whitespace.
    /// The end of the buffer counts as not blank.
    pub fn is_blank_line(&self, line_start: usize) -> bool {
        line_start < self.text.len()
            && self.text[line_start..self.line_end(line_start)].trim().is_empty()
    }

    /// Terminator of the line containing `offset`: `"\r\n"` for CRLF lines,
    /// `"\n"` otherwise (including an unterminated last line).
    pub fn line_terminator(&self, offset: usize) -> &'static str {
        if self.text[..self.line_end(offset)].ends_with("\r\n") {
            "\r\n"
        } else {
            "\n"
        }
    }

    /// Apply a batch of edits planned against this buffer and return the
    /// rewritten buffer.
    ///
    /// Edits may be given in any order. They are sorted by position; an
    /// insertion at offset `n` lands before a replacement that starts at `n`,
    /// and insertions sharing an offset keep their relative order.
    pub fn apply(&self, mut edits: Vec<SpanEdit>) -> Result<DumpBuffer, DumpError> {
        if edits.is_empty() {
            return Ok(self.clone());
        }

        edits.sort_by_key(|e| (e.range.start, !e.is_insertion(), e.range.end));

        let len = self.text.len();
        let mut out = String::with_capacity(len);
        let mut cursor = 0;

        for edit in &edits {
            let Range { start, end } = edit.range;
            if start > end || end > len {
                return Err(DumpError::OutOfBounds { start, end, len });
            }
            if !self.text.is_char_boundary(start) || !self.text.is_char_boundary(end) {
                return Err(DumpError::NotCharBoundary { start, end });
            }
            if start < cursor {
                return Err(DumpError::Overlapping {
                    start,
                    end,
                    previous_end: cursor,
                });
            }

            out.push_str(&self.text[cursor..start]);
            out.push_str(&edit.replacement);
            cursor = end;
        }
        out.push_str(&self.text[cursor..]);

        Ok(DumpBuffer::new(out))
    }
}
