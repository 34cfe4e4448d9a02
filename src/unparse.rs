// turn aggregates back into interchange formats.
// folded text is what everything else consumes, the binary stream is what a
// sampler would hand us.

use std::borrow::Cow;
use std::io::{self, Write};

use crate::defs::{DEFAULT_DELIMITER, STREAM_MAGIC, STREAM_VERSION};
use crate::structs::{DeltaSet, FoldedStacks};

// letters for the characters that would break a folded line
fn short_escape(c: char) -> Option<char> {
    match c {
        '\n' => Some('n'),
        '\r' => Some('r'),
        '\t' => Some('t'),
        ' ' => Some('s'),
        _ => None,
    }
}

// openers with no closer after them; `split_frames` would still be nested
// when it reaches the next delimiter
fn unmatched_openers(frame: &str) -> Vec<usize> {
    let mut open = Vec::new();
    for (i, c) in frame.char_indices() {
        match c {
            '(' | '[' | '{' => open.push(i),
            ')' | ']' | '}' => {
                open.pop();
            }
            _ => {}
        }
    }
    open
}

/// Escape `frame` so `split_frames` on a folded line gives it back.
///
/// The delimiter and `\` are always escaped, as are newlines, carriage
/// returns and tabs. Whitespace at either end, a leading `#` and openers
/// that are never closed are escaped too, since line trimming, comment
/// lines and bracket nesting would otherwise change the frame.
pub fn escape_frame(frame: &str, delim: char) -> Cow<'_, str> {
    let edge = |c: char| c.is_whitespace() || c == '#';
    let unmatched = unmatched_openers(frame);
    let plain = unmatched.is_empty()
        && !frame.starts_with(edge)
        && !frame.ends_with(char::is_whitespace)
        && !frame.contains(|c: char| c == delim || c == '\\' || matches!(c, '\n' | '\r' | '\t'));
    if plain {
        return Cow::Borrowed(frame);
    }

    let lead = frame.len() - frame.trim_start().len();
    let trail = frame.trim_end().len().max(lead);
    let mut out = String::with_capacity(frame.len() + 4);
    for (i, c) in frame.char_indices() {
        let at_edge = i < lead || i >= trail;
        if c == delim || c == '\\' || (i == 0 && c == '#') || unmatched.contains(&i) {
            out.push('\\');
            out.push(c);
        } else if matches!(c, '\n' | '\r' | '\t') || (at_edge && c.is_whitespace()) {
            match short_escape(c).filter(|e| *e != delim) {
                Some(e) => {
                    out.push('\\');
                    out.push(e);
                }
                None => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            }
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn write_path<W: Write>(w: &mut W, frames: &[String]) -> io::Result<()> {
    let mut sep = [0u8; 4];
    let sep = DEFAULT_DELIMITER.encode_utf8(&mut sep);
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            w.write_all(sep.as_bytes())?;
        }
        w.write_all(escape_frame(frame, DEFAULT_DELIMITER).as_bytes())?;
    }
    Ok(())
}

/// Write `frame;frame;... count` lines, sorted by path. Folded text always
/// uses `;`, whatever delimiter the raw input had.
pub fn write_folded<W: Write>(stacks: &FoldedStacks, mut w: W) -> io::Result<()> {
    for stack in stacks {
        write_path(&mut w, &stack.frames)?;
        if stack.frames.is_empty() {
            writeln!(w, "{}", stack.count)?;
        } else {
            writeln!(w, " {}", stack.count)?;
        }
    }
    w.flush()
}

pub fn folded_to_string(stacks: &FoldedStacks) -> String {
    let mut out = Vec::new();
    // writing into a Vec cannot fail
    let _ = write_folded(stacks, &mut out);
    String::from_utf8(out).unwrap_or_default()
}

/// `frame;... before after` lines, the two-column differential format.
pub fn write_delta_folded<W: Write>(delta: &DeltaSet, mut w: W) -> io::Result<()> {
    for entry in &delta.entries {
        write_path(&mut w, &entry.frames)?;
        if entry.frames.is_empty() {
            writeln!(w, "{} {}", entry.before, entry.after)?;
        } else {
            writeln!(w, " {} {}", entry.before, entry.after)?;
        }
    }
    w.flush()
}

/// Encoder for the length-prefixed binary record stream.
pub struct StreamWriter<W: Write> {
    inner: W,
    payload: Vec<u8>,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(STREAM_MAGIC)?;
        inner.write_all(&STREAM_VERSION.to_le_bytes())?;
        Ok(StreamWriter {
            inner,
            payload: Vec::new(),
        })
    }

    /// Write one sample; `frames` are leaf-first, as a sampler sees them.
    pub fn write_record<I, S>(&mut self, frames: I) -> io::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.payload.clear();
        self.payload.extend_from_slice(&[0; 4]);
        let mut count: u32 = 0;
        for frame in frames {
            let frame = frame.as_ref().as_bytes();
            let len = u32::try_from(frame.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too long"))?;
            self.payload.extend_from_slice(&len.to_le_bytes());
            self.payload.extend_from_slice(frame);
            count += 1;
        }
        self.payload[..4].copy_from_slice(&count.to_le_bytes());
        let len = u32::try_from(self.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too long"))?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&self.payload)
    }

    /// Write the end-of-stream marker and hand back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(&0u32.to_le_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
