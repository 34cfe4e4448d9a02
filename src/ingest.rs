// one push-based decoder behind both the sync iterator and the async reader.
// bad records are skipped and counted, never fatal.

use std::collections::VecDeque;
use std::io::Read;

use tracing::{debug, event, Level};

use crate::defs::{FrameOrder, Framing, IngestOptions};
use crate::error::{Error, MalformedSample, Result, Stage, Warning};
use crate::parse::{
    parse_folded_line, parse_record_payload, parse_stream_header, split_frames, PerfCollapser,
    STREAM_HEADER_SIZE,
};
use crate::structs::{FoldedStack, Report, StackSample};

const READ_CHUNK: usize = 64 * 1024;
// a length prefix past this means the framing is lost
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// One ingested record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sample(StackSample),
    Folded(FoldedStack),
}

enum BinaryState {
    Header,
    Records,
    Ended,
}

pub struct Decoder {
    opts: IngestOptions,
    buf: Vec<u8>,
    record: u64,
    binary: BinaryState,
    perf: Option<PerfCollapser>,
    warnings: Vec<Warning>,
    skipped: u64,
}

impl Decoder {
    pub fn new(opts: IngestOptions) -> Self {
        let perf = match opts.framing {
            Framing::Perf => Some(PerfCollapser::new(opts.perf.clone())),
            _ => None,
        };
        Decoder {
            opts,
            buf: Vec::new(),
            record: 0,
            binary: BinaryState::Header,
            perf,
            warnings: Vec::new(),
            skipped: 0,
        }
    }

    pub fn records_seen(&self) -> u64 {
        self.record
    }

    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Record>) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        match self.opts.framing {
            Framing::Binary => self.drain_binary(out),
            _ => {
                self.drain_lines(out);
                Ok(())
            }
        }
    }

    /// Signal end of input; flushes whatever is left in the buffer.
    pub fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        match self.opts.framing {
            Framing::Binary => {
                self.drain_binary(out)?;
                match self.binary {
                    BinaryState::Header if !self.buf.is_empty() => {
                        return Err(Error::BadHeader("stream ended inside header".into()));
                    }
                    BinaryState::Records if !self.buf.is_empty() => {
                        self.record += 1;
                        let len = self.buf.len();
                        self.malformed(format!("truncated record ({len} bytes at end of stream)"));
                    }
                    BinaryState::Records => {
                        debug!("binary stream ended without end marker");
                    }
                    _ => {}
                }
                self.buf.clear();
            }
            _ => {
                if !self.buf.is_empty() {
                    let rest = std::mem::take(&mut self.buf);
                    self.line(&rest, out);
                }
                if let Some(result) = self.perf.as_mut().and_then(|p| p.finish()) {
                    self.perf_result(result, out);
                }
            }
        }
        if let Some(perf) = &self.perf {
            if let (Some(kept), skipped) = perf.filtered() {
                if skipped > 0 {
                    self.warnings.push(Warning::EventFiltered {
                        kept: kept.to_string(),
                        skipped,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Vec<Warning>, u64) {
        (self.warnings, self.skipped)
    }

    fn drain_lines(&mut self, out: &mut Vec<Record>) {
        let mut start = 0;
        while let Some(nl) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + nl;
            let line = self.buf[start..end].to_vec();
            self.line(&line, out);
            start = end + 1;
        }
        self.buf.drain(..start);
    }

    fn line(&mut self, raw: &[u8], out: &mut Vec<Record>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if let Some(perf) = self.perf.as_mut() {
            // perf output is not always clean utf-8; symbols are kept lossy
            let line = String::from_utf8_lossy(raw);
            if let Some(result) = perf.push_line(&line) {
                self.perf_result(result, out);
            }
            return;
        }

        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(e) => {
                self.record += 1;
                self.malformed(format!("invalid utf-8: {e}"));
                return;
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            // not a record, but keep line numbers honest
            self.record += 1;
            return;
        }
        self.record += 1;
        let delim = self.opts.delimiter;
        match self.opts.framing {
            Framing::Folded => match parse_folded_line(trimmed, delim) {
                Ok(mut folded) => {
                    self.check_depth(&mut folded.frames);
                    out.push(Record::Folded(folded));
                }
                Err(reason) => self.malformed(reason),
            },
            _ => match split_frames(trimmed, delim) {
                Ok(frames) => {
                    let root_first = self.opts.order == FrameOrder::RootFirst;
                    self.sample(frames, root_first, out);
                }
                Err(reason) => self.malformed(reason),
            },
        }
    }

    fn perf_result(&mut self, result: std::result::Result<Vec<String>, String>, out: &mut Vec<Record>) {
        self.record += 1;
        match result {
            Ok(frames) => self.sample(frames, true, out),
            Err(reason) => self.malformed(reason),
        }
    }

    fn drain_binary(&mut self, out: &mut Vec<Record>) -> Result<()> {
        let mut pos = 0;
        loop {
            match self.binary {
                BinaryState::Header => {
                    if self.buf.len() < STREAM_HEADER_SIZE {
                        break;
                    }
                    parse_stream_header(&self.buf[..STREAM_HEADER_SIZE]).map_err(Error::BadHeader)?;
                    pos = STREAM_HEADER_SIZE;
                    self.binary = BinaryState::Records;
                }
                BinaryState::Records => {
                    let Some(prefix) = self.buf.get(pos..pos + 4) else {
                        break;
                    };
                    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                    if len == 0 {
                        pos += 4;
                        self.binary = BinaryState::Ended;
                        continue;
                    }
                    if len > MAX_RECORD_BYTES {
                        self.record += 1;
                        self.malformed(format!("record length {len} exceeds limit, rest of stream dropped"));
                        self.binary = BinaryState::Ended;
                        continue;
                    }
                    let Some(payload) = self.buf.get(pos + 4..pos + 4 + len) else {
                        break;
                    };
                    let parsed = parse_record_payload(payload);
                    pos += 4 + len;
                    self.record += 1;
                    match parsed {
                        Ok(frames) => self.sample(frames, false, out),
                        Err(reason) => self.malformed(reason),
                    }
                }
                BinaryState::Ended => {
                    let trailing = self.buf.len() - pos;
                    if trailing > 0 {
                        debug!(trailing, "ignoring bytes after end marker");
                    }
                    pos = self.buf.len();
                    break;
                }
            }
        }
        self.buf.drain(..pos);
        Ok(())
    }

    fn sample(&mut self, mut frames: Vec<String>, root_first: bool, out: &mut Vec<Record>) {
        if !root_first {
            frames.reverse();
        }
        self.check_depth(&mut frames);
        out.push(Record::Sample(StackSample::new(frames)));
    }

    fn check_depth(&mut self, frames: &mut Vec<String>) {
        let max = self.opts.max_depth;
        if frames.len() > max {
            event!(Level::WARN, record = self.record, depth = frames.len(), max, "truncating deep stack");
            self.warnings.push(Warning::InconsistentDepth {
                record: self.record,
                depth: frames.len(),
                max,
            });
            frames.truncate(max);
        }
    }

    fn malformed(&mut self, reason: String) {
        debug!(record = self.record, %reason, "skipping malformed record");
        self.skipped += 1;
        self.warnings
            .push(MalformedSample::new(self.record, reason).into());
    }
}

/// Lazy, synchronous record iterator over any reader.
pub struct Ingestor<R> {
    reader: R,
    decoder: Decoder,
    pending: VecDeque<Record>,
    scratch: Vec<Record>,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> Ingestor<R> {
    pub fn new(reader: R, opts: IngestOptions) -> Self {
        Ingestor {
            reader,
            decoder: Decoder::new(opts),
            pending: VecDeque::new(),
            scratch: Vec::new(),
            chunk: vec![0; READ_CHUNK],
            done: false,
        }
    }

    /// Warnings and skip count gathered so far.
    pub fn into_report<T>(self, value: T) -> Report<T> {
        let (warnings, skipped) = self.decoder.into_parts();
        Report {
            value,
            warnings,
            skipped,
        }
    }

    fn fill(&mut self) -> Result<()> {
        while self.pending.is_empty() && !self.done {
            let n = match self.reader.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(Stage::Ingest, e)),
            };
            if n == 0 {
                self.done = true;
                self.decoder.finish(&mut self.scratch)?;
            } else {
                self.decoder.feed(&self.chunk[..n], &mut self.scratch)?;
            }
            self.pending.extend(self.scratch.drain(..));
        }
        Ok(())
    }
}

impl<R: Read> Iterator for Ingestor<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.done = true;
            return Some(Err(e));
        }
        self.pending.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unparse::StreamWriter;

    fn ingest(input: &[u8], opts: IngestOptions) -> (Vec<Record>, Vec<Warning>, u64) {
        let mut ingestor = Ingestor::new(input, opts);
        let records: Vec<Record> = ingestor.by_ref().collect::<Result<_>>().unwrap();
        let report = ingestor.into_report(());
        (records, report.warnings, report.skipped)
    }

    fn sample(frames: &[&str]) -> Record {
        Record::Sample(StackSample::new(frames.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn leaf_first_lines_are_normalized_root_first() {
        let (records, warnings, skipped) = ingest(b"bar;foo;main\n\n# comment\nbaz;main", IngestOptions::default());
        assert_eq!(records, vec![sample(&["main", "foo", "bar"]), sample(&["main", "baz"])]);
        assert!(warnings.is_empty());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn bad_lines_are_skipped_and_counted() {
        let opts = IngestOptions {
            order: FrameOrder::RootFirst,
            ..Default::default()
        };
        let (records, warnings, skipped) =
            ingest(b"main;foo\nmain;;foo\nmain;<[u8; 4]>::fmt\r\nmain;bar\n", opts);
        assert_eq!(records, vec![sample(&["main", "foo"]), sample(&["main", "bar"])]);
        assert_eq!(skipped, 2);
        assert!(matches!(&warnings[0], Warning::Malformed(m) if m.record == 2));
        assert!(matches!(&warnings[1], Warning::Malformed(m) if m.record == 3));
    }

    #[test]
    fn deep_stacks_are_truncated_with_a_warning() {
        let opts = IngestOptions {
            order: FrameOrder::RootFirst,
            max_depth: 2,
            ..Default::default()
        };
        let (records, warnings, skipped) = ingest(b"a;b;c;d\n", opts);
        assert_eq!(records, vec![sample(&["a", "b"])]);
        assert_eq!(skipped, 0);
        assert_eq!(
            warnings,
            vec![Warning::InconsistentDepth {
                record: 1,
                depth: 4,
                max: 2
            }]
        );
    }

    #[test]
    fn folded_framing() {
        let opts = IngestOptions {
            framing: Framing::Folded,
            ..Default::default()
        };
        let (records, _, skipped) = ingest(b"main;foo 3\nmain;bar\n", opts);
        assert_eq!(
            records,
            vec![Record::Folded(FoldedStack {
                frames: vec!["main".into(), "foo".into()],
                count: 3
            })]
        );
        assert_eq!(skipped, 1);
    }

    fn binary_stream(stacks: &[&[&str]], end_marker: bool) -> Vec<u8> {
        let mut w = StreamWriter::new(Vec::new()).unwrap();
        for stack in stacks {
            w.write_record(stack.iter().copied()).unwrap();
        }
        if end_marker {
            w.finish().unwrap()
        } else {
            w.into_inner()
        }
    }

    #[test]
    fn binary_framing_fed_in_tiny_chunks() {
        let bytes = binary_stream(&[&["bar", "foo", "main"], &[]], true);
        let opts = IngestOptions {
            framing: Framing::Binary,
            ..Default::default()
        };
        let mut decoder = Decoder::new(opts);
        let mut out = Vec::new();
        for b in &bytes {
            decoder.feed(std::slice::from_ref(b), &mut out).unwrap();
        }
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, vec![sample(&["main", "foo", "bar"]), sample(&[])]);
        assert_eq!(decoder.into_parts().1, 0);
    }

    #[test]
    fn binary_truncated_tail_is_one_malformed_record() {
        let mut bytes = binary_stream(&[&["a"], &["b", "c"]], false);
        bytes.truncate(bytes.len() - 2);
        let opts = IngestOptions {
            framing: Framing::Binary,
            ..Default::default()
        };
        let (records, warnings, skipped) = ingest(&bytes, opts);
        assert_eq!(records, vec![sample(&["a"])]);
        assert_eq!(skipped, 1);
        assert!(matches!(&warnings[0], Warning::Malformed(m) if m.record == 2));
    }

    #[test]
    fn binary_bad_header_is_fatal() {
        let opts = IngestOptions {
            framing: Framing::Binary,
            ..Default::default()
        };
        let mut ingestor = Ingestor::new(&b"NOTSTACKS\0\0\0\0\0"[..], opts);
        match ingestor.next() {
            Some(Err(Error::BadHeader(_))) => {}
            other => panic!("expected bad header, got {other:?}"),
        }
        assert!(ingestor.next().is_none());
    }
}
