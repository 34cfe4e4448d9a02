use once_cell::sync::Lazy;
use plain::Plain;
use regex::Regex;

use crate::defs::{PerfOptions, STREAM_MAGIC, STREAM_VERSION};
use crate::structs::FoldedStack;

// header and frame shapes borrowed from stackcollapse-perf, loosened a bit
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<comm>\S.*?)\s+(?P<pid>\d+)(?:/(?P<tid>\d+))?\s.*?\s(?P<event>[A-Za-z_][\w.-]*(?::[\w.-]+)*):(?:\s|$)",
    )
    .unwrap()
});
static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<addr>[0-9a-fA-F]+)\s+(?P<symbol>.+?)\s+\((?P<module>.*)\)\s*$").unwrap()
});
static SRCLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s+(?P<src_file>\S.*?):(?P<line_number>[0-9]+)$").unwrap());
static OFFSET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\+0x[0-9a-fA-F]+$").unwrap());

// `\u{..}` with the backslash and `u` already consumed
fn unicode_escape(chars: &mut std::str::Chars<'_>) -> Result<char, String> {
    if chars.next() != Some('{') {
        return Err("`\\u` escape without `{`".into());
    }
    let mut hex = String::new();
    for c in chars.by_ref() {
        if c == '}' {
            return u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| format!("bad unicode escape `\\u{{{hex}}}`"));
        }
        hex.push(c);
    }
    Err("unterminated unicode escape".into())
}

/// Split a delimited stack into frames.
///
/// `\` escapes the delimiter, itself, `#` and the openers `(`, `[`, `{`;
/// `\n`, `\r`, `\t`, `\s` and `\u{hex}` stand for characters a line cannot
/// hold. Any other escape is kept as written. A delimiter inside an open
/// bracket was meant to be part of a frame name and is rejected, as are
/// empty frames.
pub fn split_frames(s: &str, delim: char) -> Result<Vec<String>, String> {
    let mut frames = Vec::new();
    let mut cur = String::new();
    let mut nesting = 0usize;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e) if e == delim => cur.push(e),
                Some(e @ ('\\' | '#' | '(' | '[' | '{')) => cur.push(e),
                Some('n') => cur.push('\n'),
                Some('r') => cur.push('\r'),
                Some('t') => cur.push('\t'),
                Some('s') => cur.push(' '),
                Some('u') if chars.as_str().starts_with('{') => cur.push(unicode_escape(&mut chars)?),
                Some(e) => {
                    cur.push('\\');
                    cur.push(e);
                }
                None => return Err("dangling escape at end of stack".into()),
            },
            c if c == delim => {
                if nesting > 0 {
                    return Err(format!("unescaped `{delim}` inside frame name `{cur}`"));
                }
                if cur.is_empty() {
                    return Err(format!("empty frame at position {}", frames.len()));
                }
                frames.push(std::mem::take(&mut cur));
            }
            '(' | '[' | '{' => {
                nesting += 1;
                cur.push(c);
            }
            ')' | ']' | '}' => {
                nesting = nesting.saturating_sub(1);
                cur.push(c);
            }
            c => cur.push(c),
        }
    }
    if cur.is_empty() {
        if !frames.is_empty() {
            return Err(format!("empty frame at position {}", frames.len()));
        }
    } else {
        frames.push(cur);
    }
    Ok(frames)
}

/// Parse a `frame;frame;... count` line. Frames are root-first.
pub fn parse_folded_line(line: &str, delim: char) -> Result<FoldedStack, String> {
    let line = line.trim_end();
    let (stack, count) = match line.rsplit_once(' ') {
        Some((stack, count)) => (stack, count),
        // a bare count is a sample that only hit the root
        None => ("", line),
    };
    let count: u64 = count
        .parse()
        .map_err(|_| format!("missing or invalid count `{count}`"))?;
    if count == 0 {
        return Err("zero count".into());
    }
    let frames = split_frames(stack.trim_end(), delim)?;
    Ok(FoldedStack { frames, count })
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamHeader {
    pub magic: [u8; 8],
    pub version: u32,
}

unsafe impl Plain for StreamHeader {}

pub const STREAM_HEADER_SIZE: usize = std::mem::size_of::<StreamHeader>();

pub fn parse_stream_header(bytes: &[u8]) -> Result<(), String> {
    let mut header = StreamHeader::default();
    plain::copy_from_bytes(&mut header, bytes).map_err(|_| "stream header too short")?;
    if &header.magic != STREAM_MAGIC {
        return Err(format!("bad magic {:?}", String::from_utf8_lossy(&header.magic)));
    }
    let version = u32::from_le(header.version);
    if version != STREAM_VERSION {
        return Err(format!("unsupported version {version}"));
    }
    Ok(())
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let end = pos.checked_add(4)?;
    let raw: [u8; 4] = bytes.get(*pos..end)?.try_into().ok()?;
    *pos = end;
    Some(u32::from_le_bytes(raw))
}

/// Decode one record payload into leaf-first frames.
pub fn parse_record_payload(payload: &[u8]) -> Result<Vec<String>, String> {
    let mut pos = 0;
    let count = take_u32(payload, &mut pos).ok_or("record too short for frame count")?;
    // every frame needs at least its length prefix
    if count as usize > payload.len() / 4 {
        return Err(format!("frame count {count} overruns {} byte record", payload.len()));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for i in 0..count {
        let len = take_u32(payload, &mut pos).ok_or_else(|| format!("frame {i} truncated"))?;
        let end = pos
            .checked_add(len as usize)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| format!("frame {i} overruns record"))?;
        let name = std::str::from_utf8(&payload[pos..end])
            .map_err(|e| format!("frame {i} is not utf-8: {e}"))?;
        if name.is_empty() {
            return Err(format!("frame {i} is empty"));
        }
        frames.push(name.to_string());
        pos = end;
    }
    if pos != payload.len() {
        return Err(format!("{} trailing bytes in record", payload.len() - pos));
    }
    Ok(frames)
}

enum State {
    Header,
    Frames,
    Skip,
}

struct PendingSample {
    root: Option<String>,
    event: String,
    frames: Vec<String>,
    error: Option<String>,
}

/// Line-at-a-time collapser for `perf script` output.
pub struct PerfCollapser {
    opts: PerfOptions,
    state: State,
    pending: Option<PendingSample>,
    event: Option<String>,
    filtered: u64,
}

impl PerfCollapser {
    pub fn new(opts: PerfOptions) -> Self {
        let event = opts.event_filter.clone();
        PerfCollapser {
            opts,
            state: State::Header,
            pending: None,
            event,
            filtered: 0,
        }
    }

    /// Feed one line. Returns a finished sample (root-first) when `line`
    /// closes one.
    pub fn push_line(&mut self, line: &str) -> Option<Result<Vec<String>, String>> {
        if line.trim().is_empty() {
            self.state = State::Header;
            return self.complete();
        }
        match self.state {
            State::Header => {
                if line.starts_with('#') {
                    return None;
                }
                let pending = match HEADER_RE.captures(line) {
                    Some(caps) => PendingSample {
                        root: self.root_frame(&caps),
                        event: caps["event"].to_string(),
                        frames: Vec::new(),
                        error: None,
                    },
                    None => PendingSample {
                        root: None,
                        event: String::new(),
                        frames: Vec::new(),
                        error: Some(format!("unrecognized sample header {line:?}")),
                    },
                };
                self.state = if pending.error.is_some() {
                    State::Skip
                } else {
                    State::Frames
                };
                self.pending = Some(pending);
            }
            State::Frames => {
                let frame = if let Some(caps) = FRAME_RE.captures(line) {
                    Ok(self.frame_name(&caps["symbol"], &caps["module"]))
                } else if SRCLINE_RE.is_match(line) {
                    return None;
                } else {
                    Err(format!("unrecognized frame line {line:?}"))
                };
                if let Some(pending) = self.pending.as_mut() {
                    match frame {
                        Ok(name) => pending.frames.push(name),
                        Err(e) => {
                            pending.error = Some(e);
                            self.state = State::Skip;
                        }
                    }
                }
            }
            State::Skip => {}
        }
        None
    }

    /// Flush a sample that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<Result<Vec<String>, String>> {
        self.state = State::Header;
        self.complete()
    }

    /// The event that was kept and how many samples of others were dropped.
    pub fn filtered(&self) -> (Option<&str>, u64) {
        (self.event.as_deref(), self.filtered)
    }

    fn complete(&mut self) -> Option<Result<Vec<String>, String>> {
        let pending = self.pending.take()?;
        if let Some(e) = pending.error {
            return Some(Err(e));
        }
        let kept = self.event.get_or_insert_with(|| pending.event.clone());
        if *kept != pending.event {
            self.filtered += 1;
            return None;
        }
        let mut frames: Vec<String> = Vec::with_capacity(pending.frames.len() + 1);
        frames.extend(pending.root);
        frames.extend(pending.frames.into_iter().rev());
        Some(Ok(frames))
    }

    fn root_frame(&self, caps: &regex::Captures<'_>) -> Option<String> {
        if !self.opts.include_comm {
            return None;
        }
        let comm = caps["comm"].trim().replace(' ', "_");
        let pid = &caps["pid"];
        let name = match caps.name("tid") {
            Some(tid) if self.opts.include_tid => format!("{comm}-{pid}/{}", tid.as_str()),
            _ if self.opts.include_pid || self.opts.include_tid => format!("{comm}-{pid}"),
            _ => comm,
        };
        Some(name)
    }

    fn frame_name(&self, symbol: &str, module: &str) -> String {
        let mut name = if self.opts.strip_offsets {
            OFFSET_RE.replace(symbol, "").into_owned()
        } else {
            symbol.to_string()
        };
        if name == "[unknown]" && !module.is_empty() && module != "[unknown]" {
            let base = module.rsplit('/').next().unwrap_or(module);
            name = format!("[{}]", base.trim_matches(|c: char| c == '[' || c == ']'));
        }
        if self.opts.annotate_kernel && module.starts_with("[kernel") {
            name.push_str("_[k]");
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_plain_stacks() {
        assert_eq!(split_frames("main;foo;bar", ';').unwrap(), frames(&["main", "foo", "bar"]));
        assert_eq!(split_frames("", ';').unwrap(), Vec::<String>::new());
    }

    #[test]
    fn escaped_delimiters_stay_in_the_frame() {
        assert_eq!(
            split_frames(r"main;<[u8\; 4] as Debug>::fmt", ';').unwrap(),
            frames(&["main", "<[u8; 4] as Debug>::fmt"])
        );
        assert_eq!(split_frames(r"a\\;b", ';').unwrap(), frames(&[r"a\", "b"]));
    }

    #[test]
    fn unescaped_delimiter_inside_a_frame_is_rejected() {
        let err = split_frames("main;<[u8; 4] as Debug>::fmt", ';').unwrap_err();
        assert!(err.contains("unescaped"), "{err}");
    }

    #[test]
    fn empty_frames_are_rejected() {
        assert!(split_frames("main;;bar", ';').is_err());
        assert!(split_frames(";main", ';').is_err());
        assert!(split_frames("main;", ';').is_err());
        assert!(split_frames(r"main\", ';').is_err());
    }

    #[test]
    fn folded_lines() {
        let f = parse_folded_line("main;foo bar;baz 42", ';').unwrap();
        assert_eq!(f.frames, frames(&["main", "foo bar", "baz"]));
        assert_eq!(f.count, 42);

        let root_only = parse_folded_line("7", ';').unwrap();
        assert!(root_only.frames.is_empty());
        assert_eq!(root_only.count, 7);

        assert!(parse_folded_line("main;foo", ';').is_err());
        assert!(parse_folded_line("main;foo 0", ';').is_err());
        assert!(parse_folded_line("main;foo x1", ';').is_err());
    }

    #[test]
    fn record_payloads() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes());
        for name in ["leaf", "root"] {
            payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
        }
        assert_eq!(parse_record_payload(&payload).unwrap(), frames(&["leaf", "root"]));

        assert!(parse_record_payload(&payload[..payload.len() - 1]).is_err());
        let mut extra = payload.clone();
        extra.push(0);
        assert!(parse_record_payload(&extra).is_err());

        let mut huge = Vec::new();
        huge.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(parse_record_payload(&huge).is_err());
    }

    #[test]
    fn stream_header() {
        let mut bytes = STREAM_MAGIC.to_vec();
        bytes.extend_from_slice(&STREAM_VERSION.to_le_bytes());
        assert!(parse_stream_header(&bytes).is_ok());
        assert!(parse_stream_header(&bytes[..4]).is_err());
        bytes[0] = b'X';
        assert!(parse_stream_header(&bytes).is_err());
    }

    const PERF: &str = "\
app 1234/1235 [001] 7006.226761:     250000 cpu-clock:uk:
\tffffffffb12d1f18 native_write_msr+0x8 ([kernel.kallsyms])
\t    55d2c0a1b2c3 compute+0x1d (/usr/bin/app)
\t    55d2c0a1b000 main+0x10 (/usr/bin/app)

app 1234/1235 [001] 7006.227761:     250000 cpu-clock:uk:
\t    7f1c2b3a4c5d [unknown] (/usr/lib/libc.so.6)
\t    55d2c0a1b000 main+0x10 (/usr/bin/app)
\t  src/main.rs:10

";

    fn collapse(input: &str, opts: PerfOptions) -> (Vec<Result<Vec<String>, String>>, PerfCollapser) {
        let mut perf = PerfCollapser::new(opts);
        let mut out = Vec::new();
        for line in input.lines() {
            out.extend(perf.push_line(line));
        }
        out.extend(perf.finish());
        (out, perf)
    }

    #[test]
    fn perf_script_samples() {
        let (out, perf) = collapse(
            PERF,
            PerfOptions {
                annotate_kernel: true,
                ..Default::default()
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].as_ref().unwrap(),
            &frames(&["app", "main", "compute", "native_write_msr_[k]"])
        );
        assert_eq!(out[1].as_ref().unwrap(), &frames(&["app", "main", "[libc.so.6]"]));
        assert_eq!(perf.filtered(), (Some("cpu-clock:uk"), 0));
    }

    #[test]
    fn perf_pid_and_tid_roots() {
        let (out, _) = collapse(
            PERF,
            PerfOptions {
                include_tid: true,
                ..Default::default()
            },
        );
        assert_eq!(out[0].as_ref().unwrap()[0], "app-1234/1235");

        let (out, _) = collapse(
            PERF,
            PerfOptions {
                include_pid: true,
                ..Default::default()
            },
        );
        assert_eq!(out[0].as_ref().unwrap()[0], "app-1234");
    }

    #[test]
    fn perf_keeps_the_first_event_only() {
        let input = "\
app 1 [000] 1.0: 1 cycles:
\t1 a (/bin/app)

app 1 [000] 2.0: 1 sched:sched_switch: prev_comm=app
\t1 b (/bin/app)

app 1 [000] 3.0: 1 cycles:
\t1 c (/bin/app)
";
        let (out, perf) = collapse(input, PerfOptions::default());
        assert_eq!(out.len(), 2);
        assert_eq!(perf.filtered(), (Some("cycles"), 1));
    }

    #[test]
    fn perf_bad_frame_line_spoils_only_that_sample() {
        let input = "\
app 1 [000] 1.0: 1 cycles:
\t1 a (/bin/app)
garbage
\t2 b (/bin/app)

app 1 [000] 3.0: 1 cycles:
\t1 c (/bin/app)
";
        let (out, _) = collapse(input, PerfOptions::default());
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap(), &frames(&["app", "c"]));
    }
}
