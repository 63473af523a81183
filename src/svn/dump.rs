use std::io::{BufRead as _, Read as _, Seek as _};
use std::path::PathBuf;

// Subversion dump file format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt
//
// The reader consumes the stream one node at a time, reusing a single
// `Node` record. Revision metadata (author, date, log, sync marker) is
// kept on the reader itself and updated as revision records go by.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeAction {
    Add,
    Delete,
    Change,
    Replace,
}

/// One mutation inside a revision. The record is reused across
/// `read_next` calls; the text buffer keeps its capacity between nodes.
#[derive(Clone, Debug, Default)]
pub(crate) struct Node {
    pub(crate) rev: u32,
    pub(crate) txn: i32,
    pub(crate) path: Vec<u8>,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: Option<NodeAction>,
    pub(crate) copy_from_rev: Option<u32>,
    pub(crate) copy_from_path: Option<Vec<u8>>,
    pub(crate) text: Vec<u8>,
    pub(crate) has_text: bool,
    pub(crate) md5_checksum: Option<Vec<u8>>,
    pub(crate) sha1_checksum: Option<Vec<u8>>,
}

impl Node {
    #[inline]
    pub(crate) fn has_copy_from(&self) -> bool {
        self.copy_from_rev.is_some()
    }

    #[inline]
    pub(crate) fn has_text(&self) -> bool {
        self.has_text
    }

    #[inline]
    pub(crate) fn text(&self) -> &[u8] {
        if self.has_text {
            &self.text
        } else {
            &[]
        }
    }

    fn reset(&mut self) {
        self.path.clear();
        self.kind = None;
        self.action = None;
        self.copy_from_rev = None;
        self.copy_from_path = None;
        self.text.clear();
        self.has_text = false;
        self.md5_checksum = None;
        self.sha1_checksum = None;
    }
}

/// Per-revision metadata, cloned out of the reader at revision
/// boundaries (and shipped over the pipeline queue in threaded mode).
#[derive(Clone, Debug)]
pub(crate) struct RevInfo {
    pub(crate) rev: u32,
    pub(crate) author: Vec<u8>,
    pub(crate) date: i64,
    pub(crate) log: Option<Vec<u8>>,
    pub(crate) last_merged_rev: Option<u32>,
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    OpenError {
        path: PathBuf,
        error: std::io::Error,
    },
    InvalidHeaderValue {
        field: &'static str,
        value: Vec<u8>,
    },
    MismatchedContentLength,
    BrokenProperties,
    InvalidDate {
        value: Vec<u8>,
    },
    ChecksumMismatch {
        algo: &'static str,
        path: Vec<u8>,
        expected: Vec<u8>,
        computed: String,
    },
}

impl From<std::io::Error> for ReadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read dump: {e}"),
            Self::OpenError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to open dump file {path:?}: {error}")
            }
            Self::InvalidHeaderValue { field, ref value } => {
                write!(
                    f,
                    "invalid value for \"{field}\": \"{}\"",
                    value.escape_ascii(),
                )
            }
            Self::MismatchedContentLength => write!(f, "mismatched content length"),
            Self::BrokenProperties => write!(f, "broken property block"),
            Self::InvalidDate { ref value } => {
                write!(f, "invalid svn:date value: \"{}\"", value.escape_ascii())
            }
            Self::ChecksumMismatch {
                algo,
                ref path,
                ref expected,
                ref computed,
            } => write!(
                f,
                "{algo} mismatch for \"{}\": expected {}, computed {computed}",
                path.escape_ascii(),
                expected.escape_ascii(),
            ),
        }
    }
}

enum State {
    Next,
    Tags,
    Props,
    Body,
}

pub(crate) struct DumpFile {
    handle: std::io::BufReader<std::fs::File>,
    curr_rev: Option<u32>,
    last_merged_rev: Option<u32>,
    rev_author: Vec<u8>,
    rev_date: i64,
    rev_log: Option<Vec<u8>>,
    curr_node: Node,
    line_buf: Vec<u8>,
}

impl DumpFile {
    pub(crate) fn open(path: &std::path::Path) -> Result<Self, ReadError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| ReadError::OpenError {
                path: path.to_path_buf(),
                error: e,
            })?;

        Ok(Self {
            handle: std::io::BufReader::with_capacity(1024 * 1024, file),
            curr_rev: None,
            last_merged_rev: None,
            rev_author: Vec::new(),
            rev_date: 0,
            rev_log: None,
            curr_node: Node {
                txn: -1,
                ..Node::default()
            },
            line_buf: Vec::new(),
        })
    }

    /// Seeks back to byte 0 and resets all reader state, so the stream
    /// can be consumed a second time after a prescan.
    pub(crate) fn rewind(&mut self) -> Result<(), ReadError> {
        self.handle.seek(std::io::SeekFrom::Start(0))?;
        self.curr_rev = None;
        self.last_merged_rev = None;
        self.rev_author.clear();
        self.rev_date = 0;
        self.rev_log = None;
        self.curr_node.reset();
        self.curr_node.txn = -1;
        Ok(())
    }

    #[inline]
    pub(crate) fn rev_nr(&self) -> Option<u32> {
        self.curr_rev
    }

    /// The `svn:sync-last-merged-rev` marker, when the dump came from a
    /// mirror. Used as the progress denominator.
    #[inline]
    pub(crate) fn last_merged_rev_nr(&self) -> Option<u32> {
        self.last_merged_rev
    }

    #[inline]
    pub(crate) fn curr_node(&self) -> &Node {
        &self.curr_node
    }

    #[inline]
    pub(crate) fn rev_author(&self) -> &[u8] {
        &self.rev_author
    }

    #[inline]
    pub(crate) fn rev_date(&self) -> i64 {
        self.rev_date
    }

    pub(crate) fn rev_info(&self) -> RevInfo {
        RevInfo {
            rev: self.curr_rev.unwrap_or(0),
            author: self.rev_author.clone(),
            date: self.rev_date,
            log: self.rev_log.clone(),
            last_merged_rev: self.last_merged_rev,
        }
    }

    /// Advances to the next node. Returns `true` when `curr_node`
    /// holds a fresh record, `false` at end of stream.
    pub(crate) fn read_next(&mut self, ignore_text: bool, verify: bool) -> Result<bool, ReadError> {
        let mut state = State::Next;

        let mut prop_content_length: Option<u64> = None;
        let mut text_content_length: Option<u64> = None;
        let mut content_length: Option<u64> = None;
        let mut saw_node_path = false;

        loop {
            match state {
                State::Next => {
                    prop_content_length = None;
                    text_content_length = None;
                    content_length = None;
                    saw_node_path = false;

                    self.curr_node.reset();

                    // A record is separated from the previous one by a
                    // single blank line.
                    if self.handle.fill_buf()?.first() == Some(&b'\n') {
                        self.handle.consume(1);
                    }
                    state = State::Tags;
                }
                State::Tags => {
                    if !self.read_line()? {
                        return Ok(false);
                    }

                    if self.line_buf.is_empty() {
                        if let Some(total) = content_length {
                            let expected = prop_content_length
                                .unwrap_or(0)
                                .checked_add(text_content_length.unwrap_or(0))
                                .ok_or(ReadError::MismatchedContentLength)?;
                            if total != expected {
                                return Err(ReadError::MismatchedContentLength);
                            }
                        }

                        if prop_content_length.unwrap_or(0) > 0 {
                            state = State::Props;
                        } else if text_content_length.unwrap_or(0) > 0 {
                            state = State::Body;
                        } else if saw_node_path {
                            return Ok(self.yield_node());
                        } else {
                            state = State::Next;
                        }
                        continue;
                    }

                    let Some(colon) = self.line_buf.iter().position(|&c| c == b':') else {
                        continue;
                    };
                    let line = std::mem::take(&mut self.line_buf);
                    let (field, rest) = line.split_at(colon);
                    let value = rest.strip_prefix(b": ").unwrap_or(&rest[1..]);

                    match field {
                        b"Revision-number" => {
                            self.curr_rev = Some(parse_int(value, "Revision-number")?);
                            self.rev_log = None;
                            self.curr_node.txn = -1;
                        }
                        b"Node-path" => {
                            self.curr_node.txn += 1;
                            self.curr_node.path.clear();
                            self.curr_node.path.extend_from_slice(value);
                            saw_node_path = true;
                        }
                        b"Node-kind" => {
                            self.curr_node.kind = match value.first() {
                                Some(b'f') => Some(NodeKind::File),
                                Some(b'd') => Some(NodeKind::Dir),
                                _ => None,
                            };
                        }
                        b"Node-action" => {
                            self.curr_node.action = match value.first() {
                                Some(b'a') => Some(NodeAction::Add),
                                Some(b'd') => Some(NodeAction::Delete),
                                Some(b'c') => Some(NodeAction::Change),
                                Some(b'r') => Some(NodeAction::Replace),
                                _ => None,
                            };
                        }
                        b"Node-copyfrom-rev" => {
                            self.curr_node.copy_from_rev =
                                Some(parse_int(value, "Node-copyfrom-rev")?);
                        }
                        b"Node-copyfrom-path" => {
                            self.curr_node.copy_from_path = Some(value.to_vec());
                        }
                        b"Prop-content-length" => {
                            prop_content_length = Some(parse_int(value, "Prop-content-length")?);
                        }
                        b"Text-content-length" => {
                            text_content_length = Some(parse_int(value, "Text-content-length")?);
                        }
                        b"Content-length" => {
                            content_length = Some(parse_int(value, "Content-length")?);
                        }
                        b"Text-content-md5" if verify => {
                            self.curr_node.md5_checksum = Some(value.to_vec());
                        }
                        b"Text-content-sha1" if verify => {
                            self.curr_node.sha1_checksum = Some(value.to_vec());
                        }
                        _ => {}
                    }
                    self.line_buf = line;
                }
                State::Props => {
                    let len = prop_content_length.unwrap_or(0);

                    if self.curr_node.txn >= 0 {
                        // Properties of a file or directory node carry
                        // nothing this tool interprets.
                        self.skip_bytes(len)?;
                    } else {
                        let mut buf = vec![0; usize::try_from(len).unwrap()];
                        self.handle.read_exact(&mut buf)?;
                        self.parse_rev_props(&buf)?;
                    }

                    if text_content_length.unwrap_or(0) > 0 {
                        state = State::Body;
                    } else if self.curr_rev.is_none() || self.curr_node.txn == -1 {
                        state = State::Next;
                    } else {
                        return Ok(self.yield_node());
                    }
                }
                State::Body => {
                    let len = text_content_length.unwrap_or(0);

                    if ignore_text {
                        self.skip_bytes(len)?;
                    } else {
                        self.curr_node.text.resize(usize::try_from(len).unwrap(), 0);
                        self.handle.read_exact(&mut self.curr_node.text)?;
                        self.curr_node.has_text = true;

                        if verify {
                            self.verify_checksums()?;
                        }
                    }

                    if self.curr_rev.is_none() || self.curr_node.txn == -1 {
                        state = State::Next;
                    } else {
                        return Ok(self.yield_node());
                    }
                }
            }
        }
    }

    fn yield_node(&mut self) -> bool {
        self.curr_node.rev = self.curr_rev.unwrap_or(0);
        true
    }

    /// Reads one `\n`-terminated line into `line_buf` (terminator
    /// stripped). Returns `false` at end of stream.
    fn read_line(&mut self) -> Result<bool, ReadError> {
        self.line_buf.clear();
        let n = self.handle.read_until(b'\n', &mut self.line_buf)?;
        if n == 0 {
            return Ok(false);
        }
        if self.line_buf.last() == Some(&b'\n') {
            self.line_buf.pop();
        }
        Ok(true)
    }

    fn skip_bytes(&mut self, len: u64) -> Result<(), ReadError> {
        self.handle.seek_relative(i64::try_from(len).unwrap())?;
        Ok(())
    }

    /// Parses a revision "Kv" property block:
    /// `K <len>\n<key>\nV <len>\n<value>\n` repeating, ending with
    /// `PROPS-END\n`.
    fn parse_rev_props(&mut self, buf: &[u8]) -> Result<(), ReadError> {
        fn take_line<'a>(rem: &mut &'a [u8]) -> Result<&'a [u8], ReadError> {
            let nl = rem
                .iter()
                .position(|&c| c == b'\n')
                .ok_or(ReadError::BrokenProperties)?;
            let line = &rem[..nl];
            *rem = &rem[(nl + 1)..];
            Ok(line)
        }

        fn take_counted<'a>(rem: &mut &'a [u8], len: usize) -> Result<&'a [u8], ReadError> {
            if rem.len() < len + 1 || rem[len] != b'\n' {
                return Err(ReadError::BrokenProperties);
            }
            let data = &rem[..len];
            *rem = &rem[(len + 1)..];
            Ok(data)
        }

        fn parse_len(line: &[u8], marker: u8) -> Result<usize, ReadError> {
            if line.first() != Some(&marker) || line.get(1) != Some(&b' ') {
                return Err(ReadError::BrokenProperties);
            }
            std::str::from_utf8(&line[2..])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ReadError::BrokenProperties)
        }

        let mut rem = buf;
        while rem != b"PROPS-END\n" && !rem.is_empty() {
            let key_len = parse_len(take_line(&mut rem)?, b'K')?;
            let key = take_counted(&mut rem, key_len)?;
            let value_len = parse_len(take_line(&mut rem)?, b'V')?;
            let value = take_counted(&mut rem, value_len)?;

            match key {
                b"svn:author" => {
                    self.rev_author.clear();
                    self.rev_author.extend_from_slice(value);
                }
                b"svn:date" => {
                    self.rev_date = parse_svn_date(value)?;
                }
                b"svn:log" => {
                    self.rev_log = Some(value.to_vec());
                }
                b"svn:sync-last-merged-rev" => {
                    self.last_merged_rev = Some(parse_int(value, "svn:sync-last-merged-rev")?);
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn verify_checksums(&self) -> Result<(), ReadError> {
        let node = &self.curr_node;

        if let Some(ref expected) = node.md5_checksum {
            let computed = format!("{:x}", md5::compute(&node.text));
            if computed.as_bytes() != expected.as_slice() {
                return Err(ReadError::ChecksumMismatch {
                    algo: "MD5",
                    path: node.path.clone(),
                    expected: expected.clone(),
                    computed,
                });
            }
        }

        if let Some(ref expected) = node.sha1_checksum {
            let mut hasher = gix_hash::hasher(gix_hash::Kind::Sha1);
            hasher.update(&node.text);
            let computed = hasher
                .try_finalize()
                .map_err(|_| ReadError::ChecksumMismatch {
                    algo: "SHA-1",
                    path: node.path.clone(),
                    expected: expected.clone(),
                    computed: "<collision attack detected>".into(),
                })?
                .to_string();
            if computed.as_bytes() != expected.as_slice() {
                return Err(ReadError::ChecksumMismatch {
                    algo: "SHA-1",
                    path: node.path.clone(),
                    expected: expected.clone(),
                    computed,
                });
            }
        }

        Ok(())
    }
}

fn parse_int<T: std::str::FromStr>(value: &[u8], field: &'static str) -> Result<T, ReadError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReadError::InvalidHeaderValue {
            field,
            value: value.to_vec(),
        })
}

/// `svn:date` values look like `2011-04-06T17:50:19.125169Z`; only the
/// seconds part is interpreted, as UTC.
fn parse_svn_date(value: &[u8]) -> Result<i64, ReadError> {
    let invalid = || ReadError::InvalidDate {
        value: value.to_vec(),
    };

    let head = value.get(..19).ok_or_else(invalid)?;
    let head = std::str::from_utf8(head).map_err(|_| invalid())?;
    let date =
        chrono::NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S").map_err(|_| invalid())?;
    Ok(date.and_utc().timestamp())
}
