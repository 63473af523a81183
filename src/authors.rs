use std::collections::BTreeMap;
use std::io::Write as _;

use rustc_hash::FxHashMap;

/// Author identity table: maps dump author ids to display name and
/// email. Tab-separated lines `id<TAB>name<TAB>email`; `#` starts a
/// comment. Emails use a legacy escape convention where `<>` stands for
/// `@` and `~` for `.`.
pub(crate) struct Authors {
    map: FxHashMap<Vec<u8>, AuthorInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct AuthorInfo {
    name: String,
    email: String,
}

#[derive(Debug)]
pub(crate) enum LoadError {
    Io(std::io::Error),
}

impl From<std::io::Error> for LoadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read authors file: {e}"),
        }
    }
}

impl Authors {
    pub(crate) fn new() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }

    /// Loads the table, returning it together with the number of
    /// validation errors found (duplicate ids). Errors are reported but
    /// do not abort loading.
    pub(crate) fn load(path: &std::path::Path) -> Result<(Self, usize), LoadError> {
        let data = std::fs::read(path)?;

        let mut map = FxHashMap::default();
        let mut errors = 0;

        for line in data.split(|&c| c == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }

            let mut fields = line.split(|&c| c == b'\t');
            let id = fields.next().unwrap_or_default();
            let raw_name = fields.next().unwrap_or_default();
            let raw_email = fields.next().unwrap_or_default();

            if id.is_empty() {
                continue;
            }

            let name = unescape(raw_name);
            let name = if name == "Unknown" {
                String::from_utf8_lossy(id).into_owned()
            } else {
                name
            };
            let email = unescape(raw_email);

            if map
                .insert(id.to_vec(), AuthorInfo { name, email })
                .is_some()
            {
                tracing::warn!("author id repeated: \"{}\"", id.escape_ascii());
                errors += 1;
            }
        }

        Ok((Self { map }, errors))
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn get(&self, id: &[u8]) -> Option<(&str, &str)> {
        self.map
            .get(id)
            .map(|info| (info.name.as_str(), info.email.as_str()))
    }
}

fn unescape(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rem = raw;
    while let Some((&b, rest)) = rem.split_first() {
        if b == b'<' && rest.first() == Some(&b'>') {
            out.push('@');
            rem = &rest[1..];
        } else if b == b'~' {
            out.push('.');
            rem = rest;
        } else {
            out.push(char::from(b));
            rem = rest;
        }
    }
    out
}

/// Scanner behind the `authors` subcommand: counts, per author id, the
/// number of revisions authored, to bootstrap an authors table.
pub(crate) struct AuthorsScanner {
    last_rev: Option<u32>,
    counts: BTreeMap<Vec<u8>, u64>,
}

impl AuthorsScanner {
    pub(crate) fn new() -> Self {
        Self {
            last_rev: None,
            counts: BTreeMap::new(),
        }
    }

    pub(crate) fn process(&mut self, rev: u32, author: &[u8]) {
        if self.last_rev == Some(rev) {
            return;
        }
        self.last_rev = Some(rev);

        if !author.is_empty() {
            *self.counts.entry(author.to_vec()).or_insert(0) += 1;
        }
    }

    pub(crate) fn finish(self, out: &mut dyn std::io::Write) -> Result<(), std::io::Error> {
        for (id, count) in self.counts {
            out.write_all(&id)?;
            writeln!(out, "\t\t\t{count}")?;
        }
        Ok(())
    }
}
