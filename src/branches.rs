use std::collections::BTreeMap;
use std::io::Write as _;

use rustc_hash::FxHashMap;

use crate::paths;
use crate::svn::dump;

/// One branch routing declaration: a source path prefix mapped to a
/// destination branch (or tag) name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BranchSpec {
    pub(crate) prefix: Vec<u8>,
    pub(crate) name: String,
    pub(crate) is_tag: bool,
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
            Self::Io(ref e) => write!(f, "failed to read branches file: {e}"),
        }
    }
}

/// Loads the branch table. Tab-separated columns: 0 holds `t` for
/// tags, 1-3 are reserved, 4 is the source prefix, 5 the destination
/// name. Returns the declarations plus the number of validation
/// errors (duplicate prefixes, nested prefixes, duplicate names).
pub(crate) fn load(path: &std::path::Path) -> Result<(Vec<BranchSpec>, usize), LoadError> {
    let data = std::fs::read(path)?;

    let mut specs: Vec<BranchSpec> = Vec::new();
    let mut by_prefix = FxHashMap::<Vec<u8>, usize>::default();
    let mut errors = 0;

    for line in data.split(|&c| c == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line[0] == b'#' {
            continue;
        }

        let mut fields = line.split(|&c| c == b'\t');
        let is_tag = fields.next().unwrap_or_default().first() == Some(&b't');
        let _ = (fields.next(), fields.next(), fields.next());
        let prefix = fields.next().unwrap_or_default();
        let name = fields.next().unwrap_or_default();

        if prefix.is_empty() || name.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(name).into_owned();

        if by_prefix.contains_key(prefix) {
            tracing::warn!("branch prefix repeated: \"{}\"", prefix.escape_ascii());
            errors += 1;
            continue;
        }

        // No declared prefix may be an ancestor of another.
        for spec in specs.iter() {
            if paths::is_dir_prefix(&spec.prefix, prefix) {
                tracing::warn!(
                    "parent of branch prefix \"{}\" exists: \"{}\"",
                    prefix.escape_ascii(),
                    spec.prefix.escape_ascii(),
                );
                errors += 1;
            } else if paths::is_dir_prefix(prefix, &spec.prefix) {
                tracing::warn!(
                    "branch prefix \"{}\" is an ancestor of \"{}\"",
                    prefix.escape_ascii(),
                    spec.prefix.escape_ascii(),
                );
                errors += 1;
            }
        }

        if specs.iter().any(|spec| spec.name == name) {
            tracing::warn!("branch name repeated: \"{name}\"");
            errors += 1;
            continue;
        }

        by_prefix.insert(prefix.to_vec(), specs.len());
        specs.push(BranchSpec {
            prefix: prefix.to_vec(),
            name,
            is_tag,
        });
    }

    Ok((specs, errors))
}

/// Scanner behind the `branches` subcommand: infers branch roots from
/// observed activity, folding descendants into the first copied or
/// populated ancestor directory.
pub(crate) struct BranchesScanner {
    branches: BTreeMap<Vec<u8>, BranchInfo>,
}

struct BranchInfo {
    last_rev: u32,
    last_date: i64,
    changes: u64,
}

impl BranchesScanner {
    pub(crate) fn new() -> Self {
        Self {
            branches: BTreeMap::new(),
        }
    }

    pub(crate) fn process(&mut self, rev: u32, date: i64, node: &dump::Node) {
        if node.action != Some(dump::NodeAction::Delete)
            && (node.kind == Some(dump::NodeKind::File) || node.has_copy_from())
        {
            let dir = if node.kind == Some(dump::NodeKind::Dir) {
                node.path.as_slice()
            } else {
                paths::parent(&node.path).unwrap_or_default()
            };
            self.apply_action(rev, date, dir);
        }
    }

    fn apply_action(&mut self, rev: u32, date: i64, dir: &[u8]) {
        let key = if self.branches.contains_key(dir) {
            dir.to_vec()
        } else {
            // A directory seen for the first time supersedes anything
            // previously recorded below it.
            let descendants = self
                .branches
                .keys()
                .filter(|k| !k.is_empty() && paths::is_dir_prefix(dir, k) && k.as_slice() != dir)
                .cloned()
                .collect::<Vec<_>>();
            for k in descendants {
                self.branches.remove(&k);
            }

            let ancestor = self
                .branches
                .keys()
                .find(|k| !k.is_empty() && paths::is_dir_prefix(k, dir) && k.as_slice() != dir)
                .cloned();
            match ancestor {
                Some(k) => k,
                None => {
                    self.branches.insert(
                        dir.to_vec(),
                        BranchInfo {
                            last_rev: 0,
                            last_date: 0,
                            changes: 0,
                        },
                    );
                    dir.to_vec()
                }
            }
        };

        let info = self.branches.get_mut(&key).unwrap();
        if info.last_rev != rev {
            info.last_rev = rev;
            info.last_date = date;
            info.changes += 1;
        }
    }

    pub(crate) fn finish(self, out: &mut dyn std::io::Write) -> Result<(), std::io::Error> {
        for (prefix, info) in self.branches {
            let date = chrono::DateTime::from_timestamp(info.last_date, 0)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();

            let kind = if info.changes == 1 { "tag" } else { "branch" };
            write!(out, "{kind}\t{}\t{date}\t{}\t", info.last_rev, info.changes)?;
            out.write_all(&prefix)?;
            out.write_all(b"\t")?;
            out.write_all(&prefix)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}
