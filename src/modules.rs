use crate::branches::BranchSpec;
use crate::git;
use crate::paths;

/// A submodule repository: a peer store in a sibling directory of the
/// parent store, receiving rewritten mutations for its source prefixes.
pub(crate) struct Submodule {
    pub(crate) name: String,
    pub(crate) repository: git::Repository,
}

/// One `source: destination` line of the modules file.
struct Mapping {
    source: Vec<u8>,
    dest: Vec<u8>,
    module: usize,
}

pub(crate) struct ModuleSet {
    pub(crate) modules: Vec<Submodule>,
    mappings: Vec<Mapping>,
}

#[derive(Debug)]
pub(crate) enum LoadError {
    Io(std::io::Error),
    Store(git::StoreError),
}

impl From<std::io::Error> for LoadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<git::StoreError> for LoadError {
    #[inline]
    fn from(e: git::StoreError) -> Self {
        Self::Store(e)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read modules file: {e}"),
            Self::Store(ref e) => write!(f, "failed to initialize submodule store: {e}"),
        }
    }
}

impl ModuleSet {
    pub(crate) fn new() -> Self {
        Self {
            modules: Vec::new(),
            mappings: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Loads the modules file: ini-style `[name]` sections open a
    /// submodule (eagerly initializing its store next to the parent's
    /// and copying the parent's branch declarations), `source: dest`
    /// lines add mappings. `<ignore>` as a section or source name is a
    /// sentinel for "no mapping". Returns the set plus the number of
    /// validation errors (duplicate source paths).
    pub(crate) fn load(
        path: &std::path::Path,
        parent_store: &std::path::Path,
        branch_specs: &[BranchSpec],
    ) -> Result<(Self, usize), LoadError> {
        let data = std::fs::read(path)?;
        let store_base = parent_store.parent().unwrap_or(std::path::Path::new("."));

        let mut set = Self::new();
        let mut errors = 0;
        let mut curr_module: Option<usize> = None;

        for line in data.split(|&c| c == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }

            if line[0] == b'[' {
                let name = line
                    .strip_prefix(b"[")
                    .and_then(|l| l.strip_suffix(b"]"))
                    .unwrap_or(&line[1..]);
                if name == b"<ignore>" {
                    curr_module = None;
                    continue;
                }

                let name = String::from_utf8_lossy(name).into_owned();
                let mut repository = git::Repository::init(&store_base.join(&name), &name)?;

                // The submodule honors the same branch routing as its
                // parent.
                for spec in branch_specs {
                    repository.add_branch(&spec.prefix, &spec.name, spec.is_tag);
                }

                curr_module = Some(set.modules.len());
                set.modules.push(Submodule { name, repository });
                continue;
            }

            let Some(colon) = line.iter().position(|&c| c == b':') else {
                continue;
            };
            let Some(module) = curr_module else {
                continue;
            };

            let source = trim_dir(&line[..colon]);
            if source == b"<ignore>" {
                continue;
            }

            let mut dest = &line[(colon + 1)..];
            while dest.first() == Some(&b' ') || dest.first() == Some(&b'\t') {
                dest = &dest[1..];
            }
            let dest = if dest == b"." { &[][..] } else { trim_dir(dest) };

            if set.mappings.iter().any(|m| m.source == source) {
                tracing::warn!(
                    "duplicate submodule source path \"{}\" in [{}]",
                    source.escape_ascii(),
                    set.modules[module].name,
                );
                errors += 1;
                continue;
            }

            set.mappings.push(Mapping {
                source: source.to_vec(),
                dest: dest.to_vec(),
                module,
            });
        }

        Ok((set, errors))
    }

    /// Longest-match lookup of a branch-relative subpath against the
    /// mapping table. Returns the module index and the rewritten
    /// destination path.
    pub(crate) fn find(&self, subpath: &[u8]) -> Option<(usize, Vec<u8>)> {
        let mut dir = Some(subpath);
        while let Some(d) = dir {
            if let Some(mapping) = self.mappings.iter().find(|m| m.source == d) {
                let rest = paths::strip_dir_prefix(subpath, d);
                return Some((mapping.module, paths::join(&mapping.dest, rest)));
            }
            dir = paths::parent(d);
        }
        None
    }
}

fn trim_dir(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(b"/").unwrap_or(raw)
}
