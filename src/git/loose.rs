use std::io::Write as _;
use std::path::{Path, PathBuf};

use gix_hash::ObjectId;

#[derive(Debug)]
pub(crate) enum StoreError {
    CreateDirError {
        path: PathBuf,
        error: std::io::Error,
    },
    CreateFileError {
        path: PathBuf,
        error: std::io::Error,
    },
    WriteFileError {
        path: PathBuf,
        error: std::io::Error,
    },
    RenameError {
        source_path: PathBuf,
        dest_path: PathBuf,
        error: std::io::Error,
    },
    RemoveFileError {
        path: PathBuf,
        error: std::io::Error,
    },
    HashError,
    GcSpawnError {
        error: std::io::Error,
    },
    GcFailed {
        status: std::process::ExitStatus,
    },
}

impl std::error::Error for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CreateDirError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to create directory {path:?}: {error}")
            }
            Self::CreateFileError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to create file {path:?}: {error}")
            }
            Self::WriteFileError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to write file {path:?}: {error}")
            }
            Self::RenameError {
                ref source_path,
                ref dest_path,
                ref error,
            } => {
                write!(
                    f,
                    "failed to rename {source_path:?} to {dest_path:?}: {error}"
                )
            }
            Self::RemoveFileError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to remove file {path:?}: {error}")
            }
            Self::HashError => write!(f, "failed to hash object"),
            Self::GcSpawnError { ref error } => {
                write!(f, "failed to spawn \"git gc\": {error}")
            }
            Self::GcFailed { ref status } => {
                write!(f, "\"git gc\" exited with {status}")
            }
        }
    }
}

/// On-disk half of the object store: a bare repository layout with
/// zlib-deflated loose objects and plain-file references. Every object
/// is written exactly once; `git gc` can repack afterwards.
pub(crate) struct LooseStore {
    path: PathBuf,
    hash_kind: gix_hash::Kind,
    empty_tree_oid: ObjectId,
}

impl LooseStore {
    pub(crate) fn init(path: &Path) -> Result<Self, StoreError> {
        let hash_kind = gix_hash::Kind::Sha1;

        create_dir_all(path)?;
        create_dir_all(&path.join("objects").join("info"))?;
        create_dir_all(&path.join("objects").join("pack"))?;
        create_dir_all(&path.join("refs").join("heads"))?;
        create_dir_all(&path.join("refs").join("tags"))?;
        create_dir_all(&path.join("info"))?;

        create_file(&path.join("info").join("exclude"), b"")?;
        create_file(&path.join("HEAD"), b"ref: refs/heads/master\n")?;
        create_file(
            &path.join("config"),
            b"[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n",
        )?;

        let mut store = Self {
            path: path.to_path_buf(),
            hash_kind,
            empty_tree_oid: ObjectId::null(hash_kind),
        };
        store.empty_tree_oid = store.put(&gix_object::Tree::empty())?;

        Ok(store)
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn empty_tree_oid(&self) -> ObjectId {
        self.empty_tree_oid
    }

    pub(crate) fn put(&self, object: &impl gix_object::WriteTo) -> Result<ObjectId, StoreError> {
        let mut data = Vec::new();
        object
            .write_to(&mut data)
            .expect("serializing to a memory buffer cannot fail");
        self.put_raw(object.kind(), &data)
    }

    /// Persists one object, returning its content hash. Re-putting the
    /// same content is a no-op.
    pub(crate) fn put_raw(
        &self,
        kind: gix_object::Kind,
        data: &[u8],
    ) -> Result<ObjectId, StoreError> {
        let oid = gix_object::compute_hash(self.hash_kind, kind, data);

        let hex = oid.to_string();
        let dir = self.path.join("objects").join(&hex[..2]);
        let final_path = dir.join(&hex[2..]);
        if final_path.exists() {
            return Ok(oid);
        }

        create_dir_all(&dir)?;

        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let write_err = |e| StoreError::WriteFileError {
            path: final_path.clone(),
            error: e,
        };
        encoder.write_all(kind.as_bytes()).map_err(write_err)?;
        write!(encoder, " {}\0", data.len()).map_err(write_err)?;
        encoder.write_all(data).map_err(write_err)?;
        let compressed = encoder.finish().map_err(write_err)?;

        let tmp_path = dir.join(format!("tmp_{}", &hex[2..]));
        create_file(&tmp_path, &compressed)?;
        std::fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::RenameError {
            source_path: tmp_path,
            dest_path: final_path,
            error: e,
        })?;

        Ok(oid)
    }

    /// Points `ref_name` (e.g. `refs/heads/master`) at `oid`,
    /// overwriting any previous value.
    pub(crate) fn write_ref(&self, ref_name: &str, oid: ObjectId) -> Result<(), StoreError> {
        let ref_path = self.path.join(ref_name);
        if let Some(parent) = ref_path.parent() {
            create_dir_all(parent)?;
        }

        std::fs::write(&ref_path, format!("{oid}\n")).map_err(|e| StoreError::WriteFileError {
            path: ref_path,
            error: e,
        })
    }

    pub(crate) fn remove_ref(&self, ref_name: &str) -> Result<(), StoreError> {
        let ref_path = self.path.join(ref_name);
        match std::fs::remove_file(&ref_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::RemoveFileError {
                path: ref_path,
                error: e,
            }),
        }
    }

    pub(crate) fn garbage_collect(&self) -> Result<(), StoreError> {
        let status = std::process::Command::new("git")
            .arg("gc")
            .arg("--quiet")
            .current_dir(&self.path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .status()
            .map_err(|e| StoreError::GcSpawnError { error: e })?;
        if !status.success() {
            return Err(StoreError::GcFailed { status });
        }
        Ok(())
    }
}

fn create_dir_all(path: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(path).map_err(|e| StoreError::CreateDirError {
        path: path.to_path_buf(),
        error: e,
    })
}

fn create_file(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    std::fs::write(path, data).map_err(|e| StoreError::CreateFileError {
        path: path.to_path_buf(),
        error: e,
    })
}
