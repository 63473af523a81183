use rustc_hash::FxHashMap;

mod loose;
mod objects;

pub(crate) use loose::StoreError;
pub(crate) use objects::{ObjData, ObjIdx, ObjectArena};

use gix_hash::ObjectId;

/// Commit signature and message for the revision being flushed,
/// stamped onto every commit the flush emits.
#[derive(Clone)]
pub(crate) struct CommitMeta {
    pub(crate) author: gix_actor::Signature,
    pub(crate) message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BranchId(usize);

pub(crate) struct Branch {
    pub(crate) name: String,
    pub(crate) prefix: Vec<u8>,
    pub(crate) is_tag: bool,
    /// Last written commit; `None` while the branch is absent or after
    /// it has been deleted.
    commit: Option<ObjIdx>,
    /// Commit under construction for the current revision.
    next_commit: Option<ObjIdx>,
}

/// Destination store facade: owns the in-memory object arena, the
/// on-disk loose store, the branch registry and the per-revision
/// pending-commit queue.
pub(crate) struct Repository {
    /// Submodule stores carry their name here; empty for the parent.
    pub(crate) repo_name: String,
    pub(crate) arena: ObjectArena,
    store: loose::LooseStore,
    branches: Vec<Branch>,
    by_path: FxHashMap<Vec<u8>, BranchId>,
    by_name: FxHashMap<String, BranchId>,
    history_branch: BranchId,
    commit_queue: Vec<(BranchId, ObjIdx)>,
}

impl Repository {
    pub(crate) fn init(path: &std::path::Path, repo_name: &str) -> Result<Self, StoreError> {
        let store = loose::LooseStore::init(path)?;

        let mut repo = Self {
            repo_name: repo_name.into(),
            arena: ObjectArena::new(),
            store,
            branches: Vec::new(),
            by_path: FxHashMap::default(),
            by_name: FxHashMap::default(),
            history_branch: BranchId(0),
            commit_queue: Vec::new(),
        };

        // The flat-history branch mirrors the full unmapped tree and is
        // finalized as a tag. It takes no part in path routing.
        repo.branches.push(Branch {
            name: "flat-history".into(),
            prefix: Vec::new(),
            is_tag: true,
            commit: None,
            next_commit: None,
        });

        Ok(repo)
    }

    #[inline]
    pub(crate) fn path(&self) -> &std::path::Path {
        self.store.path()
    }

    /// Registers a routed branch. Prefix and name uniqueness is the
    /// branch table's responsibility.
    pub(crate) fn add_branch(&mut self, prefix: &[u8], name: &str, is_tag: bool) -> BranchId {
        let id = BranchId(self.branches.len());
        self.branches.push(Branch {
            name: name.into(),
            prefix: prefix.to_vec(),
            is_tag,
            commit: None,
            next_commit: None,
        });
        self.by_path.insert(prefix.to_vec(), id);
        self.by_name.insert(name.into(), id);
        id
    }

    #[inline]
    pub(crate) fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id.0]
    }

    /// Longest-ancestor prefix match; the empty prefix (implicit
    /// `master`) matches every path.
    pub(crate) fn find_branch_by_path(&self, path: &[u8]) -> Option<BranchId> {
        let mut dir = Some(path);
        while let Some(d) = dir {
            if let Some(&id) = self.by_path.get(d) {
                return Some(id);
            }
            dir = crate::paths::parent(d);
        }
        self.by_path.get(b"".as_slice()).copied()
    }

    pub(crate) fn find_branch_by_name(&self, name: &str) -> Option<BranchId> {
        self.by_name.get(name).copied()
    }

    /// The pending commit for `branch` in the current revision,
    /// materialized on first request: a clone of the branch's previous
    /// commit, or for a fresh branch a `new_branch` commit whose parent
    /// is the copy-from branch's last commit when one exists.
    pub(crate) fn get_commit(&mut self, branch: BranchId, from_branch: Option<BranchId>) -> ObjIdx {
        if let Some(commit) = self.branches[branch.0].next_commit {
            return commit;
        }

        let commit = match self.branches[branch.0].commit {
            Some(prev) => self.arena.clone_commit(prev),
            None => {
                let parent = from_branch.and_then(|b| self.branches[b.0].commit);
                self.arena.create_commit(parent, true)
            }
        };

        self.branches[branch.0].next_commit = Some(commit);
        self.commit_queue.push((branch, commit));
        commit
    }

    /// Pending commit of the flat-history branch; its tree is the
    /// historical tree.
    pub(crate) fn history_commit(&mut self) -> ObjIdx {
        self.get_commit(self.history_branch, None)
    }

    /// The historical tree as of the last flushed revision, for
    /// snapshotting into the cache.
    pub(crate) fn history_tree(&self) -> Option<ObjIdx> {
        self.branches[self.history_branch.0]
            .commit
            .and_then(|c| self.arena.commit(c).tree)
    }

    pub(crate) fn create_blob(&mut self, name: &[u8], data: &[u8]) -> Result<ObjIdx, StoreError> {
        let oid = self.store.put_raw(gix_object::Kind::Blob, data)?;
        Ok(self.arena.create_blob(name, oid))
    }

    /// Flushes all pending commits of the closing revision. Returns
    /// whether any branch was modified. A pending commit without a tree
    /// retires its branch: the last commit is preserved under
    /// `refs/tags/<name>__deleted_r<revision>` and the branch becomes
    /// absent again.
    pub(crate) fn write(&mut self, revision: u32, meta: &CommitMeta) -> Result<bool, StoreError> {
        let mut modified = false;

        for (branch_id, commit_idx) in std::mem::take(&mut self.commit_queue) {
            self.branches[branch_id.0].next_commit = None;

            let Some(tree_idx) = self.arena.commit(commit_idx).tree else {
                modified |= self.delete_branch(branch_id, revision)?;
                continue;
            };

            let tree_oid = match self.write_tree(tree_idx)? {
                Some(oid) => oid,
                None => self.store.empty_tree_oid(),
            };

            let commit = self.arena.commit(commit_idx);
            if !commit.new_branch {
                if let Some(parent) = commit.parent {
                    if self.commit_tree_oid(parent) == Some(tree_oid) {
                        // Nothing changed under this branch's prefix.
                        continue;
                    }
                }
            }

            let parent_oid = self
                .arena
                .commit(commit_idx)
                .parent
                .and_then(|p| self.arena.commit(p).oid);

            let commit_obj = gix_object::Commit {
                tree: tree_oid,
                parents: parent_oid.into_iter().collect(),
                author: meta.author.clone(),
                committer: meta.author.clone(),
                encoding: None,
                message: meta.message.clone().into(),
                extra_headers: Vec::new(),
            };
            let oid = self.store.put(&commit_obj)?;

            self.arena.commit_mut(commit_idx).oid = Some(oid);
            self.branches[branch_id.0].commit = Some(commit_idx);
            modified = true;
        }

        Ok(modified)
    }

    /// Moves the branch's last commit to a preserved deletion tag and
    /// clears the branch. Returns whether there was anything to
    /// preserve.
    pub(crate) fn delete_branch(
        &mut self,
        branch_id: BranchId,
        revision: u32,
    ) -> Result<bool, StoreError> {
        let Some(last) = self.branches[branch_id.0].commit else {
            return Ok(false);
        };
        if self.arena.commit(last).oid.is_none() {
            return Ok(false);
        }

        let name = self.branches[branch_id.0].name.clone();
        let tag_name = format!("{name}__deleted_r{revision}");
        self.create_tag(last, &tag_name)?;
        self.store
            .remove_ref(&branch_ref_name(&self.branches[branch_id.0]))?;
        tracing::info!("deleted branch {name} at r{revision}, preserved as tag {tag_name}");

        self.branches[branch_id.0].commit = None;
        Ok(true)
    }

    /// Updates every live branch's reference: `refs/heads/<name>`, or
    /// `refs/tags/<name>` for tags (the flat-history branch included).
    pub(crate) fn write_branches(&mut self) -> Result<(), StoreError> {
        for branch in self.branches.iter() {
            let Some(commit) = branch.commit else {
                continue;
            };
            let Some(oid) = self.arena.commit(commit).oid else {
                continue;
            };
            self.store.write_ref(&branch_ref_name(branch), oid)?;
        }
        Ok(())
    }

    pub(crate) fn create_tag(&mut self, commit: ObjIdx, name: &str) -> Result<(), StoreError> {
        let Some(oid) = self.arena.commit(commit).oid else {
            return Ok(());
        };
        self.store.write_ref(&format!("refs/tags/{name}"), oid)
    }

    pub(crate) fn garbage_collect(&self) -> Result<(), StoreError> {
        self.store.garbage_collect()
    }

    /// Recursively persists a tree. Empty trees are never written;
    /// `None` tells the caller to fall back to the well-known empty
    /// tree where one is structurally required.
    fn write_tree(&mut self, tree: ObjIdx) -> Result<Option<ObjectId>, StoreError> {
        {
            let data = self.arena.tree(tree);
            if data.entries.is_empty() {
                return Ok(None);
            }
            if data.written && !data.modified {
                return Ok(data.oid);
            }
        }

        let children = self
            .arena
            .tree(tree)
            .entries
            .iter()
            .map(|(name, &idx)| (name.clone(), idx))
            .collect::<Vec<_>>();

        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            if self.arena.is_tree(child) {
                // Emptied subtrees drop out of their parent entirely.
                if let Some(sub_oid) = self.write_tree(child)? {
                    entries.push(gix_object::tree::Entry {
                        mode: gix_object::tree::EntryKind::Tree.into(),
                        filename: name.into(),
                        oid: sub_oid,
                    });
                }
            } else if let ObjData::Blob(ref blob) = *self.arena.data(child) {
                entries.push(gix_object::tree::Entry {
                    mode: blob.mode.into(),
                    filename: name.into(),
                    oid: blob.oid,
                });
            }
        }

        entries.sort();
        let oid = self.store.put(&gix_object::Tree { entries })?;

        let data = self.arena.tree_mut(tree);
        data.oid = Some(oid);
        data.written = true;
        data.modified = false;

        Ok(Some(oid))
    }

    /// The persisted tree id of a written commit, with empty trees
    /// resolving to the well-known empty tree id.
    fn commit_tree_oid(&self, commit: ObjIdx) -> Option<ObjectId> {
        match self.arena.commit(commit).tree {
            Some(tree) => {
                if self.arena.tree_is_empty(tree) {
                    Some(self.store.empty_tree_oid())
                } else {
                    self.arena.tree(tree).oid
                }
            }
            None => None,
        }
    }
}

fn branch_ref_name(branch: &Branch) -> String {
    if branch.is_tag {
        format!("refs/tags/{}", branch.name)
    } else {
        format!("refs/heads/{}", branch.name)
    }
}
