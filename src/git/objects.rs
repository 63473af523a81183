use std::collections::BTreeMap;

use gix_hash::ObjectId;
use gix_object::tree::EntryKind;

/// Index of an object record in the arena. Distinct from the content
/// hash: a record gets its `ObjectId` once persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ObjIdx(u32);

impl ObjIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct ObjRecord {
    pub(crate) name: Vec<u8>,
    pub(crate) data: ObjData,
}

pub(crate) enum ObjData {
    Blob(BlobData),
    Tree(TreeData),
    Commit(CommitData),
}

pub(crate) struct BlobData {
    pub(crate) mode: EntryKind,
    pub(crate) oid: ObjectId,
}

pub(crate) struct TreeData {
    /// Ordered set of named entries; values share structure with past
    /// copies of this tree.
    pub(crate) entries: BTreeMap<Vec<u8>, ObjIdx>,
    /// The persisted id reflects the current entry set.
    pub(crate) written: bool,
    /// In-memory state differs from the last write.
    pub(crate) modified: bool,
    pub(crate) oid: Option<ObjectId>,
}

pub(crate) struct CommitData {
    pub(crate) parent: Option<ObjIdx>,
    pub(crate) tree: Option<ObjIdx>,
    /// First commit of a branch: flushed even when its tree matches the
    /// parent's.
    pub(crate) new_branch: bool,
    pub(crate) oid: Option<ObjectId>,
}

/// Owns every in-memory object record. Trees are copy-on-write: a copy
/// shares all entry indices, and mutations along a path clone only the
/// spine they touch, so snapshots handed out earlier keep their view.
pub(crate) struct ObjectArena {
    records: Vec<ObjRecord>,
}

impl ObjectArena {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    fn alloc(&mut self, record: ObjRecord) -> ObjIdx {
        let idx = u32::try_from(self.records.len()).expect("object arena overflow");
        self.records.push(record);
        ObjIdx(idx)
    }

    #[inline]
    pub(crate) fn data(&self, idx: ObjIdx) -> &ObjData {
        &self.records[idx.idx()].data
    }

    pub(crate) fn is_blob(&self, idx: ObjIdx) -> bool {
        matches!(self.records[idx.idx()].data, ObjData::Blob(_))
    }

    pub(crate) fn is_tree(&self, idx: ObjIdx) -> bool {
        matches!(self.records[idx.idx()].data, ObjData::Tree(_))
    }

    pub(crate) fn tree(&self, idx: ObjIdx) -> &TreeData {
        match self.records[idx.idx()].data {
            ObjData::Tree(ref tree) => tree,
            _ => panic!("object record is not a tree"),
        }
    }

    pub(crate) fn tree_mut(&mut self, idx: ObjIdx) -> &mut TreeData {
        match self.records[idx.idx()].data {
            ObjData::Tree(ref mut tree) => tree,
            _ => panic!("object record is not a tree"),
        }
    }

    pub(crate) fn commit(&self, idx: ObjIdx) -> &CommitData {
        match self.records[idx.idx()].data {
            ObjData::Commit(ref commit) => commit,
            _ => panic!("object record is not a commit"),
        }
    }

    pub(crate) fn commit_mut(&mut self, idx: ObjIdx) -> &mut CommitData {
        match self.records[idx.idx()].data {
            ObjData::Commit(ref mut commit) => commit,
            _ => panic!("object record is not a commit"),
        }
    }

    pub(crate) fn create_blob(&mut self, name: &[u8], oid: ObjectId) -> ObjIdx {
        self.alloc(ObjRecord {
            name: name.to_vec(),
            data: ObjData::Blob(BlobData {
                mode: EntryKind::Blob,
                oid,
            }),
        })
    }

    pub(crate) fn create_tree(&mut self, name: &[u8]) -> ObjIdx {
        self.alloc(ObjRecord {
            name: name.to_vec(),
            data: ObjData::Tree(TreeData {
                entries: BTreeMap::new(),
                written: false,
                modified: false,
                oid: None,
            }),
        })
    }

    pub(crate) fn create_commit(&mut self, parent: Option<ObjIdx>, new_branch: bool) -> ObjIdx {
        self.alloc(ObjRecord {
            name: Vec::new(),
            data: ObjData::Commit(CommitData {
                parent,
                tree: None,
                new_branch,
                oid: None,
            }),
        })
    }

    /// A copy of `idx` renamed to `name`. Blobs share their persisted
    /// id (and are returned as-is when the name already matches);
    /// trees always get a fresh record sharing all entry indices.
    pub(crate) fn copy_to_name(&mut self, idx: ObjIdx, name: &[u8]) -> ObjIdx {
        match self.records[idx.idx()].data {
            ObjData::Blob(BlobData { mode, oid }) => {
                if self.records[idx.idx()].name == name {
                    idx
                } else {
                    self.alloc(ObjRecord {
                        name: name.to_vec(),
                        data: ObjData::Blob(BlobData { mode, oid }),
                    })
                }
            }
            ObjData::Tree(ref tree) => {
                let entries = tree.entries.clone();
                self.alloc(ObjRecord {
                    name: name.to_vec(),
                    data: ObjData::Tree(TreeData {
                        entries,
                        written: false,
                        modified: false,
                        oid: None,
                    }),
                })
            }
            ObjData::Commit(_) => panic!("commits are not copied by name"),
        }
    }

    /// Deep-imports a record from another store's arena, renamed to
    /// `name`. Only names, modes, and persisted ids cross over; the
    /// object bytes are expected to exist in the destination store
    /// already (submodules see every file under their prefixes as it
    /// is added).
    pub(crate) fn import_from(&mut self, src: &ObjectArena, idx: ObjIdx, name: &[u8]) -> ObjIdx {
        match src.records[idx.idx()].data {
            ObjData::Blob(BlobData { mode, oid }) => self.alloc(ObjRecord {
                name: name.to_vec(),
                data: ObjData::Blob(BlobData { mode, oid }),
            }),
            ObjData::Tree(ref tree) => {
                let mut entries = BTreeMap::new();
                for (entry_name, &entry) in tree.entries.iter() {
                    let imported = self.import_from(src, entry, entry_name);
                    entries.insert(entry_name.clone(), imported);
                }
                self.alloc(ObjRecord {
                    name: name.to_vec(),
                    data: ObjData::Tree(TreeData {
                        entries,
                        written: false,
                        modified: false,
                        oid: None,
                    }),
                })
            }
            ObjData::Commit(_) => panic!("commits are not imported"),
        }
    }

    /// A new pending commit chained to `idx`, with a copy of its tree.
    pub(crate) fn clone_commit(&mut self, idx: ObjIdx) -> ObjIdx {
        let tree = self.commit(idx).tree;
        let tree_copy = tree.map(|t| {
            let name = self.records[t.idx()].name.clone();
            self.copy_to_name(t, &name)
        });

        self.alloc(ObjRecord {
            name: Vec::new(),
            data: ObjData::Commit(CommitData {
                parent: Some(idx),
                tree: tree_copy,
                new_branch: false,
                oid: None,
            }),
        })
    }

    pub(crate) fn tree_is_empty(&self, idx: ObjIdx) -> bool {
        self.tree(idx).entries.is_empty()
    }

    /// Pure read; never clones.
    pub(crate) fn tree_lookup(&self, tree: ObjIdx, path: &[u8]) -> Option<ObjIdx> {
        let mut cur = tree;
        for segment in path.split(|&c| c == b'/') {
            match self.records[cur.idx()].data {
                ObjData::Tree(ref data) => {
                    cur = *data.entries.get(segment)?;
                }
                _ => return None,
            }
        }
        Some(cur)
    }

    /// Inserts `obj` at `path` below `tree`, creating intermediate
    /// trees eagerly. Existing subtrees along the path are cloned
    /// before descent so shared snapshots keep their view.
    pub(crate) fn tree_update(&mut self, tree: ObjIdx, path: &[u8], obj: ObjIdx) {
        assert!(!path.is_empty(), "attempted to modify a tree root");

        let (head, rest) = split_segment(path);

        if rest.is_empty() {
            debug_assert_eq!(self.records[obj.idx()].name, head);

            let obj_is_blob = self.is_blob(obj);
            let data = self.tree_mut(tree);
            let prev = data.entries.insert(head.to_vec(), obj);
            data.modified = true;

            // Swapping the id of an existing blob entry leaves the
            // written structure intact; anything else forces a rewrite.
            let blob_swap = obj_is_blob && prev.is_some_and(|p| self.is_blob(p));
            if !blob_swap {
                self.tree_mut(tree).written = false;
            }
        } else {
            let child = self.tree(tree).entries.get(head).copied();
            let child = match child {
                Some(c) if self.is_tree(c) => self.copy_to_name(c, head),
                _ => self.create_tree(head),
            };

            let data = self.tree_mut(tree);
            data.entries.insert(head.to_vec(), child);
            data.written = false;
            data.modified = true;

            self.tree_update(child, rest, obj);
        }
    }

    /// Removes `path` below `tree`. Subtrees emptied by the removal
    /// cascade out of their parents. Removing an absent path is fine:
    /// the source system tracks empty directories this model never
    /// materializes.
    pub(crate) fn tree_remove(&mut self, tree: ObjIdx, path: &[u8]) {
        assert!(!path.is_empty(), "attempted to remove a tree root");

        let (head, rest) = split_segment(path);

        let Some(child) = self.tree(tree).entries.get(head).copied() else {
            return;
        };

        if rest.is_empty() {
            let data = self.tree_mut(tree);
            data.entries.remove(head);
            data.written = false;
            data.modified = true;
        } else {
            if !self.is_tree(child) {
                return;
            }
            let copied = self.copy_to_name(child, head);
            self.tree_remove(copied, rest);

            let emptied = self.tree_is_empty(copied);
            let data = self.tree_mut(tree);
            if emptied {
                data.entries.remove(head);
            } else {
                data.entries.insert(head.to_vec(), copied);
            }
            data.written = false;
            data.modified = true;
        }
    }

    /// Applies an update through a pending commit, materializing its
    /// root tree on first use. An empty path replaces the whole tree
    /// (the branch root itself was copied).
    pub(crate) fn commit_update(&mut self, commit: ObjIdx, path: &[u8], obj: ObjIdx) {
        if path.is_empty() {
            if self.is_tree(obj) {
                self.commit_mut(commit).tree = Some(obj);
            }
            return;
        }

        let tree = match self.commit(commit).tree {
            Some(t) => t,
            None => {
                let t = self.create_tree(b"");
                self.commit_mut(commit).tree = Some(t);
                t
            }
        };
        self.tree_update(tree, path, obj);
    }

    /// Applies a removal through a pending commit. An empty path clears
    /// the tree entirely; flushing a tree-less commit retires its
    /// branch.
    pub(crate) fn commit_remove(&mut self, commit: ObjIdx, path: &[u8]) {
        if path.is_empty() {
            self.commit_mut(commit).tree = None;
            return;
        }

        if let Some(tree) = self.commit(commit).tree {
            self.tree_remove(tree, path);
        }
    }

    /// Indented listing of a tree, for diagnostics.
    pub(crate) fn dump_tree(&self, tree: ObjIdx, out: &mut String, depth: usize) {
        let data = self.tree(tree);
        for (name, &entry) in data.entries.iter() {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&name.escape_ascii().to_string());
            match self.records[entry.idx()].data {
                ObjData::Tree(_) => {
                    out.push_str("/\n");
                    self.dump_tree(entry, out, depth + 1);
                }
                _ => out.push('\n'),
            }
        }
    }
}

fn split_segment(path: &[u8]) -> (&[u8], &[u8]) {
    match path.iter().position(|&c| c == b'/') {
        Some(i) => (&path[..i], &path[(i + 1)..]),
        None => (path, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjData, ObjectArena};
    use gix_hash::ObjectId;

    fn blob_oid(tag: u8) -> ObjectId {
        ObjectId::from_hex(format!("{tag:02x}{}", "00".repeat(19)).as_bytes()).unwrap()
    }

    #[test]
    fn update_creates_intermediate_trees() {
        let mut arena = ObjectArena::new();
        let root = arena.create_tree(b"");
        let blob = arena.create_blob(b"a.txt", blob_oid(1));

        arena.tree_update(root, b"trunk/src/a.txt", blob);

        let found = arena.tree_lookup(root, b"trunk/src/a.txt").unwrap();
        assert_eq!(found, blob);
        assert!(arena.tree_lookup(root, b"trunk/other").is_none());
    }

    #[test]
    fn remove_cascades_empty_subtrees() {
        let mut arena = ObjectArena::new();
        let root = arena.create_tree(b"");
        let blob = arena.create_blob(b"a.txt", blob_oid(1));
        arena.tree_update(root, b"trunk/src/a.txt", blob);

        arena.tree_remove(root, b"trunk/src/a.txt");
        assert!(arena.tree_is_empty(root));
    }

    #[test]
    fn removing_absent_paths_is_a_no_op() {
        let mut arena = ObjectArena::new();
        let root = arena.create_tree(b"");
        let blob = arena.create_blob(b"a.txt", blob_oid(1));
        arena.tree_update(root, b"trunk/a.txt", blob);

        arena.tree_remove(root, b"trunk/missing");
        arena.tree_remove(root, b"elsewhere/x");
        assert!(arena.tree_lookup(root, b"trunk/a.txt").is_some());
    }

    #[test]
    fn copies_share_entries_until_mutated() {
        let mut arena = ObjectArena::new();
        let root = arena.create_tree(b"");
        let blob_a = arena.create_blob(b"a.txt", blob_oid(1));
        arena.tree_update(root, b"trunk/a.txt", blob_a);

        // Snapshot, then mutate the original.
        let snapshot = arena.copy_to_name(root, b"");
        let blob_b = arena.create_blob(b"b.txt", blob_oid(2));
        arena.tree_update(root, b"trunk/b.txt", blob_b);
        arena.tree_remove(root, b"trunk/a.txt");

        // The snapshot still sees the old state.
        assert!(arena.tree_lookup(snapshot, b"trunk/a.txt").is_some());
        assert!(arena.tree_lookup(snapshot, b"trunk/b.txt").is_none());
        assert!(arena.tree_lookup(root, b"trunk/b.txt").is_some());
        assert!(arena.tree_lookup(root, b"trunk/a.txt").is_none());
    }

    #[test]
    fn copied_blobs_share_their_id() {
        let mut arena = ObjectArena::new();
        let blob = arena.create_blob(b"a.txt", blob_oid(7));

        let same = arena.copy_to_name(blob, b"a.txt");
        assert_eq!(same, blob);

        let renamed = arena.copy_to_name(blob, b"b.txt");
        assert_ne!(renamed, blob);
        match (arena.data(blob), arena.data(renamed)) {
            (ObjData::Blob(a), ObjData::Blob(b)) => assert_eq!(a.oid, b.oid),
            _ => unreachable!(),
        }
        assert_eq!(arena.records[renamed.idx()].name, b"b.txt");
    }

    #[test]
    fn blob_swap_keeps_written_structure() {
        let mut arena = ObjectArena::new();
        let root = arena.create_tree(b"");
        let blob_a = arena.create_blob(b"a.txt", blob_oid(1));
        arena.tree_update(root, b"a.txt", blob_a);

        arena.tree_mut(root).written = true;
        arena.tree_mut(root).modified = false;

        let blob_a2 = arena.create_blob(b"a.txt", blob_oid(2));
        arena.tree_update(root, b"a.txt", blob_a2);
        assert!(arena.tree(root).written);
        assert!(arena.tree(root).modified);

        let blob_new = arena.create_blob(b"new.txt", blob_oid(3));
        arena.tree_update(root, b"new.txt", blob_new);
        assert!(!arena.tree(root).written);
    }

    #[test]
    fn commit_root_operations() {
        let mut arena = ObjectArena::new();
        let commit = arena.create_commit(None, true);

        let tree = arena.create_tree(b"topic");
        let blob = arena.create_blob(b"a.txt", blob_oid(1));
        arena.tree_update(tree, b"a.txt", blob);

        // Copying onto the branch root replaces the whole tree.
        arena.commit_update(commit, b"", tree);
        let root = arena.commit(commit).tree.unwrap();
        assert!(arena.tree_lookup(root, b"a.txt").is_some());

        // Deleting the branch root clears it.
        arena.commit_remove(commit, b"");
        assert!(arena.commit(commit).tree.is_none());
    }

    #[test]
    fn cloned_commit_chains_and_copies() {
        let mut arena = ObjectArena::new();
        let commit = arena.create_commit(None, true);
        let blob = arena.create_blob(b"a.txt", blob_oid(1));
        arena.commit_update(commit, b"a.txt", blob);

        let next = arena.clone_commit(commit);
        assert_eq!(arena.commit(next).parent, Some(commit));
        assert!(!arena.commit(next).new_branch);

        // Mutating the clone leaves the parent's tree alone.
        arena.commit_remove(next, b"a.txt");
        let old_tree = arena.commit(commit).tree.unwrap();
        assert!(arena.tree_lookup(old_tree, b"a.txt").is_some());
    }
}
