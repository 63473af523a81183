use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use crate::authors::Authors;
use crate::branches::BranchSpec;
use crate::git::{self, BranchId, CommitMeta, ObjIdx};
use crate::modules::ModuleSet;
use crate::node_queue;
use crate::paths;
use crate::svn::dump::{DumpFile, Node, NodeAction, NodeKind, RevInfo};
use crate::term_out::StatusPrint;

/// Fatal conversion failure. The failure site has already reported the
/// cause; `main` turns this into a non-zero exit.
#[derive(Debug)]
pub(crate) struct ConvertError;

pub(crate) struct Options {
    pub(crate) authors_file: Option<PathBuf>,
    pub(crate) branches_file: Option<PathBuf>,
    pub(crate) modules_file: Option<PathBuf>,
    pub(crate) skip_prescan: bool,
    pub(crate) start: Option<u32>,
    pub(crate) cutoff: Option<u32>,
    pub(crate) gc_every: Option<u32>,
    pub(crate) pipeline: bool,
}

const QUEUE_CAPACITY: usize = 256;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Pass {
    Prescan,
    Apply,
}

impl Pass {
    fn verb(self) -> &'static str {
        match self {
            Self::Prescan => "Scanning",
            Self::Apply => "Converting",
        }
    }
}

pub(crate) fn convert(
    status: &StatusPrint,
    opts: &Options,
    dump_path: &std::path::Path,
    repo_path: &std::path::Path,
) -> Result<(), ConvertError> {
    let mut dump = DumpFile::open(dump_path).map_err(|e| {
        tracing::error!("{e}");
        ConvertError
    })?;

    let repository = git::Repository::init(repo_path, "").map_err(store_err)?;

    let mut load_errors = 0;

    let authors = match opts.authors_file {
        Some(ref path) => {
            let (authors, errors) = Authors::load(path).map_err(|e| {
                tracing::error!("{e}");
                ConvertError
            })?;
            load_errors += errors;
            authors
        }
        None => Authors::new(),
    };

    let mut specs = match opts.branches_file {
        Some(ref path) => {
            let (specs, errors) = crate::branches::load(path).map_err(|e| {
                tracing::error!("{e}");
                ConvertError
            })?;
            load_errors += errors;
            specs
        }
        None => Vec::new(),
    };

    // Without routing declarations everything lands on one branch.
    let has_branch_table = !specs.is_empty();
    if !has_branch_table {
        specs = vec![BranchSpec {
            prefix: Vec::new(),
            name: "master".into(),
            is_tag: false,
        }];
    }

    let mut converter = Converter {
        status,
        opts,
        authors,
        repository,
        modules: ModuleSet::new(),
        has_branch_table,
        rev_trees: BTreeMap::new(),
        copy_from: VecDeque::new(),
        last_rev: None,
        curr_meta: None,
        final_rev: 0,
    };

    for spec in specs.iter() {
        converter
            .repository
            .add_branch(&spec.prefix, &spec.name, spec.is_tag);
    }

    if let Some(ref path) = opts.modules_file {
        let (modules, errors) =
            ModuleSet::load(path, converter.repository.path(), &specs).map_err(|e| {
                tracing::error!("{e}");
                ConvertError
            })?;
        load_errors += errors;
        converter.modules = modules;
    }

    if !opts.skip_prescan {
        let errors = load_errors + converter.run_pass(&mut dump, Pass::Prescan)?;

        converter
            .copy_from
            .make_contiguous()
            .sort_by_key(|&(_, source)| source);
        for &(dependent, source) in converter.copy_from.iter() {
            tracing::debug!("copy-from reservation: r{dependent} <- r{source}");
        }

        if errors > 0 {
            status.finish_verb(Pass::Prescan.verb());
            tracing::error!("please correct the {errors} error(s) listed above and run again");
            return Err(ConvertError);
        }
        tracing::warn!("note: --skip can be used to skip this pre-scan");
        status.finish_verb(Pass::Prescan.verb());

        dump.rewind().map_err(|e| {
            tracing::error!("{e}");
            ConvertError
        })?;
    }

    converter.run_pass(&mut dump, Pass::Apply)?;
    converter.finish()?;
    status.finish_verb(Pass::Apply.verb());

    Ok(())
}

fn store_err(e: git::StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError
}

struct Converter<'a> {
    status: &'a StatusPrint,
    opts: &'a Options,
    authors: Authors,
    repository: git::Repository,
    modules: ModuleSet,
    has_branch_table: bool,
    /// Historical tree cache: sparse snapshots still referenced by
    /// pending copy-from reservations.
    rev_trees: BTreeMap<u32, ObjIdx>,
    /// Reservations `(dependent_rev, source_rev)`, sorted by source
    /// after the prescan.
    copy_from: VecDeque<(u32, u32)>,
    last_rev: Option<u32>,
    curr_meta: Option<CommitMeta>,
    final_rev: u32,
}

impl Converter<'_> {
    fn run_pass(&mut self, dump: &mut DumpFile, pass: Pass) -> Result<usize, ConvertError> {
        let verify = pass == Pass::Prescan;
        let mut errors = 0;

        if self.opts.pipeline {
            let (start, cutoff) = (self.opts.start, self.opts.cutoff);
            std::thread::scope(|scope| -> Result<(), ConvertError> {
                let (tx, rx) = node_queue::create(QUEUE_CAPACITY);
                scope.spawn(move || produce(dump, &tx, verify, start, cutoff));

                while let Some(message) = rx.pop() {
                    match message {
                        node_queue::Message::Rev(info) => {
                            self.handle_rev(&info, pass, &mut errors)?;
                        }
                        node_queue::Message::Node(node) => {
                            self.handle_node(&node, pass, &mut errors)?;
                        }
                        node_queue::Message::Error(e) => {
                            tracing::error!("{e}");
                            return Err(ConvertError);
                        }
                    }
                }
                Ok(())
            })?;
        } else {
            let mut seen_rev = None;
            loop {
                match dump.read_next(false, verify) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        tracing::error!("{e}");
                        return Err(ConvertError);
                    }
                }

                let rev = dump.rev_nr().unwrap_or(0);
                if self.opts.cutoff.is_some_and(|cutoff| rev > cutoff) {
                    break;
                }
                if seen_rev != Some(rev) {
                    seen_rev = Some(rev);
                    let info = dump.rev_info();
                    self.handle_rev(&info, pass, &mut errors)?;
                }
                if self.opts.start.map_or(true, |start| rev >= start) {
                    self.handle_node(dump.curr_node(), pass, &mut errors)?;
                }
            }
        }

        Ok(errors)
    }

    fn handle_rev(
        &mut self,
        info: &RevInfo,
        pass: Pass,
        errors: &mut usize,
    ) -> Result<(), ConvertError> {
        let mut final_rev = info.last_merged_rev.unwrap_or(0);
        if let Some(cutoff) = self.opts.cutoff {
            if final_rev == 0 || cutoff < final_rev {
                final_rev = cutoff;
            }
        }
        self.final_rev = final_rev;

        self.status.update(pass.verb(), info.rev, self.final_rev);

        match pass {
            Pass::Prescan => {
                let in_range = self.opts.start.map_or(true, |start| info.rev >= start);
                if in_range && !self.authors.is_empty() && self.authors.get(&info.author).is_none()
                {
                    tracing::warn!(
                        "r{}: unrecognized author id: \"{}\"",
                        info.rev,
                        info.author.escape_ascii(),
                    );
                    *errors += 1;
                }
            }
            Pass::Apply => {
                self.flush_revision()?;
                self.curr_meta = Some(self.make_commit_meta(info));
                self.last_rev = Some(info.rev);
            }
        }
        Ok(())
    }

    fn handle_node(
        &mut self,
        node: &Node,
        pass: Pass,
        errors: &mut usize,
    ) -> Result<(), ConvertError> {
        match pass {
            Pass::Prescan => {
                *errors += self.prescan_node(node);
                Ok(())
            }
            Pass::Apply => {
                if self.opts.skip_prescan {
                    // Keep pruning functional even without the prescan's
                    // reservation list.
                    self.note_copy_from(node);
                }
                self.apply_node(node)
            }
        }
    }

    fn note_copy_from(&mut self, node: &Node) {
        if let Some(from_rev) = node.copy_from_rev {
            let entry = (node.rev, from_rev);
            if self.copy_from.back() != Some(&entry) {
                self.copy_from.push_back(entry);
            }
        }
    }

    fn prescan_node(&mut self, node: &Node) -> usize {
        let mut errors = 0;

        if let Some(from_rev) = node.copy_from_rev {
            tracing::debug!("r{}: copy from r{from_rev}", node.rev);
        }
        self.note_copy_from(node);

        if self.has_branch_table {
            // Directory-only additions never reach a branch; everything
            // touching files, deletions, and directory copies must
            // route somewhere.
            let routed = node.action == Some(NodeAction::Delete)
                || node.kind == Some(NodeKind::File)
                || node.has_copy_from();
            if routed {
                if self.repository.find_branch_by_path(&node.path).is_none() {
                    tracing::warn!(
                        "r{}: could not find branch for \"{}\"",
                        node.rev,
                        node.path.escape_ascii(),
                    );
                    errors += 1;
                }
                if let Some(ref from_path) = node.copy_from_path {
                    if self.repository.find_branch_by_path(from_path).is_none() {
                        tracing::warn!(
                            "r{}: could not find branch for \"{}\"",
                            node.rev,
                            from_path.escape_ascii(),
                        );
                        errors += 1;
                    }
                }
            }
        }

        errors
    }

    /// Closes the previous revision: flushes pending commits in every
    /// store, snapshots the historical tree while reservations may
    /// still need it, runs the periodic GC, and prunes spent
    /// reservations and cache entries.
    fn flush_revision(&mut self) -> Result<(), ConvertError> {
        let Some(last_rev) = self.last_rev else {
            return Ok(());
        };
        let meta = self
            .curr_meta
            .clone()
            .expect("revision metadata accompanies last_rev");

        let gc_due = self
            .opts
            .gc_every
            .is_some_and(|every| every > 0 && last_rev % every == 0);

        let wrote = self.repository.write(last_rev, &meta).map_err(store_err)?;
        if wrote {
            // Without a prescan the reservation list is discovered as
            // the stream goes, so every state must be kept available.
            let may_be_needed = !self.copy_from.is_empty() || self.opts.skip_prescan;
            if may_be_needed {
                if let Some(tree) = self.repository.history_tree() {
                    self.rev_trees.insert(last_rev, tree);
                }
            }
            if gc_due {
                self.repository.write_branches().map_err(store_err)?;
                self.repository.garbage_collect().map_err(store_err)?;
            }
        }

        for module in self.modules.modules.iter_mut() {
            let wrote = module.repository.write(last_rev, &meta).map_err(store_err)?;
            if wrote && gc_due {
                module.repository.write_branches().map_err(store_err)?;
                module.repository.garbage_collect().map_err(store_err)?;
            }
        }

        self.free_past_trees(last_rev);
        Ok(())
    }

    /// Pops reservations the stream has moved past, then discards every
    /// cached snapshot below the greatest key still reachable from the
    /// largest popped source revision.
    fn free_past_trees(&mut self, last_rev: u32) {
        let mut popped = None;
        while let Some(&(dependent, source)) = self.copy_from.front() {
            if last_rev > dependent && last_rev > source {
                tracing::debug!("r{dependent} no longer needs r{source}");
                popped = Some(source);
                self.copy_from.pop_front();
            } else {
                break;
            }
        }

        let Some(popped) = popped else {
            return;
        };
        tracing::debug!("{} tree reservations remain", self.copy_from.len());

        if let Some((&keep, _)) = self.rev_trees.range(..=popped).next_back() {
            let stale = self
                .rev_trees
                .range(..keep)
                .map(|(&rev, _)| rev)
                .collect::<Vec<_>>();
            if let (Some(&first), Some(&last)) = (stale.first(), stale.last()) {
                tracing::debug!("dropping tree snapshots r{first}..r{last}");
            }
            for rev in stale {
                self.rev_trees.remove(&rev);
            }
        }
    }

    fn make_commit_meta(&self, info: &RevInfo) -> CommitMeta {
        let (name, email) = match self.authors.get(&info.author) {
            Some((name, email)) => (name.to_string(), email.to_string()),
            None => {
                if !self.authors.is_empty() && !info.author.is_empty() {
                    tracing::warn!(
                        "r{}: unrecognized author id: \"{}\"",
                        info.rev,
                        info.author.escape_ascii(),
                    );
                }
                (
                    String::from_utf8_lossy(&info.author).into_owned(),
                    String::new(),
                )
            }
        };

        let mut message = String::new();
        if let Some(ref log) = info.log {
            let trimmed = trim_log(log);
            if !trimmed.is_empty() {
                message.push_str(&String::from_utf8_lossy(trimmed));
                message.push_str("\n\n");
            }
        }
        message.push_str(&format!("SVN-Revision: {}", info.rev));

        CommitMeta {
            author: gix_actor::Signature {
                name: name.into(),
                email: email.into(),
                time: gix_date::Time {
                    seconds: info.date,
                    offset: 0,
                    sign: gix_date::time::Sign::Plus,
                },
            },
            message,
        }
    }

    fn apply_node(&mut self, node: &Node) -> Result<(), ConvertError> {
        if node.path.is_empty() {
            return Ok(());
        }

        let applied = apply_change(
            &mut self.repository,
            None,
            &self.rev_trees,
            node,
            &node.path,
            None,
        )?;
        let Some(applied) = applied else {
            return Ok(());
        };

        if !self.modules.is_empty() {
            if let Some((module, dest)) = self.modules.find(&applied.subpath) {
                tracing::info!(
                    "r{}: \"{}\" matched submodule {} -> \"{}\"",
                    node.rev,
                    applied.subpath.escape_ascii(),
                    self.modules.modules[module].name,
                    dest.escape_ascii(),
                );

                let parent = &self.repository;
                let sub = &mut self.modules.modules[module].repository;
                apply_change(
                    sub,
                    Some(&parent.arena),
                    &self.rev_trees,
                    node,
                    &dest,
                    Some(&applied.branch_name),
                )?;
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<(), ConvertError> {
        self.flush_revision()?;

        self.repository.write_branches().map_err(store_err)?;
        for module in self.modules.modules.iter_mut() {
            module.repository.write_branches().map_err(store_err)?;
        }

        if self.opts.gc_every.is_some() {
            self.repository.garbage_collect().map_err(store_err)?;
            for module in self.modules.modules.iter() {
                module.repository.garbage_collect().map_err(store_err)?;
            }
        }

        if self.last_rev.is_some() {
            tracing::info!("wrote tag flat-history");
        }
        Ok(())
    }
}

fn produce(
    dump: &mut DumpFile,
    tx: &node_queue::Sender,
    verify: bool,
    start: Option<u32>,
    cutoff: Option<u32>,
) {
    let mut seen_rev = None;
    loop {
        match dump.read_next(false, verify) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tx.push(node_queue::Message::Error(e));
                break;
            }
        }

        let rev = dump.rev_nr().unwrap_or(0);
        if cutoff.is_some_and(|cutoff| rev > cutoff) {
            break;
        }
        if seen_rev != Some(rev) {
            seen_rev = Some(rev);
            if !tx.push(node_queue::Message::Rev(dump.rev_info())) {
                break;
            }
        }
        if start.map_or(true, |start| rev >= start) {
            if !tx.push(node_queue::Message::Node(dump.curr_node().clone())) {
                break;
            }
        }
    }
}

struct Applied {
    branch_name: String,
    subpath: Vec<u8>,
}

/// Routes one node into `repo`. `parent_arena` is set when `repo` is a
/// submodule store and copy-from sources must be resolved against the
/// parent's snapshots. Returns `None` when the node had no effect.
fn apply_change(
    repo: &mut git::Repository,
    parent_arena: Option<&git::ObjectArena>,
    rev_trees: &BTreeMap<u32, ObjIdx>,
    node: &Node,
    path: &[u8],
    related_branch: Option<&str>,
) -> Result<Option<Applied>, ConvertError> {
    let file_add = node.kind == Some(NodeKind::File)
        && matches!(
            node.action,
            Some(NodeAction::Add | NodeAction::Change | NodeAction::Replace)
        );
    let dir_copy = node.kind == Some(NodeKind::Dir)
        && matches!(node.action, Some(NodeAction::Add | NodeAction::Replace))
        && node.has_copy_from();

    let applied = if file_add {
        add_file(repo, parent_arena, rev_trees, node, path, related_branch)?
    } else if node.action == Some(NodeAction::Delete) {
        Some(update_object(repo, path, None, None, related_branch, node)?)
    } else if dir_copy {
        add_directory(repo, parent_arena, rev_trees, node, path, related_branch)?
    } else {
        None
    };

    if applied.is_none() {
        tracing::debug!(
            "r{}: change ignored: {:?} {:?} \"{}\"",
            node.rev,
            node.action,
            node.kind,
            path.escape_ascii(),
        );
    }

    Ok(applied)
}

fn add_file(
    repo: &mut git::Repository,
    parent_arena: Option<&git::ObjectArena>,
    rev_trees: &BTreeMap<u32, ObjIdx>,
    node: &Node,
    path: &[u8],
    related_branch: Option<&str>,
) -> Result<Option<Applied>, ConvertError> {
    let name = paths::basename(path);

    if let Some(from_rev) = node.copy_from_rev {
        let from_path = node.copy_from_path.as_deref().unwrap_or_default();
        let past_tree = get_past_tree(rev_trees, node, from_rev)?;

        let src = match parent_arena {
            Some(arena) => arena.tree_lookup(past_tree, from_path),
            None => repo.arena.tree_lookup(past_tree, from_path),
        };
        let Some(src) = src else {
            warn_missing_copy_source(repo, parent_arena, past_tree, node, from_path, from_rev);
            return Ok(None);
        };

        let src_is_blob = match parent_arena {
            Some(arena) => arena.is_blob(src),
            None => repo.arena.is_blob(src),
        };
        if !src_is_blob {
            tracing::warn!(
                "r{}: copy source \"{}\" is not a file",
                node.rev,
                from_path.escape_ascii(),
            );
            return Ok(None);
        }

        let obj = match parent_arena {
            Some(arena) => repo.arena.import_from(arena, src, name),
            None => repo.arena.copy_to_name(src, name),
        };
        let from_branch = find_branch(repo, from_path, related_branch);
        return Ok(Some(update_object(
            repo,
            path,
            Some(obj),
            from_branch,
            related_branch,
            node,
        )?));
    }

    // A plain change without a text body only touched properties.
    if node.action == Some(NodeAction::Change) && !node.has_text() {
        return Ok(None);
    }

    let obj = repo.create_blob(name, node.text()).map_err(store_err)?;
    Ok(Some(update_object(
        repo,
        path,
        Some(obj),
        None,
        related_branch,
        node,
    )?))
}

fn add_directory(
    repo: &mut git::Repository,
    parent_arena: Option<&git::ObjectArena>,
    rev_trees: &BTreeMap<u32, ObjIdx>,
    node: &Node,
    path: &[u8],
    related_branch: Option<&str>,
) -> Result<Option<Applied>, ConvertError> {
    let name = paths::basename(path);
    let from_rev = node.copy_from_rev.expect("directory copies carry copy-from");
    let from_path = node.copy_from_path.as_deref().unwrap_or_default();

    let past_tree = get_past_tree(rev_trees, node, from_rev)?;

    let src = match parent_arena {
        Some(arena) => arena.tree_lookup(past_tree, from_path),
        None => repo.arena.tree_lookup(past_tree, from_path),
    };
    // The copied directory may never have held a file.
    let Some(src) = src else {
        return Ok(None);
    };

    let src_is_tree = match parent_arena {
        Some(arena) => arena.is_tree(src),
        None => repo.arena.is_tree(src),
    };
    if !src_is_tree {
        tracing::warn!(
            "r{}: copy source \"{}\" is not a directory",
            node.rev,
            from_path.escape_ascii(),
        );
        return Ok(None);
    }

    let obj = match parent_arena {
        Some(arena) => repo.arena.import_from(arena, src, name),
        None => repo.arena.copy_to_name(src, name),
    };
    let from_branch = find_branch(repo, from_path, related_branch);
    Ok(Some(update_object(
        repo,
        path,
        Some(obj),
        from_branch,
        related_branch,
        node,
    )?))
}

/// Applies one object change (or removal) to the flat-history branch
/// at the full path and to the routed branch at the prefix-relative
/// subpath, returning the routing for submodule fan-out.
fn update_object(
    repo: &mut git::Repository,
    path: &[u8],
    obj: Option<ObjIdx>,
    from_branch: Option<BranchId>,
    related_branch: Option<&str>,
    node: &Node,
) -> Result<Applied, ConvertError> {
    let history_commit = repo.history_commit();
    match obj {
        Some(obj) => repo.arena.commit_update(history_commit, path, obj),
        None => repo.arena.commit_remove(history_commit, path),
    }

    let Some(branch) = find_branch(repo, path, related_branch) else {
        tracing::error!(
            "r{}: could not find branch for \"{}\"",
            node.rev,
            path.escape_ascii(),
        );
        return Err(ConvertError);
    };

    let commit = repo.get_commit(branch, from_branch);

    let subpath = if related_branch.is_some() {
        path.to_vec()
    } else {
        paths::strip_dir_prefix(path, &repo.branch(branch).prefix).to_vec()
    };

    match obj {
        Some(obj) => repo.arena.commit_update(commit, &subpath, obj),
        None => repo.arena.commit_remove(commit, &subpath),
    }

    let branch_name = repo.branch(branch).name.clone();
    tracing::info!(
        "r{}: {} \"{}\" <{branch_name}>{}",
        node.rev,
        describe_change(node),
        path.escape_ascii(),
        if repo.repo_name.is_empty() {
            String::new()
        } else {
            format!(" {{{}}}", repo.repo_name)
        },
    );

    Ok(Applied {
        branch_name,
        subpath,
    })
}

fn find_branch(
    repo: &git::Repository,
    path: &[u8],
    related_branch: Option<&str>,
) -> Option<BranchId> {
    match related_branch {
        Some(name) => repo.find_branch_by_name(name),
        None => repo.find_branch_by_path(path),
    }
}

/// The snapshot with the greatest key at or below `from_rev`, falling
/// back to the newest snapshot. Running dry is fatal: the stream
/// depends on history this process no longer has.
fn get_past_tree(
    rev_trees: &BTreeMap<u32, ObjIdx>,
    node: &Node,
    from_rev: u32,
) -> Result<ObjIdx, ConvertError> {
    if let Some((_, &tree)) = rev_trees.range(..=from_rev).next_back() {
        return Ok(tree);
    }
    if let Some((_, &tree)) = rev_trees.iter().next_back() {
        return Ok(tree);
    }
    tracing::error!("r{}: no tree snapshot covers r{from_rev}", node.rev);
    Err(ConvertError)
}

fn warn_missing_copy_source(
    repo: &git::Repository,
    parent_arena: Option<&git::ObjectArena>,
    past_tree: ObjIdx,
    node: &Node,
    from_path: &[u8],
    from_rev: u32,
) {
    let mut listing = String::new();
    match parent_arena {
        Some(arena) => arena.dump_tree(past_tree, &mut listing, 1),
        None => repo.arena.dump_tree(past_tree, &mut listing, 1),
    }
    tracing::warn!(
        "r{}: could not find \"{}\" in tree r{from_rev}:\n{listing}",
        node.rev,
        from_path.escape_ascii(),
    );
}

fn describe_change(node: &Node) -> &'static str {
    match (node.kind, node.action) {
        (Some(NodeKind::File), Some(NodeAction::Add)) => "FA:",
        (Some(NodeKind::File), Some(NodeAction::Change)) => "FC:",
        (Some(NodeKind::File), Some(NodeAction::Replace)) => "FR:",
        (_, Some(NodeAction::Delete)) => "D:",
        (Some(NodeKind::Dir), _) => "DA:",
        _ => "?:",
    }
}

fn trim_log(log: &[u8]) -> &[u8] {
    let mut rem = log;
    while let Some((&b, rest)) = rem.split_first() {
        if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
            rem = rest;
        } else {
            break;
        }
    }
    while let Some((&b, rest)) = rem.split_last() {
        if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
            rem = rest;
        } else {
            break;
        }
    }
    rem
}
