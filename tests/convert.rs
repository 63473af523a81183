//! End-to-end scenarios: dump streams are synthesized in memory, the
//! binary converts them into a temporary store, and the results are
//! read back from the loose objects and references it wrote.

use std::io::Read as _;
use std::path::{Path, PathBuf};

const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

fn bin() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_subconvert"))
}

struct DumpBuilder {
    data: Vec<u8>,
}

impl DumpBuilder {
    fn new() -> Self {
        Self {
            data: b"SVN-fs-dump-format-version: 2\n\n".to_vec(),
        }
    }

    fn rev(mut self, rev: u32, author: &str, date: &str, log: &str) -> Self {
        let mut props = Vec::new();
        for (key, value) in [("svn:author", author), ("svn:date", date), ("svn:log", log)] {
            props.extend_from_slice(
                format!("K {}\n{key}\nV {}\n{value}\n", key.len(), value.len()).as_bytes(),
            );
        }
        props.extend_from_slice(b"PROPS-END\n");

        self.data.extend_from_slice(
            format!(
                "Revision-number: {rev}\nProp-content-length: {len}\nContent-length: {len}\n\n",
                len = props.len(),
            )
            .as_bytes(),
        );
        self.data.extend_from_slice(&props);
        self.data.push(b'\n');
        self
    }

    fn file(mut self, action: &str, path: &str, text: &str) -> Self {
        self.data.extend_from_slice(
            format!(
                "Node-path: {path}\nNode-kind: file\nNode-action: {action}\n\
                 Text-content-md5: {md5:x}\n\
                 Text-content-length: {len}\nContent-length: {len}\n\n",
                md5 = md5::compute(text.as_bytes()),
                len = text.len(),
            )
            .as_bytes(),
        );
        self.data.extend_from_slice(text.as_bytes());
        self.data.extend_from_slice(b"\n\n");
        self
    }

    fn add_file(self, path: &str, text: &str) -> Self {
        self.file("add", path, text)
    }

    fn change_file(self, path: &str, text: &str) -> Self {
        self.file("change", path, text)
    }

    fn delete(mut self, path: &str) -> Self {
        self.data
            .extend_from_slice(format!("Node-path: {path}\nNode-action: delete\n\n").as_bytes());
        self
    }

    fn copy_dir(mut self, path: &str, from_path: &str, from_rev: u32) -> Self {
        self.data.extend_from_slice(
            format!(
                "Node-path: {path}\nNode-kind: dir\nNode-action: add\n\
                 Node-copyfrom-rev: {from_rev}\nNode-copyfrom-path: {from_path}\n\n",
            )
            .as_bytes(),
        );
        self
    }

    fn write_to(self, path: &Path) {
        std::fs::write(path, self.data).unwrap();
    }
}

fn single_file_dump() -> DumpBuilder {
    DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19.125169Z", "first")
        .add_file("trunk/a.txt", "x")
        .rev(2, "alice", "2011-04-06T18:00:00.000000Z", "second")
        .change_file("trunk/a.txt", "y")
        .rev(3, "alice", "2011-04-06T19:00:00.000000Z", "third")
        .delete("trunk/a.txt")
}

fn convert(dump: &DumpBuilder, dir: &Path, repo: &str, extra: &[&str]) -> std::process::Output {
    let dump_path = dir.join("dump");
    std::fs::write(&dump_path, &dump.data).unwrap();

    std::process::Command::new(bin())
        .args(extra)
        .arg("convert")
        .arg(&dump_path)
        .arg(dir.join(repo))
        .output()
        .unwrap()
}

fn read_ref(repo: &Path, name: &str) -> Option<String> {
    let raw = std::fs::read_to_string(repo.join(name)).ok()?;
    Some(raw.trim().to_string())
}

fn read_object(repo: &Path, hex: &str) -> (String, Vec<u8>) {
    let path = repo.join("objects").join(&hex[..2]).join(&hex[2..]);
    let compressed = std::fs::read(&path)
        .unwrap_or_else(|e| panic!("missing object {hex}: {e}"));

    let mut raw = Vec::new();
    flate2::read::ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut raw)
        .unwrap();

    let nul = raw.iter().position(|&b| b == 0).unwrap();
    let header = String::from_utf8(raw[..nul].to_vec()).unwrap();
    let kind = header.split(' ').next().unwrap().to_string();
    (kind, raw[(nul + 1)..].to_vec())
}

fn commit_field(payload: &[u8], field: &str) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix(&format!("{field} ")) {
            return Some(value.to_string());
        }
    }
    None
}

fn commit_message(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    match text.split_once("\n\n") {
        Some((_, message)) => message.to_string(),
        None => String::new(),
    }
}

/// Parses one entry out of a binary tree payload:
/// `<mode> <name>\0<20-byte id>` repeating.
fn tree_entry(payload: &[u8], name: &str) -> Option<(String, String)> {
    let mut rem = payload;
    while !rem.is_empty() {
        let space = rem.iter().position(|&b| b == b' ')?;
        let mode = String::from_utf8(rem[..space].to_vec()).unwrap();
        rem = &rem[(space + 1)..];

        let nul = rem.iter().position(|&b| b == 0)?;
        let entry_name = String::from_utf8(rem[..nul].to_vec()).unwrap();
        rem = &rem[(nul + 1)..];

        let oid = rem[..20].iter().map(|b| format!("{b:02x}")).collect();
        rem = &rem[20..];

        if entry_name == name {
            return Some((mode, oid));
        }
    }
    None
}

/// Walks `path` down from a tree object, returning the entry's id.
fn lookup(repo: &Path, tree_hex: &str, path: &str) -> Option<String> {
    let mut current = tree_hex.to_string();
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        let (kind, payload) = read_object(repo, &current);
        assert_eq!(kind, "tree");
        let (_, oid) = tree_entry(&payload, segment)?;
        if segments.peek().is_none() {
            return Some(oid);
        }
        current = oid;
    }
    None
}

fn commit_chain(repo: &Path, mut hex: String) -> Vec<Vec<u8>> {
    let mut chain = Vec::new();
    loop {
        let (kind, payload) = read_object(repo, &hex);
        assert_eq!(kind, "commit");
        let parent = commit_field(&payload, "parent");
        chain.push(payload);
        match parent {
            Some(p) => hex = p,
            None => return chain,
        }
    }
}

#[test]
fn single_file_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert(&single_file_dump(), dir.path(), "repo.git", &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("repo.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();

    let chain = commit_chain(&repo, master);
    assert_eq!(chain.len(), 3);
    assert!(commit_message(&chain[0]).ends_with("SVN-Revision: 3"));
    assert!(commit_message(&chain[1]).ends_with("SVN-Revision: 2"));
    assert!(commit_message(&chain[2]).ends_with("SVN-Revision: 1"));
    assert!(commit_message(&chain[2]).starts_with("first\n\n"));

    // After the delete, the tip tree is empty.
    assert_eq!(commit_field(&chain[0], "tree").unwrap(), EMPTY_TREE);

    // Unmapped authors keep their id and get an empty email.
    let author = commit_field(&chain[2], "author").unwrap();
    assert!(author.starts_with("alice <> "), "{author}");
    assert!(author.ends_with("1302112219 +0000"), "{author}");

    // The full unmapped history is finalized as a tag.
    assert!(read_ref(&repo, "refs/tags/flat-history").is_some());
}

#[test]
fn conversion_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let a = convert(&single_file_dump(), dir.path(), "a.git", &[]);
    assert!(a.status.success());

    let dir_b = tempfile::tempdir().unwrap();
    let b = convert(&single_file_dump(), dir_b.path(), "b.git", &[]);
    assert!(b.status.success());

    assert_eq!(
        read_ref(&dir.path().join("a.git"), "refs/heads/master"),
        read_ref(&dir_b.path().join("b.git"), "refs/heads/master"),
    );
}

#[test]
fn pipeline_matches_serial() {
    let dir = tempfile::tempdir().unwrap();
    let serial = convert(&single_file_dump(), dir.path(), "serial.git", &[]);
    assert!(serial.status.success());

    let piped = convert(&single_file_dump(), dir.path(), "piped.git", &["--pipeline"]);
    assert!(piped.status.success());

    assert_eq!(
        read_ref(&dir.path().join("serial.git"), "refs/heads/master"),
        read_ref(&dir.path().join("piped.git"), "refs/heads/master"),
    );
}

#[test]
fn branch_from_trunk_shares_blobs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("branches.txt"),
        "\t\t\t\ttrunk\tmaster\n\t\t\t\tbranches/topic\ttopic\n",
    )
    .unwrap();

    let dump = DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "first")
        .add_file("trunk/a.txt", "x")
        .rev(2, "alice", "2011-04-06T18:00:00Z", "branch it")
        .copy_dir("branches/topic", "trunk", 1);

    let branches_arg = dir.path().join("branches.txt");
    let out = convert(
        &dump,
        dir.path(),
        "repo.git",
        &["-B", branches_arg.to_str().unwrap()],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("repo.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();
    let topic = read_ref(&repo, "refs/heads/topic").unwrap();

    let (_, master_commit) = read_object(&repo, &master);
    assert!(commit_message(&master_commit).ends_with("SVN-Revision: 1"));
    let (_, topic_commit) = read_object(&repo, &topic);
    assert!(commit_message(&topic_commit).ends_with("SVN-Revision: 2"));

    // The branched tree holds the same blob as trunk's.
    let master_tree = commit_field(&master_commit, "tree").unwrap();
    let topic_tree = commit_field(&topic_commit, "tree").unwrap();
    let master_blob = lookup(&repo, &master_tree, "a.txt").unwrap();
    let topic_blob = lookup(&repo, &topic_tree, "a.txt").unwrap();
    assert_eq!(master_blob, topic_blob);

    // The copy-from edge is the new branch's parent.
    assert_eq!(commit_field(&topic_commit, "parent").unwrap(), master);
}

#[test]
fn deleted_tag_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("branches.txt"),
        "\t\t\t\ttrunk\tmaster\nt\t\t\t\ttags/v1\tv1\n",
    )
    .unwrap();

    let dump = DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "first")
        .add_file("trunk/a.txt", "x")
        .rev(2, "alice", "2011-04-06T18:00:00Z", "tag it")
        .copy_dir("tags/v1", "trunk", 1)
        .rev(3, "alice", "2011-04-06T19:00:00Z", "drop it")
        .delete("tags/v1");

    let branches_arg = dir.path().join("branches.txt");
    let out = convert(
        &dump,
        dir.path(),
        "repo.git",
        &["-B", branches_arg.to_str().unwrap()],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("repo.git");
    assert!(read_ref(&repo, "refs/tags/v1").is_none());

    let preserved = read_ref(&repo, "refs/tags/v1__deleted_r3").unwrap();
    let (_, commit) = read_object(&repo, &preserved);
    assert!(commit_message(&commit).ends_with("SVN-Revision: 2"));
}

#[test]
fn unknown_author_fails_prescan() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("authors.txt"), "alice\tAlice Doe\ta<>x~com\n").unwrap();
    let authors_arg = dir.path().join("authors.txt");

    let dump = DumpBuilder::new()
        .rev(1, "bob", "2011-04-06T17:50:19Z", "first")
        .add_file("trunk/a.txt", "x");

    let out = convert(
        &dump,
        dir.path(),
        "repo.git",
        &["-A", authors_arg.to_str().unwrap()],
    );
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("unrecognized author id"));

    // --skip converts anyway, with the raw id and an empty email.
    let out = convert(
        &dump,
        dir.path(),
        "skipped.git",
        &["-A", authors_arg.to_str().unwrap(), "--skip"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("skipped.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();
    let (_, commit) = read_object(&repo, &master);
    assert!(commit_field(&commit, "author").unwrap().starts_with("bob <> "));
}

#[test]
fn copy_from_resolves_old_snapshots() {
    // A copy that reaches far back into history must still find the
    // old blob, even with unrelated churn in between.
    let mut dump = DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "first")
        .add_file("trunk/a.txt", "original");
    for rev in 2..=20 {
        dump = dump
            .rev(rev, "alice", "2011-04-06T18:00:00Z", "churn")
            .change_file("trunk/churn.txt", &format!("state {rev}"));
    }
    dump = dump
        .rev(21, "alice", "2011-04-06T19:00:00Z", "resurrect")
        .copy_dir("trunk/old", "trunk", 1);

    let dir = tempfile::tempdir().unwrap();
    let out = convert(&dump, dir.path(), "repo.git", &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("repo.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();
    let (_, commit) = read_object(&repo, &master);
    let tree = commit_field(&commit, "tree").unwrap();

    // trunk/old holds the r1 state: a.txt only, same blob.
    let original = lookup(&repo, &tree, "trunk/a.txt").unwrap();
    assert_eq!(lookup(&repo, &tree, "trunk/old/a.txt").unwrap(), original);
    assert!(lookup(&repo, &tree, "trunk/old/churn.txt").is_none());
}

#[test]
fn submodule_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("modules.txt"), "[sub]\ntrunk/sub: .\n").unwrap();
    let modules_arg = dir.path().join("modules.txt");

    let dump = DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "first")
        .add_file("trunk/sub/x.c", "int x;\n")
        .add_file("trunk/other.txt", "o");

    let out = convert(
        &dump,
        dir.path(),
        "repo.git",
        &["-M", modules_arg.to_str().unwrap()],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    // The parent store keeps the full layout.
    let repo = dir.path().join("repo.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();
    let (_, commit) = read_object(&repo, &master);
    let tree = commit_field(&commit, "tree").unwrap();
    let parent_blob = lookup(&repo, &tree, "trunk/sub/x.c").unwrap();

    // The submodule store received x.c at its rewritten root.
    let sub = dir.path().join("sub");
    let sub_master = read_ref(&sub, "refs/heads/master").unwrap();
    let (_, sub_commit) = read_object(&sub, &sub_master);
    let sub_tree = commit_field(&sub_commit, "tree").unwrap();
    let sub_blob = lookup(&sub, &sub_tree, "x.c").unwrap();
    assert_eq!(sub_blob, parent_blob);
    assert!(lookup(&sub, &sub_tree, "other.txt").is_none());
}

#[test]
fn cutoff_bounds_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert(&single_file_dump(), dir.path(), "repo.git", &["--cutoff", "2"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let repo = dir.path().join("repo.git");
    let master = read_ref(&repo, "refs/heads/master").unwrap();
    let chain = commit_chain(&repo, master);
    assert_eq!(chain.len(), 2);
    assert!(commit_message(&chain[0]).ends_with("SVN-Revision: 2"));
}

#[test]
fn scan_verifies_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("dump");
    single_file_dump().write_to(&dump_path);

    let out = std::process::Command::new(bin())
        .args(["--verify", "scan"])
        .arg(&dump_path)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    // Corrupt one text byte; the declared MD5 no longer matches.
    let mut data = std::fs::read(&dump_path).unwrap();
    let pos = data
        .windows(3)
        .position(|w| w == b"\n\nx")
        .expect("first file body")
        + 2;
    data[pos] = b'z';
    let bad_path = dir.path().join("bad-dump");
    std::fs::write(&bad_path, data).unwrap();

    let out = std::process::Command::new(bin())
        .args(["--verify", "scan"])
        .arg(&bad_path)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("MD5 mismatch"));
}

#[test]
fn print_traces_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("dump");
    single_file_dump().write_to(&dump_path);

    let out = std::process::Command::new(bin())
        .arg("print")
        .arg(&dump_path)
        .output()
        .unwrap();
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines = stdout.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "     r1:1 add     file trunk/a.txt");
    assert_eq!(lines[1], "     r2:1 change  file trunk/a.txt");
    assert_eq!(lines[2], "     r3:1 delete       trunk/a.txt");
}

#[test]
fn authors_counts_revisions() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("dump");
    DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "one")
        .add_file("trunk/a.txt", "x")
        .rev(2, "bob", "2011-04-06T18:00:00Z", "two")
        .change_file("trunk/a.txt", "y")
        .rev(3, "alice", "2011-04-06T19:00:00Z", "three")
        .change_file("trunk/a.txt", "z")
        .write_to(&dump_path);

    let out = std::process::Command::new(bin())
        .arg("authors")
        .arg(&dump_path)
        .output()
        .unwrap();
    assert!(out.status.success());
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        "alice\t\t\t2\nbob\t\t\t1\n",
    );
}

#[test]
fn branches_infers_roots() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("dump");
    DumpBuilder::new()
        .rev(1, "alice", "2011-04-06T17:50:19Z", "one")
        .add_file("trunk/a.txt", "x")
        .rev(2, "alice", "2011-04-07T18:00:00Z", "tag")
        .copy_dir("tags/v1", "trunk", 1)
        .write_to(&dump_path);

    let out = std::process::Command::new(bin())
        .arg("branches")
        .arg(&dump_path)
        .output()
        .unwrap();
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("tag\t2\t2011-04-07\t1\ttags/v1\ttags/v1\n"));
    assert!(stdout.contains("tag\t1\t2011-04-06\t1\ttrunk\ttrunk\n"));
}
