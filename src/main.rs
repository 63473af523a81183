#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]

use std::io::{IsTerminal as _, Write as _};
use std::process::ExitCode;

mod authors;
mod branches;
mod cli;
mod convert;
mod git;
mod modules;
mod node_queue;
mod paths;
mod svn;
mod term_out;

use svn::dump::{DumpFile, NodeAction, NodeKind};
use term_out::StatusPrint;

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::from(1),
    }
}

fn main_inner() -> Result<(), ()> {
    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return Err(());
        }
    };

    let enable_progress = !args.quiet && std::io::stderr().is_terminal();
    let term_out = term_out::init(enable_progress);
    let status = term_out.status_print();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else if args.verbose {
        tracing::Level::INFO
    } else if args.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };
    init_logger(level, status.clone());

    let result = run(&args, &status);

    term_out.finish();
    result
}

fn run(args: &cli::Cli, status: &StatusPrint) -> Result<(), ()> {
    match args.command {
        cli::Command::Print { ref dump } => cmd_print(dump),
        cli::Command::Authors { ref dump } => cmd_authors(dump, status),
        cli::Command::Branches { ref dump } => cmd_branches(dump, status),
        cli::Command::Scan { ref dump } => cmd_scan(dump, args.verify, status),
        cli::Command::Convert { ref dump, ref repo } => {
            let opts = convert::Options {
                authors_file: args.authors.clone(),
                branches_file: args.branches.clone(),
                modules_file: args.modules.clone(),
                skip_prescan: args.skip,
                start: args.start,
                cutoff: args.cutoff,
                gc_every: args.gc,
                pipeline: args.pipeline,
            };
            convert::convert(status, &opts, dump, repo).map_err(|convert::ConvertError| ())
        }
    }
}

fn open_dump(path: &std::path::Path) -> Result<DumpFile, ()> {
    DumpFile::open(path).map_err(|e| {
        tracing::error!("{e}");
    })
}

fn cmd_print(dump_path: &std::path::Path) -> Result<(), ()> {
    let mut dump = open_dump(dump_path)?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    loop {
        match dump.read_next(true, false) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!("{e}");
                return Err(());
            }
        }

        let node = dump.curr_node();
        let header = format!("r{}:{}", node.rev, node.txn + 1);
        let action = match node.action {
            Some(NodeAction::Add) => "add",
            Some(NodeAction::Delete) => "delete",
            Some(NodeAction::Change) => "change",
            Some(NodeAction::Replace) => "replace",
            None => "",
        };
        let kind = match node.kind {
            Some(NodeKind::File) => "file",
            Some(NodeKind::Dir) => "dir",
            None => "",
        };

        let mut line = format!("{header:>9} {action:<8}{kind:<5}{}", node.path.escape_ascii());
        if let (Some(from_rev), Some(ref from_path)) = (node.copy_from_rev, &node.copy_from_path) {
            line.push_str(&format!(
                " (copied from {} [r{from_rev}])",
                from_path.escape_ascii(),
            ));
        }

        if writeln!(out, "{line}").is_err() {
            return Err(());
        }
    }

    out.flush().map_err(|_| ())
}

fn cmd_authors(dump_path: &std::path::Path, status: &StatusPrint) -> Result<(), ()> {
    let mut dump = open_dump(dump_path)?;
    let mut scanner = authors::AuthorsScanner::new();

    loop {
        match dump.read_next(true, false) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!("{e}");
                return Err(());
            }
        }

        let rev = dump.rev_nr().unwrap_or(0);
        status.update("Scanning", rev, dump.last_merged_rev_nr().unwrap_or(0));
        scanner.process(rev, dump.rev_author());
    }

    status.finish_verb("Scanning");
    scanner.finish(&mut std::io::stdout().lock()).map_err(|_| ())
}

fn cmd_branches(dump_path: &std::path::Path, status: &StatusPrint) -> Result<(), ()> {
    let mut dump = open_dump(dump_path)?;
    let mut scanner = branches::BranchesScanner::new();

    loop {
        match dump.read_next(true, false) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!("{e}");
                return Err(());
            }
        }

        let rev = dump.rev_nr().unwrap_or(0);
        status.update("Scanning", rev, dump.last_merged_rev_nr().unwrap_or(0));
        scanner.process(rev, dump.rev_date(), dump.curr_node());
    }

    status.finish_verb("Scanning");
    scanner.finish(&mut std::io::stdout().lock()).map_err(|_| ())
}

fn cmd_scan(dump_path: &std::path::Path, verify: bool, status: &StatusPrint) -> Result<(), ()> {
    let mut dump = open_dump(dump_path)?;

    loop {
        // Without --verify the text bodies are skipped outright.
        match dump.read_next(!verify, verify) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::error!("{e}");
                return Err(());
            }
        }

        status.update(
            "Scanning",
            dump.rev_nr().unwrap_or(0),
            dump.last_merged_rev_nr().unwrap_or(0),
        );
    }

    status.finish_verb("Scanning");
    Ok(())
}

fn init_logger(level: tracing::Level, status: StatusPrint) {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = tracing_subscriber::filter::LevelFilter::from_level(level);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_writer(MakeLogPrinter { status })
        .with_filter(filter);

    tracing_subscriber::registry().with(layer).init();
}

// Routes formatted log lines through the status thread, so they print
// above the in-place progress line.

struct MakeLogPrinter {
    status: StatusPrint,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeLogPrinter {
    type Writer = LogPrinter<'a>;

    fn make_writer(&'a self) -> LogPrinter<'a> {
        LogPrinter {
            status: &self.status,
            buf: Vec::new(),
        }
    }
}

struct LogPrinter<'a> {
    status: &'a StatusPrint,
    buf: Vec<u8>,
}

impl Drop for LogPrinter<'_> {
    fn drop(&mut self) {
        self.status.print_raw_line(self.buf.clone());
    }
}

impl std::io::Write for LogPrinter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend(buf);
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.buf.extend(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
