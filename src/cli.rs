use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(
    name = "subconvert",
    about = "Translate a Subversion dump stream into git repositories"
)]
pub(crate) struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        help = "Report each change as it is applied"
    )]
    pub(crate) verbose: bool,
    #[arg(
        short = 'q',
        long = "quiet",
        global = true,
        help = "Only report errors, without progress"
    )]
    pub(crate) quiet: bool,
    #[arg(short = 'd', long = "debug", global = true, help = "Trace internal state")]
    pub(crate) debug: bool,
    #[arg(
        long = "verify",
        global = true,
        help = "Verify MD5/SHA-1 checksums while scanning"
    )]
    pub(crate) verify: bool,
    #[arg(long = "skip", global = true, help = "Skip the pre-scan validation pass")]
    pub(crate) skip: bool,
    #[arg(
        long = "pipeline",
        global = true,
        help = "Overlap parsing and applying on two threads"
    )]
    pub(crate) pipeline: bool,
    #[arg(
        long = "start",
        value_name = "REV",
        global = true,
        help = "Do not apply nodes below this revision"
    )]
    pub(crate) start: Option<u32>,
    #[arg(
        long = "cutoff",
        value_name = "REV",
        global = true,
        help = "Stop after this revision (inclusive)"
    )]
    pub(crate) cutoff: Option<u32>,
    #[arg(
        long = "gc",
        value_name = "N",
        global = true,
        help = "Garbage-collect the stores every N revisions"
    )]
    pub(crate) gc: Option<u32>,
    #[arg(
        short = 'A',
        long = "authors",
        value_name = "FILE",
        global = true,
        help = "Author identity table"
    )]
    pub(crate) authors: Option<PathBuf>,
    #[arg(
        short = 'B',
        long = "branches",
        value_name = "FILE",
        global = true,
        help = "Branch routing table"
    )]
    pub(crate) branches: Option<PathBuf>,
    #[arg(
        short = 'M',
        long = "modules",
        value_name = "FILE",
        global = true,
        help = "Submodule mapping table"
    )]
    pub(crate) modules: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(clap::Subcommand)]
pub(crate) enum Command {
    #[command(about = "Print a human-readable trace of every node")]
    Print {
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
    },
    #[command(about = "Count revisions per author id")]
    Authors {
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
    },
    #[command(about = "Infer branch and tag roots from the stream")]
    Branches {
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
    },
    #[command(about = "Verify that the dump parses")]
    Scan {
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
    },
    #[command(about = "Run the conversion")]
    Convert {
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
        #[arg(value_name = "REPO", default_value = ".")]
        repo: PathBuf,
    },
}
