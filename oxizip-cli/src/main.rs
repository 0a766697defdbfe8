//! OxiZip CLI - ZIP archives from the command line
//!
//! List, extract, test, create and inspect ZIP archives, including ZIP64,
//! split and encrypted ones.

mod commands;
mod utils;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::{
    CompressionLevel, CreateOptions, EncryptionChoice, ExtractOptions, ListOptions, Zip64Choice,
    cmd_create, cmd_extract, cmd_info, cmd_list, cmd_test,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "oxizip")]
#[command(author, version, about = "Pure Rust ZIP archiver")]
#[command(long_about = "
OxiZip reads and writes ZIP archives: ZIP64, split volumes (.z01, .z02, ...),
traditional PKWARE encryption and WinZip AES.

Examples:
  oxizip list archive.zip
  oxizip list --json archive.zip
  oxizip extract archive.zip -o out
  oxizip extract archive.zip --existing skip -I '*.txt'
  oxizip create archive.zip src docs README.md
  oxizip create backup.zip data --encryption aes256 --split 100m
  oxizip test archive.zip
  oxizip info archive.zip
")]
struct Cli {
    /// Log filter (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List contents of an archive
    #[command(alias = "l")]
    List {
        /// Archive file to list
        archive: PathBuf,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Output as JSON (machine-readable)
        #[arg(short, long)]
        json: bool,

        /// Include only files matching pattern (glob syntax: *.txt, src/**/*)
        #[arg(short = 'I', long)]
        include: Vec<String>,

        /// Exclude files matching pattern (glob syntax)
        #[arg(short = 'X', long)]
        exclude: Vec<String>,

        /// Code page for names without the UTF-8 flag (e.g. shift_jis, windows-1252)
        #[arg(long)]
        encoding: Option<String>,
    },

    /// Extract files from an archive
    #[command(alias = "x")]
    Extract {
        /// Archive file to extract
        archive: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Files to extract (all if empty)
        files: Vec<String>,

        /// Include only files matching pattern (glob syntax: *.txt, src/**/*)
        #[arg(short = 'I', long)]
        include: Vec<String>,

        /// Exclude files matching pattern (glob syntax)
        #[arg(short = 'X', long)]
        exclude: Vec<String>,

        /// What to do with files that already exist
        #[arg(short, long, value_enum, default_value = "ask")]
        existing: ExistingPolicy,

        /// Password for encrypted entries (prompted when needed if omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Code page for names without the UTF-8 flag
        #[arg(long)]
        encoding: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Show progress bar
        #[arg(short = 'P', long, default_value = "true")]
        progress: bool,
    },

    /// Test archive integrity
    #[command(alias = "t")]
    Test {
        /// Archive file to test
        archive: PathBuf,

        /// Password for encrypted entries
        #[arg(short, long)]
        password: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Create a new archive
    #[command(alias = "c")]
    Create {
        /// Output archive file
        archive: PathBuf,

        /// Files and directories to add
        files: Vec<PathBuf>,

        /// Compression level
        #[arg(short = 'l', long, value_enum, default_value = "normal")]
        compression: CompressionLevel,

        /// Encrypt entries
        #[arg(short, long, value_enum, default_value = "none")]
        encryption: EncryptionChoice,

        /// Password for encryption (prompted if omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Split into volumes of this size (e.g. 64k, 100m, 2g)
        #[arg(short, long)]
        split: Option<String>,

        /// When to write ZIP64 records
        #[arg(long, value_enum, default_value = "as-needed")]
        zip64: Zip64Choice,

        /// Archive comment
        #[arg(long)]
        comment: Option<String>,

        /// Compress entries of at least 1 MiB on all cores
        #[arg(long)]
        parallel: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Show progress bar
        #[arg(short = 'P', long, default_value = "true")]
        progress: bool,
    },

    /// Show information about an archive
    #[command(alias = "i")]
    Info {
        /// Archive file to inspect
        archive: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// What to do with an existing extraction target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExistingPolicy {
    /// Fail
    Throw,
    /// Replace it
    Overwrite,
    /// Keep it and skip the entry
    Skip,
    /// Ask for each file
    Ask,
}

impl From<ExistingPolicy> for oxizip_archive::ExtractExistingFile {
    fn from(policy: ExistingPolicy) -> Self {
        match policy {
            ExistingPolicy::Throw => Self::Throw,
            ExistingPolicy::Overwrite => Self::Overwrite,
            ExistingPolicy::Skip => Self::Skip,
            ExistingPolicy::Ask => Self::Ask,
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let result = match cli.command {
        Commands::List {
            archive,
            verbose,
            json,
            include,
            exclude,
            encoding,
        } => cmd_list(
            &archive,
            &ListOptions {
                verbose,
                json,
                include: &include,
                exclude: &exclude,
                encoding: encoding.as_deref(),
            },
        ),
        Commands::Extract {
            archive,
            output,
            files,
            include,
            exclude,
            existing,
            password,
            encoding,
            verbose,
            progress,
        } => cmd_extract(
            &archive,
            &ExtractOptions {
                output: &output,
                files: &files,
                include: &include,
                exclude: &exclude,
                existing: existing.into(),
                password,
                encoding: encoding.as_deref(),
                verbose,
                progress,
            },
        ),
        Commands::Test {
            archive,
            password,
            verbose,
        } => cmd_test(&archive, password, verbose),
        Commands::Create {
            archive,
            files,
            compression,
            encryption,
            password,
            split,
            zip64,
            comment,
            parallel,
            verbose,
            progress,
        } => cmd_create(
            &archive,
            &files,
            CreateOptions {
                compression,
                encryption,
                password,
                split: split.as_deref(),
                zip64,
                comment,
                parallel,
                verbose,
                progress,
            },
        ),
        Commands::Info { archive } => cmd_info(&archive),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "oxizip", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
