//! clitheme - a terminal output theming engine
//!
//! Copyright 2024-2025 Andrew Yates
//! Licensed under Apache License 2.0
//!
//! `generate` compiles a theme source file into the on-disk data hierarchy
//! (entries, substitution rules, man pages); `exec` runs a command under a
//! pseudo-terminal and rewrites its output with the compiled rules;
//! `filter` applies the rules to stdin without a PTY.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod datafiles;
mod defs;
mod engine;
mod entry;
mod exec;
mod generator;
mod locale;
mod matcher;
mod options;
mod rewriter;
mod sanity;
mod sections;
mod store;
mod strutil;

use exec::ExecRunner;
use store::RuleStore;

#[derive(Parser)]
#[command(name = "clitheme")]
#[command(version = defs::ENGINE_VERSION)]
#[command(about = "Terminal output theming engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a theme file into the data hierarchy
    Generate {
        /// Theme source file
        file: PathBuf,

        /// Output directory (default: a fresh temporary directory)
        #[arg(long, value_name = "PATH")]
        output_path: Option<PathBuf>,

        /// Write into an existing data hierarchy instead of a fresh one
        #[arg(long)]
        overlay: bool,

        /// Theme info subdirectory name
        #[arg(long, value_name = "NAME", default_value = "1")]
        infofile_name: String,
    },
    /// Run a command under a PTY with output rewriting
    Exec {
        /// Substitution database path
        #[arg(long, value_name = "PATH")]
        db_path: Option<PathBuf>,

        /// Command and arguments to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Apply substitution rules to stdin and write the result to stdout
    Filter {
        /// Command line the rules should match against
        #[arg(long, value_name = "CMD")]
        command: Option<String>,

        /// Treat the input as stderr output
        #[arg(long)]
        stderr: bool,

        /// Substitution database path
        #[arg(long, value_name = "PATH")]
        db_path: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Generate {
            file,
            output_path,
            overlay,
            infofile_name,
        } => cmd_generate(&file, output_path, overlay, &infofile_name),
        Command::Exec { db_path, command } => cmd_exec(db_path, &command),
        Command::Filter {
            command,
            stderr,
            db_path,
        } => cmd_filter(command.as_deref(), stderr, db_path),
    };
    match code {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn cmd_generate(
    file: &PathBuf,
    output_path: Option<PathBuf>,
    overlay: bool,
    infofile_name: &str,
) -> Result<u8> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("cannot open file \"{}\"", file.display()))?;

    let output_path = match output_path {
        Some(path) => path,
        None => tempfile::Builder::new()
            .prefix("clitheme-temp-")
            .tempdir()
            .context("cannot create a temporary output directory")?
            .keep(),
    };
    if output_path.join(defs::DATA_PATHNAME).exists() && !overlay {
        tracing::debug!(
            path = %output_path.display(),
            "output path already holds a data hierarchy; writing into it"
        );
    }

    let outcome = sections::compile_theme(
        &content,
        &output_path,
        infofile_name,
        &file.display().to_string(),
    )
    .context("cannot write the data hierarchy")?;

    for message in &outcome.messages {
        eprintln!("{message}");
    }
    if outcome.success {
        println!("{}", output_path.display());
        Ok(0)
    } else {
        Ok(1)
    }
}

fn default_db_path() -> Result<PathBuf> {
    defs::default_db_path().context(
        "unable to locate the data directory; make sure $HOME is set correctly",
    )
}

fn cmd_exec(db_path: Option<PathBuf>, command: &[String]) -> Result<u8> {
    let db_path = match db_path {
        Some(path) => path,
        None => default_db_path()?,
    };

    // Fail early with a readable message when no theme is installed.
    RuleStore::open(&db_path).map_err(anyhow::Error::from)?;

    let mut runner = ExecRunner::spawn(command, db_path)?;
    let code = runner.run();
    Ok(code.clamp(0, 255) as u8)
}

fn cmd_filter(command: Option<&str>, is_stderr: bool, db_path: Option<PathBuf>) -> Result<u8> {
    let db_path = match db_path {
        Some(path) => path,
        None => default_db_path()?,
    };

    let mut input = Vec::new();
    io::stdin()
        .read_to_end(&mut input)
        .context("cannot read stdin")?;
    if input.is_empty() {
        return Ok(0);
    }

    let output = rewriter::process_chunk(&db_path, &input, command, is_stderr);
    let mut stdout = io::stdout().lock();
    stdout.write_all(&output).context("cannot write stdout")?;
    stdout.flush().ok();
    Ok(0)
}
