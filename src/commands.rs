//! This module defines the command-line interface for `arag` using `clap`.
//!
//! It provides a [`Cli`] struct holding the global options and the parsed subcommand, and a
//! [`Commands`] enum with one variant per subcommand.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use awful_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Ask { question } => println!("asking {question}"),
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file. Defaults to `config.yaml` in the platform config directory.
    #[arg(long, short = 'c', global = true, env = "ARAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default configuration file and prompt template.
    Init,

    /// Add a PDF or text document to the index. Text pages are separated by form feeds.
    ///
    /// Ingesting under an existing name replaces that document's chunks one for one. If the
    /// document got shorter, its old trailing chunks stay in the index: run `arag clear` and
    /// re-ingest to drop them.
    #[clap(name = "ingest", alias = "add")]
    Ingest {
        /// The document to ingest.
        file: PathBuf,

        /// Document id to store it under. Defaults to the file name.
        #[arg(long, short = 'n')]
        name: Option<String>,
    },

    /// Ask one question about the indexed documents.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to be asked.
        question: String,
    },

    /// Ask questions in a loop until `exit`.
    #[clap(name = "interactive", alias = "i")]
    Interactive,

    /// Remove every document from the index.
    Clear,

    /// Show what the index holds.
    Stats,

    /// Check that the embedding and generation services are reachable.
    Doctor,
}
