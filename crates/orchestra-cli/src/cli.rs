//! Clap CLI definitions for Orchestra.

use clap::{Parser, Subcommand, ValueEnum};
use orchestra_types::message::LogLevel;
use orchestra_types::ClientRole;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  orchestra serve --port 4300          Run a server on a fixed port
  orchestra watch --port 4300          Print every message the server broadcasts
  orchestra send --port 4300 ping      Send a Ping
  orchestra send --port 4300 reload src/main.rs
  orchestra directory --port 4300 -f   Follow the connections directory
  orchestra listen --port 4301         Accept peers one at a time";

/// Orchestra: message and state exchange between development processes.
#[derive(Parser)]
#[command(name = "orchestra", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.orchestra/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Port to bind or dial, overriding the config file.
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a server and log clients and messages until Ctrl+C.
    Serve,
    /// Connect as a client and print every message received.
    Watch {
        /// Role announced to the server.
        #[arg(long, default_value = "tooling")]
        role: ClientRole,
    },
    /// Connect, send one message, and disconnect.
    Send {
        /// Role announced to the server.
        #[arg(long, default_value = "tooling")]
        role: ClientRole,

        #[command(subcommand)]
        message: SendCommands,
    },
    /// Print the server's connections directory.
    Directory {
        /// Keep printing whenever the directory changes.
        #[arg(long, short = 'f')]
        follow: bool,
    },
    /// Bind a listener and print the messages of each accepted peer.
    Listen,
}

#[derive(Subcommand)]
pub enum SendCommands {
    /// Liveness probe.
    Ping,
    /// Ask every process to shut down.
    Shutdown {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Forward a log line.
    Log {
        message: String,
        #[arg(long, default_value = "cli")]
        tag: String,
        #[arg(long, value_enum, default_value_t = Level::Info)]
        level: Level,
    },
    /// Request a reload of the given (modified) files.
    Reload {
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => LogLevel::Trace,
            Level::Debug => LogLevel::Debug,
            Level::Info => LogLevel::Info,
            Level::Warn => LogLevel::Warn,
            Level::Error => LogLevel::Error,
        }
    }
}
