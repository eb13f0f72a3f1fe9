//! Command line interface.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::ClearConfig;
use crate::request::ClearRequest;
use crate::xfs::{is_xfs, XfsFs};

/// Parses a byte count with an optional `k`, `m`, `g` or `t` suffix (powers of 1024).
pub fn parse_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&s[..s.len() - 1], 10),
        Some('m') => (&s[..s.len() - 1], 20),
        Some('g') => (&s[..s.len() - 1], 30),
        Some('t') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte count: {}", s))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("byte count too large: {}", s))
}

/// Command line arguments.
#[derive(Parser)]
#[command(name = "clearfree")]
#[command(about = "Clear a physical range of a mounted XFS filesystem", long_about = None)]
pub struct Cli {
    /// Mount point of the filesystem.
    pub mountpoint: PathBuf,

    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "CLEARFREE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Action to perform.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Evacuate everything from [start, start + length).
    Clear {
        /// Physical start in bytes.
        #[arg(value_parser = parse_bytes)]
        start: u64,
        /// Length in bytes.
        #[arg(value_parser = parse_bytes)]
        length: u64,
        /// Clear the realtime device.
        #[arg(short, long)]
        realtime: bool,
        /// Number of passes to run.
        #[arg(short = 'n', long, default_value = "1")]
        iterations: u32,
        /// Leave metadata in place.
        #[arg(long)]
        no_metadata: bool,
        /// Use copy and exchange even when dedupe is available.
        #[arg(long)]
        no_dedupe: bool,
        /// Print run reports as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the filesystem geometry as JSON.
    Geometry,
}

impl Cli {
    /// Log filter implied by `-v`.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    fn load_config(&self) -> Result<ClearConfig> {
        match &self.config {
            Some(path) => ClearConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(ClearConfig::default()),
        }
    }

    /// Executes the parsed command.
    pub fn run(self) -> Result<()> {
        if !is_xfs(&self.mountpoint) {
            bail!("{} is not an XFS filesystem", self.mountpoint.display());
        }
        let fs = XfsFs::open(&self.mountpoint)
            .with_context(|| format!("opening {}", self.mountpoint.display()))?;
        let base = self.load_config()?;

        match self.command {
            Command::Geometry => {
                let geom = crate::fsops::FsOps::geometry(&fs)?;
                println!("{}", serde_json::to_string_pretty(&geom)?);
                Ok(())
            }
            Command::Clear {
                start,
                length,
                realtime,
                iterations,
                no_metadata,
                no_dedupe,
                json,
            } => {
                let mut config = base;
                config.realtime |= realtime;
                if no_metadata {
                    config.evacuate_metadata = false;
                }
                if no_dedupe {
                    config.use_dedupe = Some(false);
                }

                let mut req = ClearRequest::init(&fs, start, length, config)?;
                for pass in 0..iterations.max(1) {
                    let report = req.run().with_context(|| format!("pass {}", pass + 1))?;
                    if json {
                        println!("{}", serde_json::to_string(&report)?);
                    }
                    if req.efficacy()?.is_complete() {
                        break;
                    }
                }
                let efficacy = req.efficacy()?;
                req.free();
                println!(
                    "Cleared {} of {} requested ({:.1}%)",
                    efficacy.cleared,
                    efficacy.requested,
                    efficacy.percent()
                );
                Ok(())
            }
        }
    }
}
