use std::path::PathBuf;

use clap::Parser;

/// Arguments shared by the MCPL host and webhook binaries: where to find
/// `mcpl.toml`/`inference-routing.json`, and where delegate state is
/// persisted.
#[derive(Parser, Debug, Clone)]
pub struct McplHomeArg {
    /// Overrides the `MCPL_HOME` environment variable / `~/.mcpl` default.
    #[arg(long, value_name = "DIR")]
    pub mcpl_home: Option<PathBuf>,
}
