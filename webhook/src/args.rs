use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use mcpl_common::McplHomeArg;

/// Command-line arguments for the standalone `mcpl-webhook` binary.
#[derive(Parser, Debug, Clone)]
#[command(about = "MCPL webhook front-end: signature-verified external events, normalized into push events.")]
pub struct Args {
    #[command(flatten)]
    pub home: McplHomeArg,

    /// Address the webhook HTTP endpoints listen on.
    #[arg(long, default_value = "127.0.0.1:8089")]
    pub bind: SocketAddr,
}

/// Resolves the directory `webhook.toml` is read from: the `--mcpl-home`
/// flag, else `MCPL_HOME`, else `~/.mcpl` — the same convention
/// `mcpl-core::config::find_mcpl_home` uses, kept independent here so this
/// crate has no dependency on `mcpl-core`.
pub fn resolve_home(home: &McplHomeArg) -> std::io::Result<PathBuf> {
    if let Some(dir) = &home.mcpl_home {
        return Ok(dir.clone());
    }
    if let Ok(val) = std::env::var("MCPL_HOME")
        && !val.is_empty()
    {
        return Ok(PathBuf::from(val));
    }
    let mut p = dirs::home_dir().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "could not find home directory"))?;
    p.push(".mcpl");
    Ok(p)
}
