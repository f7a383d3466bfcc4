use std::net::SocketAddr;

use clap::Parser;
use mcpl_common::McplHomeArg;

/// Command-line arguments for the MCPL host process.
#[derive(Parser, Debug, Clone)]
#[command(about = "MCPL host: the WebSocket control plane delegates connect to.")]
pub struct Args {
    #[command(flatten)]
    pub home: McplHomeArg,

    /// Address the delegate and UI WebSocket endpoints listen on.
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub bind: SocketAddr,
}
