use clap::Parser;
use mcpl_host::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcpl_common::logging::init();
    let args = Args::parse();
    mcpl_host::run(args).await
}
