use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = flowsh_cli::Cli::parse();
    flowsh_cli::run_cli(cli)
}
