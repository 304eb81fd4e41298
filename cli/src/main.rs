use clap::Parser;
use interp_session_cli::Cli;
use interp_session_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if !run_main(cli).await? {
        std::process::exit(1);
    }
    Ok(())
}
