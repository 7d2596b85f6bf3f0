use clap::Parser;
use gitops_launch::commands::{self, Cli};
use tracing_subscriber::{EnvFilter, fmt};

fn init_logging(cli: &Cli) {
    let default = if cli.verbose {
        "gitops_launch=debug,info"
    } else if cli.command.is_silent() {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(err) = commands::run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(commands::exit_code(&err));
    }
}
