use clap::Parser;
use tracing_subscriber::EnvFilter;

use quadruped_runtime::config::Settings;

#[tokio::main]
async fn main() {
    let settings = Settings::parse();

    // Setup logging (RUST_LOG overrides --log-level)
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = quadruped_runtime::runtime::run(settings).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
