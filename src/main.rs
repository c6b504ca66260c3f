use resilience_manager::{config::AppConfig, init_server, observability::init_tracing};
use std::env;
use std::path::Path;
use std::process;

#[tokio::main]
async fn main() {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/resilience.yaml".to_string());

    let config = match AppConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: resilience-manager [config_file]");
            process::exit(1);
        }
    };

    init_tracing(config.logging.format);

    if let Err(e) = init_server(config, Some(Path::new(&config_path))).await {
        eprintln!("Resilience manager error: {}", e);
        process::exit(1);
    }
}
