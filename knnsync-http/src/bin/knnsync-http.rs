use clap::Parser;
use knnsync_http::{ServerConfig, cors::parse_origins, server::DEFAULT_MAX_UPLOAD_BYTES};
use secrecy::SecretString;
use std::path::PathBuf;

/// knnsync model storage server
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Host address to bind to
    #[arg(short = 'H', long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Pre-shared key required for uploads and deletes
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory for stored artifacts
    #[arg(short, long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Comma-separated list of allowed CORS origins
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    /// Largest accepted upload body in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    knnsync_core::init_tracing();

    let cli = Cli::parse();
    let defaults = ServerConfig::default();
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        api_key: SecretString::new(cli.api_key.unwrap_or_default().into_boxed_str()),
        data_dir: cli.data_dir,
        allowed_origins: cli
            .allowed_origins
            .as_deref()
            .map(parse_origins)
            .unwrap_or(defaults.allowed_origins),
        max_upload_bytes: cli.max_upload_bytes,
    };

    if let Err(e) = knnsync_http::start_server(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
