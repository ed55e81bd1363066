use clap::{Parser, Subcommand};
use knnsync_cli::{
    CliResult, commands,
    config::{Settings, partial_show_secret},
};
use secrecy::SecretString;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON sync config file
    #[arg(short, long, env = "KNNSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory of the local document store
    #[arg(short, long, default_value = ".knnsync", env = "KNNSYNC_STORE", global = true)]
    store: PathBuf,

    /// Blob server base URL
    #[arg(long, env = "KNNSYNC_BLOB_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Blob server API key
    #[arg(long, env = "KNNSYNC_BLOB_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog records
    List,

    /// Create a model in the given slot, or the first free slot
    Create {
        model_id: Option<String>,
    },

    /// Set a model's display name
    Rename {
        model_id: String,
        name: String,
    },

    /// Delete a model and its stored artifacts
    Delete {
        model_id: String,
    },

    /// Load a model and print per-class counts
    Show {
        model_id: String,
    },

    /// Save an artifact file as a model's dataset
    Import {
        model_id: String,
        file: PathBuf,
    },

    /// Write a model's dataset to an artifact file
    Export {
        model_id: String,
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

async fn run(cli: Cli) -> CliResult<()> {
    let settings = Settings {
        config_file: cli.config,
        store_dir: cli.store,
        endpoint: cli.endpoint,
        api_key: cli.api_key.map(|k| SecretString::new(k.into_boxed_str())),
    };

    let open = || settings.open();
    let output = match cli.command {
        Commands::List => commands::list(&open()?).await?,
        Commands::Create { model_id } => commands::create(&open()?, model_id.as_deref()).await?,
        Commands::Rename { model_id, name } => {
            commands::rename(&open()?, &model_id, &name).await?
        }
        Commands::Delete { model_id } => commands::delete(&open()?, &model_id).await?,
        Commands::Show { model_id } => commands::show(&open()?, &model_id).await?,
        Commands::Import { model_id, file } => {
            commands::import(&open()?, &model_id, &file).await?
        }
        Commands::Export { model_id, file } => {
            commands::export(&open()?, &model_id, &file).await?
        }
        Commands::Config => {
            let config = settings.resolve()?;
            let mut value = serde_json::to_value(&config)?;
            value["blob"]["api_key"] = json!(partial_show_secret(&config.blob.api_key));
            value["store"] = json!(settings.store_dir.display().to_string());
            value
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let _ = dotenv::dotenv();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
