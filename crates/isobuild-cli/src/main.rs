//! isobuild CLI tool.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "isobuild")]
#[command(
    about = "Build a static executable and ship it alone in a runtime image",
    long_about = None
)]
struct Cli {
    /// Log output format
    #[arg(
        long,
        global = true,
        env = "ISOBUILD_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the pipeline configuration
    #[arg(default_value = "isobuild.kdl")]
    path: PathBuf,

    /// Custom interpolation variable, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the equivalent two-stage containerfile
    Render {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Run the pipeline against the local Docker daemon
    Build {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory to extract the artifact to and keep it in after the run
        #[arg(long, env = "ISOBUILD_STAGING_DIR")]
        staging: Option<PathBuf>,

        /// Tag for the runtime image, overriding the configured one
        #[arg(long)]
        tag: Option<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report linkage and stripped state of an executable
    Inspect {
        /// Executable to inspect
        binary: PathBuf,

        /// Cryptography library that must be linked statically
        #[arg(long, default_value = "openssl")]
        crypto: String,

        /// readelf binary to use
        #[arg(long, env = "ISOBUILD_READELF", default_value = "readelf")]
        readelf: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { config } => {
            commands::validate(&config.path, &config.vars)?;
        }
        Commands::Render { config } => {
            commands::render(&config.path, &config.vars)?;
        }
        Commands::Build {
            config,
            staging,
            tag,
            json,
        } => {
            commands::build::run_local(&config.path, &config.vars, staging, tag, json).await?;
        }
        Commands::Inspect {
            binary,
            crypto,
            readelf,
        } => {
            commands::inspect::inspect(&binary, &crypto, &readelf).await?;
        }
    }

    Ok(())
}
