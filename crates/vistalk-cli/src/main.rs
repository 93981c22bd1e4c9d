use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vistalk_core::config::{Config, LoggingConfig};
use vistalk_core::types::{ChatRequest, ImageInput};
use vistalk_pipeline::{PipelineContext, RunOutcome, run_pipeline};

#[derive(Parser)]
#[command(
    name = "vistalk",
    about = "Camera-grounded voice assistant: vision model replies streamed with speech",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one request in-process and print the event stream
    Ask {
        prompt: String,

        /// Skip speech synthesis
        #[arg(long)]
        no_tts: bool,

        /// Do not capture a camera frame
        #[arg(long)]
        text_only: bool,
    },

    /// Query a running gateway's health probe
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose common issues
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(cli.verbose, config.logging.as_ref());
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Ask {
            prompt,
            no_tts,
            text_only,
        } => ask(&config, &prompt, no_tts, text_only).await?,
        Commands::Status => status(&config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at `{key}`"),
            },
        },
        Commands::Doctor => doctor(&config, &config_path)?,
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level`, then `info`.
fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(&level);
        for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
            match directive.parse::<tracing_subscriber::filter::Directive>() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring invalid log filter {directive:?}: {e}"),
            }
        }
        filter
    });

    let json = logging.is_some_and(|l| l.format == "json");
    let to_stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, to_stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());
    tracing::info!("Starting vistalk gateway on port {port}");

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    let pipeline = Arc::new(PipelineContext::init(&config).await?);
    let state = vistalk_gateway::GatewayState::new(Arc::new(config), pipeline);

    #[cfg(feature = "metrics")]
    let state = match vistalk_gateway::metrics::install_prometheus_recorder() {
        Ok(handle) => state.with_metrics(handle),
        Err(e) => {
            tracing::warn!(%e, "Metrics recorder unavailable");
            state
        }
    };

    vistalk_gateway::start_gateway(Arc::new(state), port).await
}

async fn ask(config: &Config, prompt: &str, no_tts: bool, text_only: bool) -> anyhow::Result<()> {
    let ctx = PipelineContext::init(config).await?;
    let settings = ctx.settings();
    let image = if text_only {
        ImageInput::Omitted
    } else {
        ImageInput::Camera
    };
    let request = ChatRequest::new(prompt)
        .with_max_tokens(settings.default_max_tokens)
        .with_voice(settings.default_voice.clone())
        .with_tts(!no_tts)
        .with_image(image);

    let format = config.wire_format();
    let (tx, mut rx) = mpsc::channel(settings.channel_capacity);
    let print = async move {
        while let Some(event) = rx.recv().await {
            print!("{}", format.encode(&event));
        }
    };
    let (summary, ()) = tokio::join!(
        run_pipeline(&ctx, request, tx, CancellationToken::new()),
        print
    );
    ctx.shutdown().await;

    for (stage, spent) in &summary.stage_timings {
        tracing::debug!(stage = stage.as_str(), secs = spent.as_secs_f64(), "Stage timing");
    }
    match summary.outcome {
        RunOutcome::Done => Ok(()),
        RunOutcome::Failed(kind) => anyhow::bail!("request failed ({})", kind.as_str()),
        RunOutcome::Disconnected => anyhow::bail!("request abandoned"),
    }
}

async fn status(config: &Config) -> anyhow::Result<()> {
    println!("vistalk v{}", env!("CARGO_PKG_VERSION"));
    let url = format!("http://127.0.0.1:{}/health", config.gateway_port());
    match reqwest::get(&url).await {
        Ok(resp) => {
            let body: serde_json::Value = resp.json().await?;
            println!("Gateway: {url}");
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Err(e) => {
            tracing::debug!(%e, "Health probe failed");
            println!("Gateway port: {}", config.gateway_port());
            println!("Status: not running");
        }
    }
    Ok(())
}

fn doctor(config: &Config, config_path: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!("Running diagnostics");
    if config_path.exists() {
        println!("Config: {}", config_path.display());
    } else {
        println!("Config: {} (not found, using defaults)", config_path.display());
    }

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        println!("warning: {warning}");
    }
    for error in &errors {
        println!("error: {error}");
    }
    if errors.is_empty() {
        println!("{} warning(s), no errors", warnings.len());
        Ok(())
    } else {
        anyhow::bail!("{} configuration error(s)", errors.len())
    }
}
