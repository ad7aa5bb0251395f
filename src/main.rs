use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use odas_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

mod replay;

#[derive(Parser, Debug)]
#[command(
    name = "odas-relay",
    version,
    about = "Relay ODAS sound source streams to browser visualizers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Default log level.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Per-module level override such as `odas_server::listener=debug`.
    /// Repeatable.
    #[arg(long = "log-module", global = true, value_parser = parse_module_level)]
    log_modules: Vec<(String, Level)>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
}

fn parse_module_level(s: &str) -> Result<(String, Level), String> {
    let (module, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected MODULE=LEVEL, got `{s}`"))?;
    if module.is_empty() {
        return Err(format!("missing module name in `{s}`"));
    }
    let level = level
        .parse::<Level>()
        .map_err(|e| format!("bad level in `{s}`: {e}"))?;
    Ok((module.to_owned(), level))
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (the default).
    Serve(ServeArgs),
    /// Stream recorded SST/SSL files into a running relay.
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    #[arg(long, default_value_t = 8080)]
    http_port: u16,
    /// Port ODAS sends SST (tracked sources) to.
    #[arg(long, default_value_t = 9000)]
    tracking_port: u16,
    /// Port ODAS sends SSL (potential sources) to.
    #[arg(long, default_value_t = 9001)]
    potential_port: u16,
    #[arg(long, default_value = "public")]
    public_dir: PathBuf,
    /// Outbound messages queued per browser before frames are skipped.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,
}

#[derive(Args, Debug, Clone)]
struct ReplayArgs {
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long, default_value_t = 9000)]
    tracking_port: u16,
    #[arg(long, default_value_t = 9001)]
    potential_port: u16,
    #[arg(long, default_value = "sst_output.json")]
    sst: PathBuf,
    #[arg(long, default_value = "ssl_output.json")]
    ssl: PathBuf,
    /// Milliseconds between frames.
    #[arg(long, default_value_t = 8.0)]
    hop_ms: f64,
    /// Restart from the beginning after each pass.
    #[arg(long = "loop")]
    looping: bool,
}

impl From<ServeArgs> for odas_server::RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            bind_address: args.bind,
            http_port: args.http_port,
            tracking_port: args.tracking_port,
            potential_port: args.potential_port,
            public_dir: args.public_dir,
            max_send_queue: args.max_send_queue,
            ..Default::default()
        }
    }
}

impl ReplayArgs {
    fn into_config(self) -> anyhow::Result<replay::ReplayConfig> {
        anyhow::ensure!(
            self.hop_ms.is_finite() && self.hop_ms > 0.0,
            "--hop-ms must be positive"
        );
        Ok(replay::ReplayConfig {
            host: self.host,
            tracking_port: self.tracking_port,
            potential_port: self.potential_port,
            sst_path: self.sst,
            ssl_path: self.ssl,
            hop: Duration::from_secs_f64(self.hop_ms / 1000.0),
            looping: self.looping,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules,
        json: cli.json_logs,
    });

    match cli.command {
        Some(Command::Replay(args)) => {
            let config = args.into_config()?;
            tokio::select! {
                stats = replay::run(config) => {
                    let stats = stats?;
                    tracing::info!(passes = stats.passes, frames = stats.frames_sent, "Replay complete");
                }
                _ = tokio::signal::ctrl_c() => tracing::info!("Replay stopped"),
            }
        }
        Some(Command::Serve(args)) => serve(args, &telemetry).await?,
        None => serve(cli.serve, &telemetry).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs, telemetry: &odas_telemetry::TelemetryGuard) -> anyhow::Result<()> {
    let config = odas_server::RelayConfig::from(args);
    let handle = odas_server::start(config.clone(), telemetry.metrics()).await?;

    tracing::info!(
        "ODAS Visualizer running at http://localhost:{}",
        handle.http_port
    );
    tracing::info!(
        tracking_port = config.tracking_port,
        potential_port = config.potential_port,
        "Waiting for ODAS to connect..."
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
