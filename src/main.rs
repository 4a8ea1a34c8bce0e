use clap::Parser;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

use vidflow::config::{Configuration, DEFAULT_VIDEO, PostgresConfig};
use vidflow::coordinator::{CoordinatorBuilder, Topology};
use vidflow::error::AppError;

/// Runs the video analytics pipeline.
#[derive(Parser, Debug)]
#[command(name = "vidflow", version)]
struct Cli {
    /// TOML topology file. The built-in four stage chain is used without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Media for the first stage, e.g. `file://frames!loop`.
    #[arg(long)]
    video: Option<String>,

    /// Run only the named stage.
    #[arg(long)]
    stage: Option<String>,

    /// Run each stage in its own process.
    #[arg(long, conflicts_with = "stage")]
    processes: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Stop when stdin closes. Set on stages started with `--processes`.
    #[arg(long, hide = true)]
    supervised: bool,
}

impl Cli {
    /// Arguments that make a child process load the same topology.
    fn child_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(video) = &self.video {
            args.push("--video".to_string());
            args.push(video.clone());
        }
        args.push("--log-level".to_string());
        args.push(self.log_level.to_string());
        args
    }
}

fn init_logging(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn load_topology(cli: &Cli) -> Result<Topology, AppError> {
    let configuration = match &cli.config {
        Some(path) => {
            let configuration = Configuration::load(path)?;
            match &cli.video {
                Some(video) => configuration.with_video(video),
                None => configuration,
            }
        }
        None => Configuration::default_chain(cli.video.as_deref().unwrap_or(DEFAULT_VIDEO)),
    };
    let topology = Topology::from_configuration(configuration)?;
    Ok(match &cli.stage {
        Some(name) => topology.select(name)?,
        None => topology,
    })
}

fn watch_signals(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("{}", AppError::Signal(e)),
        }
        cancel_token.cancel();
    });
}

fn watch_parent(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buffer = [0u8; 64];
        // parent closes the pipe to stop us
        while let Ok(read) = stdin.read(&mut buffer).await {
            if read == 0 {
                break;
            }
        }
        info!("Parent closed stdin, stopping");
        cancel_token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let topology = load_topology(&cli)?;
    let postgres = PostgresConfig::from_env()?;
    let cancel_token = CancellationToken::new();
    watch_signals(cancel_token.clone());
    if cli.supervised {
        watch_parent(cancel_token.clone());
    }

    let coordinator = CoordinatorBuilder::new(topology)
        .postgres(postgres)
        .cancel_token(cancel_token)
        .build();

    if cli.processes {
        let executable = std::env::current_exe().map_err(AppError::Process)?;
        coordinator.run_processes(executable, cli.child_args()).await?;
    } else {
        for report in coordinator.run().await? {
            info!(
                "Stage {} handled {} frame(s), sent {}, dropped {}",
                report.name, report.received, report.sent, report.dropped
            );
        }
    }
    Ok(())
}
