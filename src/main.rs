//! Binary entry point: `starling inbound` runs the realtime voice
//! bridge, `starling outbound` dispatches one reminder batch.

use clap::{Parser, Subcommand};
use starling::{
    ari::AriClient,
    tools::{NetInfoClient, NetInfoTool, ToolSet},
    Bridge, Config, OutboundConfig, OutboundController, Settings,
};
use std::{process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "starling", version, about = "Asterisk <-> OpenAI realtime voice bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge inbound callers to the realtime model.
    Inbound {
        /// Stasis application receiving inbound calls.
        #[arg(long, default_value = "openai-app")]
        app: String,
    },
    /// Dispatch one batch of outbound reminder calls.
    Outbound {
        /// Stasis application handling originated calls.
        #[arg(long, default_value = "overdue-app")]
        app: String,
        /// SIP trunk to originate through.
        #[arg(long, default_value = "voip_issabel")]
        trunk: String,
        /// Dialplan-resolved media name to play.
        #[arg(long, default_value = "morosos_natalia")]
        media: String,
    },
    /// Show who the outbound batch would call today, without dialing.
    Plan,
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match settings.log_file_path.as_ref() {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "starling.log".to_owned());

            match std::fs::create_dir_all(directory)
                .and_then(|()| {
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(directory.join(file_name))
                }) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(Arc::new(file))
                        .with_ansi(false)
                        .init();
                },
                Err(e) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    error!("Could not open log file {path:?}: {e}; logging to stderr.");
                },
            }
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        },
    };

    init_logging(&settings);

    let ari = match AriClient::new(
        &settings.asterisk_host,
        settings.asterisk_port,
        &settings.asterisk_username,
        &settings.asterisk_password,
    ) {
        Ok(ari) => ari,
        Err(e) => {
            error!("Cannot build ARI client: {e}");
            return ExitCode::FAILURE;
        },
    };

    match cli.command {
        Command::Inbound { app } => run_inbound(settings, ari, app).await,
        Command::Outbound { app, trunk, media } => {
            run_outbound(settings, ari, app, trunk, media).await
        },
        Command::Plan => run_plan(settings).await,
    }
}

async fn run_inbound(settings: Settings, ari: AriClient, app: String) -> ExitCode {
    let api_key = match settings.require_openai() {
        Ok(key) => key.to_owned(),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        },
    };

    let config = Config::default()
        .inbound_app(app.clone())
        .realtime_model(settings.realtime_model.clone());

    let tools = if settings.netinfo_tools_enabled {
        match NetInfoClient::new(&settings.netinfo_url) {
            Ok(client) => {
                info!("Network-info tools enabled against {}.", settings.netinfo_url);
                ToolSet::new().with(Arc::new(NetInfoTool::new(client)))
            },
            Err(e) => {
                error!("Bad MIKROTIK_API_URL: {e}");
                return ExitCode::FAILURE;
            },
        }
    } else {
        info!("Network-info tools disabled.");
        ToolSet::new()
    };

    let bridge = Bridge::new(ari, config, tools, api_key, app, settings.local_ip);

    info!("Inbound bridge starting.");

    tokio::select! {
        () = bridge.run() => {},
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Signal handler failed: {e}");
            }
            info!("Shutdown requested; tearing down {} live call(s).", bridge.len());
            bridge.stop_all().await;
        },
    }

    ExitCode::SUCCESS
}

async fn run_outbound(
    settings: Settings,
    ari: AriClient,
    app: String,
    trunk: String,
    media: String,
) -> ExitCode {
    let db = match settings.require_db() {
        Ok(db) => db.clone(),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        },
    };

    let config = OutboundConfig::default()
        .app(app)
        .trunk(trunk)
        .media(media);

    let store = starling::outbound::SubscriberStore::new(db.dsn());
    let controller = OutboundController::new(ari, store, config);

    match controller.run_batch().await {
        Ok(stats) => {
            info!(
                "Batch finished: {}/{} successful.",
                stats.successful, stats.total,
            );
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!("Batch aborted: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Prints today's would-be call list without touching the PBX.
async fn run_plan(settings: Settings) -> ExitCode {
    use chrono::{Datelike, Local};

    let db = match settings.require_db() {
        Ok(db) => db.clone(),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        },
    };

    let store = starling::outbound::SubscriberStore::new(db.dsn());
    let today = Local::now();

    let candidates = match store.load_candidates(today.day()).await {
        Ok(candidates) => candidates,
        Err(e) => {
            error!("Could not load candidates: {e}");
            return ExitCode::FAILURE;
        },
    };

    let (callable, excluded): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.dispatchable());

    println!(
        "Call plan for {} (day {}): {} to call, {} excluded.",
        today.date_naive(),
        today.day(),
        callable.len(),
        excluded.len(),
    );

    if !callable.is_empty() {
        println!();
        println!(
            "{:>8}  {:<30}  {:<14}  {:>12}  {:>5}  {:>8}",
            "id", "name", "phone", "debt", "cut", "attempts",
        );

        let mut total_debt = 0.0;
        for candidate in &callable {
            total_debt += candidate.debt;
            println!(
                "{:>8}  {:<30}  {:<14}  {:>12.0}  {:>5}  {:>8}",
                candidate.id,
                truncate(&candidate.name, 30),
                candidate.phone.as_deref().unwrap_or("-"),
                candidate.debt,
                candidate
                    .cut_day
                    .map_or_else(|| "-".to_owned(), |c| c.to_string()),
                candidate.prior_attempts,
            );
        }

        println!();
        println!("Total outstanding debt on today's list: {total_debt:.0}");
    }

    if !excluded.is_empty() {
        println!();
        println!("Excluded today:");
        for candidate in &excluded {
            println!(
                "{:>8}  {:<30}  {}",
                candidate.id,
                truncate(&candidate.name, 30),
                candidate.exclusion.as_deref().unwrap_or(""),
            );
        }
    }

    ExitCode::SUCCESS
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}
