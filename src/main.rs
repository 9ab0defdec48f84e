use clap::{Arg, ArgAction, Command};
use std::sync::Arc;
use std::time::Duration;
use torrent_relay::config::{self, ServiceConfig};
use torrent_relay::core::broadcaster::TelemetryBroadcaster;
use torrent_relay::core::coordinator::Coordinator;
use torrent_relay::core::registry::JobRegistry;
use torrent_relay::plugins::bt::driver::BtDriver;
use torrent_relay::server::handler::ControlServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn build_cli() -> Command {
    let serve = Command::new("serve")
        .about("Run the control and telemetry server")
        .arg(
            Arg::new("bind")
                .long("bind")
                .help("Listen address for control and telemetry")
                .default_value(config::DEFAULT_BIND)
                .num_args(1),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Destination directory for transferred content")
                .default_value(config::DEFAULT_OUT_DIR)
                .num_args(1),
        )
        .arg(
            Arg::new("poll_interval_ms")
                .long("poll-interval-ms")
                .help("How often transfer progress is sampled, in milliseconds")
                .default_value("1000")
                .num_args(1),
        )
        .arg(
            Arg::new("cancel_timeout_secs")
                .long("cancel-timeout-secs")
                .help("Fail a job whose cancellation is not confirmed in time (0 = wait forever)")
                .default_value("0")
                .num_args(1),
        )
        .arg(
            Arg::new("telemetry_capacity")
                .long("telemetry-capacity")
                .help("Messages an observer may lag behind before it starts missing them")
                .default_value("256")
                .num_args(1),
        )
        .arg(
            Arg::new("console")
                .long("console")
                .help("Render job progress in this terminal")
                .action(ArgAction::SetTrue),
        );

    Command::new("torrent-relay")
        .about("Single-flight torrent transfer service with live progress telemetry")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(serve)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,librqbit=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();

    if let Some(("serve", m)) = matches.subcommand() {
        let cfg = ServiceConfig::from_matches(m)?;
        tokio::fs::create_dir_all(&cfg.out_dir).await?;

        let telemetry = TelemetryBroadcaster::new(cfg.telemetry_capacity);
        let engine = Arc::new(BtDriver::new(cfg.out_dir.clone(), cfg.poll_interval));
        let coordinator = Coordinator::new(
            Arc::new(JobRegistry::new()),
            engine,
            telemetry,
            cfg.out_dir.clone(),
            cfg.cancel_timeout,
        );

        if cfg.console {
            tokio::spawn(torrent_relay::console::run(coordinator.subscribe()));
        }

        let server = ControlServer::start(coordinator, cfg.bind).await?;
        info!(addr = %server.local_addr(), out_dir = %cfg.out_dir.display(), "torrent relay running");

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        if tokio::time::timeout(Duration::from_secs(5), server.shutdown()).await.is_err() {
            info!("shutdown timed out with observers still attached");
        }
    }

    Ok(())
}
