use clap::ArgMatches;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default control/telemetry listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Default destination root for transferred content.
pub const DEFAULT_OUT_DIR: &str = "./downloads";

/// How often the engine samples torrent stats into progress events (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Messages an observer may fall behind by before it starts missing them.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub out_dir: PathBuf,
    pub poll_interval: Duration,
    /// `None` waits for cancel confirmation indefinitely.
    pub cancel_timeout: Option<Duration>,
    pub telemetry_capacity: usize,
    pub console: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            cancel_timeout: None,
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
            console: false,
        }
    }
}

impl ServiceConfig {
    /// Reads the `serve` subcommand flags.
    pub fn from_matches(m: &ArgMatches) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(s) = m.get_one::<String>("bind") {
            cfg.bind = s.parse().map_err(|e| anyhow::anyhow!("invalid --bind {}: {}", s, e))?;
        }
        if let Some(s) = m.get_one::<String>("out_dir") {
            cfg.out_dir = PathBuf::from(s);
        }
        if let Some(s) = m.get_one::<String>("poll_interval_ms") {
            cfg.poll_interval = Duration::from_millis(s.parse()?);
        }
        if let Some(s) = m.get_one::<String>("cancel_timeout_secs") {
            let secs: u64 = s.parse()?;
            cfg.cancel_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(s) = m.get_one::<String>("telemetry_capacity") {
            cfg.telemetry_capacity = s.parse::<usize>()?.max(1);
        }
        cfg.console = m.get_flag("console");
        Ok(cfg)
    }
}
