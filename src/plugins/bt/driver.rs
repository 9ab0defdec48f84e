use crate::core::error::EngineError;
use crate::core::events::TransferEvent;
use crate::plugins::bt::magnet::MagnetLink;
use crate::plugins::transfer::{TransferControl, TransferEngine, TransferHandle};
use anyhow::Context;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session};
use parking_lot::Mutex;
use sanitize_filename::sanitize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// BitTorrent engine backed by a lazily created librqbit session.
pub struct BtDriver {
    out_dir: PathBuf,
    poll_interval: Duration,
    session: OnceCell<Arc<Session>>,
    live: Arc<Mutex<HashSet<String>>>,
}

struct BtControl {
    token: CancellationToken,
}

impl TransferControl for BtControl {
    fn cancel(&self) -> Result<(), EngineError> {
        self.token.cancel();
        Ok(())
    }
}

/// Holds an info hash in the live set. Dropping it removes the hash, including when the
/// driver task panics. `retain` keeps it for torrents the session could not let go of.
struct LiveGuard {
    live: Arc<Mutex<HashSet<String>>>,
    info_hash: String,
    retained: bool,
}

impl LiveGuard {
    fn new(live: Arc<Mutex<HashSet<String>>>, info_hash: String) -> Self {
        live.lock().insert(info_hash.clone());
        Self { live, info_hash, retained: false }
    }

    fn retain(mut self) {
        self.retained = true;
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if !self.retained {
            self.live.lock().remove(&self.info_hash);
        }
    }
}

/// How a torrent task ended. `event` is `None` once nobody is listening.
struct Finish {
    event: Option<TransferEvent>,
    still_managed: bool,
}

impl Finish {
    fn released(event: TransferEvent) -> Self {
        Self { event: Some(event), still_managed: false }
    }
}

/// Settles the live set before the final event is sent.
fn conclude(guard: LiveGuard, tx: &mpsc::UnboundedSender<TransferEvent>, finish: Finish) {
    if finish.still_managed {
        warn!(info_hash = %guard.info_hash, "torrent is still held by the session, further starts are refused");
        guard.retain();
    } else {
        drop(guard);
    }
    if let Some(event) = finish.event {
        let _ = tx.unbounded_send(event);
    }
}

struct TorrentTask {
    session: Arc<Session>,
    magnet: MagnetLink,
    destination: PathBuf,
    tx: mpsc::UnboundedSender<TransferEvent>,
    token: CancellationToken,
    poll_interval: Duration,
}

impl BtDriver {
    pub fn new(out_dir: PathBuf, poll_interval: Duration) -> Self {
        Self {
            out_dir,
            poll_interval: poll_interval.max(Duration::from_millis(50)),
            session: OnceCell::new(),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn session(&self) -> Result<Arc<Session>, EngineError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.out_dir)
                    .await
                    .with_context(|| format!("create out_dir {}", self.out_dir.display()))?;
                Session::new(self.out_dir.clone()).await.context("create bt session")
            })
            .await
            .map_err(|e: anyhow::Error| EngineError::EngineUnavailable(format!("{:#}", e)))?;
        Ok(session.clone())
    }
}

#[async_trait]
impl TransferEngine for BtDriver {
    fn name(&self) -> &'static str {
        "librqbit"
    }

    fn is_tracking(&self, resource_id: &str) -> bool {
        match MagnetLink::parse(resource_id) {
            Ok(m) => self.live.lock().contains(&m.info_hash),
            Err(_) => false,
        }
    }

    async fn begin(&self, resource_id: &str, destination: &Path) -> Result<TransferHandle, EngineError> {
        let magnet = MagnetLink::parse(resource_id)?;
        let session = self.session().await?;
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| EngineError::EngineUnavailable(format!("create {}: {}", destination.display(), e)))?;

        let guard = LiveGuard::new(self.live.clone(), magnet.info_hash.clone());

        let (tx, rx) = mpsc::unbounded();
        let token = CancellationToken::new();
        let task = TorrentTask {
            session,
            magnet,
            destination: destination.to_path_buf(),
            tx,
            token: token.clone(),
            poll_interval: self.poll_interval,
        };
        tokio::spawn(async move {
            let finish = task.run().await;
            conclude(guard, &task.tx, finish);
        });

        Ok(TransferHandle { events: rx.boxed(), control: Box::new(BtControl { token }) })
    }
}

impl TorrentTask {
    fn emit(&self, event: TransferEvent) -> bool {
        self.tx.unbounded_send(event).is_ok()
    }

    async fn run(&self) -> Finish {
        let hash = &self.magnet.info_hash;
        info!(info_hash = %hash, trackers = self.magnet.trackers.len(), "adding magnet");

        let opts = AddTorrentOptions {
            output_folder: Some(self.destination.to_string_lossy().into_owned()),
            overwrite: true,
            ..Default::default()
        };

        // Adding a magnet blocks until peers hand over the metadata.
        let added = tokio::select! {
            _ = self.token.cancelled() => return Finish::released(TransferEvent::Cancelled),
            r = self.session.add_torrent(AddTorrent::from_url(&self.magnet.uri), Some(opts)) => r,
        };

        let handle = match added {
            Ok(AddTorrentResponse::Added(_, handle)) => handle,
            Ok(AddTorrentResponse::AlreadyManaged(..)) => {
                return Finish {
                    event: Some(TransferEvent::Failed {
                        reason: "torrent is already managed by the engine".to_string(),
                    }),
                    still_managed: true,
                };
            }
            Ok(_) => {
                return Finish::released(TransferEvent::Failed {
                    reason: "engine returned no torrent handle".to_string(),
                });
            }
            Err(e) => {
                warn!(info_hash = %hash, "add magnet failed: {:#}", e);
                return Finish::released(TransferEvent::Failed { reason: format!("{:#}", e) });
            }
        };

        let name = display_name(handle.name(), &self.magnet);
        self.emit(TransferEvent::Metadata { name, total_bytes: Some(handle.stats().total_bytes) });

        let outcome = self.watch(&handle).await;
        let removed = self.remove(&handle).await;
        if let Err(e) = &removed {
            warn!(info_hash = %hash, "torrent could not be removed from the session: {:#}", e);
        }

        let event = match outcome {
            Outcome::Completed => Some(TransferEvent::Completed),
            Outcome::Failed(reason) => Some(TransferEvent::Failed { reason }),
            Outcome::Cancelled => Some(match &removed {
                Ok(()) => TransferEvent::Cancelled,
                Err(e) => TransferEvent::CancelFailed { reason: format!("{:#}", e) },
            }),
            Outcome::Abandoned => {
                debug!(info_hash = %hash, "event consumer went away, dropping torrent");
                None
            }
        };
        Finish { event, still_managed: removed.is_err() }
    }

    async fn watch(&self, handle: &ManagedTorrent) -> Outcome {
        let mut ticker = tokio::time::interval(self.poll_interval);
        let completed = handle.wait_until_completed();
        tokio::pin!(completed);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Outcome::Cancelled,
                r = &mut completed => {
                    return match r {
                        Ok(()) => {
                            let stats = handle.stats();
                            self.emit(TransferEvent::Progress {
                                bytes_transferred: stats.progress_bytes,
                                total_bytes: Some(stats.total_bytes),
                                rate_bytes_per_sec: 0,
                            });
                            Outcome::Completed
                        }
                        Err(e) => Outcome::Failed(format!("{:#}", e)),
                    };
                }
                _ = ticker.tick() => {
                    let stats = handle.stats();
                    if let Some(err) = stats.error {
                        return Outcome::Failed(err);
                    }
                    let rate = stats
                        .live
                        .as_ref()
                        .map(|l| (l.download_speed.mbps * BYTES_PER_MIB) as u64)
                        .unwrap_or(0);
                    let sent = self.emit(TransferEvent::Progress {
                        bytes_transferred: stats.progress_bytes,
                        total_bytes: Some(stats.total_bytes),
                        rate_bytes_per_sec: rate,
                    });
                    if !sent {
                        return Outcome::Abandoned;
                    }
                }
            }
        }
    }

    /// Drops the torrent from the session, keeping downloaded files on disk.
    async fn remove(&self, handle: &ManagedTorrent) -> anyhow::Result<()> {
        self.session
            .delete(handle.id().into(), false)
            .await
            .with_context(|| format!("remove torrent {}", self.magnet.info_hash))
    }
}

/// Prefers the name from resolved metadata over the magnet's `dn`.
fn display_name(resolved: Option<String>, magnet: &MagnetLink) -> String {
    resolved
        .map(sanitize)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| magnet.display_name.clone())
}

enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
    Abandoned,
}
