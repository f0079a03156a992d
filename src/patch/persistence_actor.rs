//! Debounced patch persistence on sled
//!
//! The control loop hands over a fresh [`PatchSnapshot`] whenever the
//! registry or a knob's recall value changes. The actor keeps only the newest
//! one and writes it once the debounce window has passed without another
//! save, so a flurry of patch gestures costs a single database write.
//!
//! When a CSV export path is configured, every database write is followed by
//! a rewrite of that file.
//!
//! ```ignore
//! let handle = PersistenceActor::spawn("./state/patches.sled", 500, None)?;
//! handle.save(snapshot)?;
//! handle.flush().await?;
//! handle.shutdown();
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::export::export_csv;
use super::snapshot::PatchSnapshot;

/// Key the snapshot is stored under
const SNAPSHOT_KEY: &[u8] = b"patch_snapshot";

#[derive(Debug)]
pub enum PersistenceCommand {
    Save(PatchSnapshot),
    Load(oneshot::Sender<Option<PatchSnapshot>>),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown,
}

pub struct PersistenceActor {
    db: sled::Db,
    command_rx: mpsc::Receiver<PersistenceCommand>,
    pending: Option<PatchSnapshot>,
    last_save: Instant,
    debounce_ms: u64,
    write_count: u64,
    csv_path: Option<PathBuf>,
}

/// Cheap to clone; the control loop keeps one
#[derive(Clone, Debug)]
pub struct PersistenceHandle {
    cmd_tx: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceActor {
    /// Open the database and spawn the actor on the current runtime
    ///
    /// `debounce_ms` of 0 writes every snapshot immediately.
    pub fn spawn(db_path: &str, debounce_ms: u64, csv_path: Option<PathBuf>) -> Result<PersistenceHandle> {
        let db = sled::open(db_path)
            .with_context(|| format!("Failed to open sled database at: {}", db_path))?;

        info!("Patch database opened at: {}", db_path);

        let (cmd_tx, command_rx) = mpsc::channel(64);
        let actor = PersistenceActor {
            db,
            command_rx,
            pending: None,
            last_save: Instant::now(),
            debounce_ms,
            write_count: 0,
            csv_path,
        };
        tokio::spawn(actor.run());

        Ok(PersistenceHandle { cmd_tx })
    }

    async fn run(mut self) {
        debug!("Persistence actor started (debounce: {}ms)", self.debounce_ms);

        let check_every = if self.debounce_ms > 0 { self.debounce_ms } else { 1000 };
        let mut ticker = tokio::time::interval(Duration::from_millis(check_every));

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Every handle dropped
                        if let Err(e) = self.flush_pending().await {
                            error!("Final snapshot write failed: {:#}", e);
                        }
                        return;
                    };
                    match cmd {
                        PersistenceCommand::Save(snapshot) => {
                            trace!("Queued snapshot ({} connections)", snapshot.connections.len());
                            self.pending = Some(snapshot);
                            self.last_save = Instant::now();
                            if self.debounce_ms == 0 {
                                if let Err(e) = self.flush_pending().await {
                                    error!("Snapshot write failed: {:#}", e);
                                }
                            }
                        }
                        PersistenceCommand::Load(reply) => {
                            let _ = reply.send(self.load());
                        }
                        PersistenceCommand::Flush(reply) => {
                            let result = self.flush_pending().await;
                            let _ = reply.send(result);
                        }
                        PersistenceCommand::Shutdown => {
                            if let Err(e) = self.flush_pending().await {
                                error!("Final snapshot write failed: {:#}", e);
                            }
                            info!("Persistence actor stopped ({} writes)", self.write_count);
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.pending.is_some()
                        && self.debounce_ms > 0
                        && self.last_save.elapsed() >= Duration::from_millis(self.debounce_ms)
                    {
                        if let Err(e) = self.flush_pending().await {
                            error!("Snapshot write failed: {:#}", e);
                        }
                    }
                }
            }
        }
    }

    async fn flush_pending(&mut self) -> Result<()> {
        let Some(snapshot) = self.pending.take() else {
            return Ok(());
        };

        let json = serde_json::to_vec(&snapshot).context("Failed to serialize patch snapshot")?;
        let db = self.db.clone();

        // sled flushes synchronously
        tokio::task::spawn_blocking(move || {
            db.insert(SNAPSHOT_KEY, json)?;
            db.flush()?;
            Ok::<_, sled::Error>(())
        })
        .await
        .context("Snapshot write task panicked")?
        .context("Failed to write snapshot to sled")?;

        self.write_count += 1;
        trace!("Snapshot written (write #{})", self.write_count);

        if let Some(path) = &self.csv_path {
            export_csv(path, &snapshot.connections).await?;
        }
        Ok(())
    }

    fn load(&self) -> Option<PatchSnapshot> {
        match self.db.get(SNAPSHOT_KEY) {
            Ok(Some(data)) => match serde_json::from_slice::<PatchSnapshot>(&data) {
                Ok(snapshot) => {
                    debug!(
                        "Loaded snapshot v{} from {} ({} connections, {} controls)",
                        snapshot.version,
                        snapshot.saved_at,
                        snapshot.connections.len(),
                        snapshot.controls.len()
                    );
                    Some(snapshot)
                }
                Err(e) => {
                    warn!("Stored snapshot is unreadable, starting empty: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read snapshot from sled: {}", e);
                None
            }
        }
    }
}

impl PersistenceHandle {
    /// Queue a snapshot without waiting
    ///
    /// Called from the control loop tick, so it never blocks. When the
    /// channel is full the snapshot is dropped; the next change sends a
    /// fresher one.
    pub fn save(&self, snapshot: PatchSnapshot) -> Result<()> {
        self.cmd_tx
            .try_send(PersistenceCommand::Save(snapshot))
            .map_err(|e| anyhow::anyhow!("Failed to queue snapshot: {}", e))
    }

    /// Most recently written snapshot (pending saves are not included)
    pub async fn load(&self) -> Result<Option<PatchSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PersistenceCommand::Load(tx))
            .await
            .context("Failed to send load command: actor shut down")?;
        rx.await.context("Failed to receive load response")
    }

    /// Write any pending snapshot now
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PersistenceCommand::Flush(tx))
            .await
            .context("Failed to send flush command: actor shut down")?;
        rx.await.context("Failed to receive flush response")?
    }

    /// Fire-and-forget; the actor flushes before it exits
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(PersistenceCommand::Shutdown);
    }
}
