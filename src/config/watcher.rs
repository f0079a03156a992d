//! Hot reload of the unit config
//!
//! Editors tend to produce a burst of modify events per save. Events are
//! coalesced by a single reload task: it waits for the file to settle, loads
//! and validates it once, and only forwards a config that differs from the
//! last one it forwarded.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Quiet period after the last modify event before the file is re-read
const RELOAD_SETTLE_MS: u64 = 100;

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load the config once and start watching it
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let (tx, rx) = mpsc::channel(4);

        // notify calls back on its own thread; the unbounded send never blocks it
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) if matches!(event.kind, EventKind::Modify(_)) => {
                debug!("Config file modified: {:?}", event.paths);
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(e) => error!("Watch error: {}", e),
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        tokio::spawn(reload_task(config_path.clone(), initial_config.clone(), event_rx, tx));
        info!("Config file watcher started for: {}", config_path);

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            Arc::new(initial_config),
        ))
    }

    /// Wait for the next changed, valid config; None once the watcher is gone
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

async fn reload_task(
    path: String,
    mut current: AppConfig,
    mut events: mpsc::UnboundedReceiver<()>,
    tx: mpsc::Sender<AppConfig>,
) {
    while events.recv().await.is_some() {
        // Keep waiting while events are still arriving
        while let Ok(Some(())) =
            tokio::time::timeout(Duration::from_millis(RELOAD_SETTLE_MS), events.recv()).await
        {}

        let loaded = match AppConfig::load(&path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to reload config (keeping old config): {:#}", e);
                continue;
            }
        };
        if loaded == current {
            debug!("Config rewritten without changes");
            continue;
        }
        if loaded.unit != current.unit || loaded.panel != current.panel || loaded.network != current.network {
            warn!("Unit, panel or network settings changed; they take effect after a restart");
        }

        current = loaded.clone();
        if tx.send(loaded).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
unit:
  id: 7
  name: "vco"
panel:
  jacks: []
tuning:
  long_press_ms: 1000
"#;

    #[tokio::test]
    async fn test_reload_forwards_changed_tuning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("unit.yaml");
        fs::write(&config_path, CONFIG)?;

        let (mut watcher, config) =
            ConfigWatcher::new(config_path.to_string_lossy().to_string()).await?;
        assert_eq!(config.unit.id, 7);
        assert_eq!(config.tuning.long_press_ms, 1000);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&config_path, CONFIG.replace("long_press_ms: 1000", "long_press_ms: 700"))?;

        // File events are not delivered on every CI filesystem
        if let Ok(Some(new_config)) = tokio::time::timeout(Duration::from_secs(2), watcher.next_config()).await {
            assert_eq!(new_config.tuning.long_press_ms, 700);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_rewrite_is_not_forwarded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("unit.yaml");
        fs::write(&config_path, CONFIG)?;

        let initial = AppConfig::from_yaml(CONFIG)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(reload_task(config_path.to_string_lossy().to_string(), initial, event_rx, tx));

        event_tx.send(())?;
        event_tx.send(())?;
        assert!(tokio::time::timeout(Duration::from_millis(400), rx.recv()).await.is_err());

        fs::write(&config_path, CONFIG.replace("long_press_ms: 1000", "long_press_ms: 800"))?;
        event_tx.send(())?;
        let forwarded = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
        assert_eq!(forwarded.map(|c| c.tuning.long_press_ms), Some(800));
        Ok(())
    }
}
