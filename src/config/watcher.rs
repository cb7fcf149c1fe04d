//! Hot reload: watch the configuration file and publish changed configs.
//!
//! # Data Flow
//! ```text
//! notify event (parent directory) ──filter by file name──▶ tick
//! ticks ──debounce──▶ load_config ──unchanged? drop──▶ SluiceConfig update
//! ```
//!
//! The parent directory is watched rather than the file itself so that
//! editors which save by rename keep triggering reloads.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::loader::load_config;
use crate::config::schema::SluiceConfig;

/// Quiet period after the last file event before the config is read.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Running watcher. Dropping it stops updates.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `path` and send every valid configuration that differs from
    /// the last one sent (initially `current`).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        path: &Path,
        current: &SluiceConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SluiceConfig>), notify::Error> {
        let file_name = path
            .file_name()
            .map(OsStr::to_os_string)
            .ok_or_else(|| notify::Error::path_not_found().add_path(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if concerns(&event, &file_name) => {
                    if tick_tx.send(()).is_err() {
                        tracing::trace!("Config watcher task gone; ignoring file event");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(publish_changes(
            path.to_path_buf(),
            ChangeFilter::new(current),
            tick_rx,
            update_tx,
        ));

        tracing::info!(path = %path.display(), "Config watcher started");
        Ok((
            Self {
                _watcher: watcher,
                task,
            },
            update_rx,
        ))
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn publish_changes(
    path: PathBuf,
    mut filter: ChangeFilter,
    mut ticks: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<SluiceConfig>,
) {
    while ticks.recv().await.is_some() {
        // Coalesce the burst of events a single save produces.
        loop {
            tokio::time::sleep(DEBOUNCE).await;
            let mut more = false;
            while ticks.try_recv().is_ok() {
                more = true;
            }
            if !more {
                break;
            }
        }

        match load_config(&path) {
            Ok(config) if filter.accept(&config) => {
                tracing::info!(path = %path.display(), "Config file changed; reloading");
                if updates.send(config).is_err() {
                    tracing::debug!("Config receiver closed; watcher stopping");
                    return;
                }
            }
            Ok(_) => tracing::debug!(path = %path.display(), "Config file touched without changes"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config; keeping current configuration")
            }
        }
    }
}

/// Whether a directory event touches the watched file.
fn concerns(event: &Event, file_name: &OsStr) -> bool {
    let kind = &event.kind;
    (kind.is_modify() || kind.is_create())
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Drops configurations identical to the last accepted one.
struct ChangeFilter {
    last: Option<serde_json::Value>,
}

impl ChangeFilter {
    fn new(current: &SluiceConfig) -> Self {
        Self {
            last: serde_json::to_value(current).ok(),
        }
    }

    fn accept(&mut self, config: &SluiceConfig) -> bool {
        let Ok(value) = serde_json::to_value(config) else {
            return true;
        };
        if self.last.as_ref() == Some(&value) {
            return false;
        }
        self.last = Some(value);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use notify::event::{CreateKind, ModifyKind};
    use notify::EventKind;

    use super::*;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_events_on_the_config_file_count() {
        let name = OsString::from("sluice.toml");
        assert!(concerns(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/sluice/sluice.toml"),
            &name
        ));
        assert!(concerns(
            &event(EventKind::Create(CreateKind::File), "/etc/sluice/sluice.toml"),
            &name
        ));
        assert!(!concerns(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/sluice/other.toml"),
            &name
        ));
        assert!(!concerns(
            &event(EventKind::Access(notify::event::AccessKind::Any), "/etc/sluice/sluice.toml"),
            &name
        ));
    }

    #[test]
    fn unchanged_config_is_not_republished() {
        let mut config = SluiceConfig::default();
        let mut filter = ChangeFilter::new(&config);
        assert!(!filter.accept(&config));

        config.instance.name = Some("edge-2".into());
        assert!(filter.accept(&config));
        assert!(!filter.accept(&config));
    }
}
