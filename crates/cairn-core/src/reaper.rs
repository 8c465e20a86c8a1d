//! Background idle reaper.
//!
//! Wakes every sweep interval and applies the manager's idle policy: quiet
//! Running sandboxes become Idle, and sandboxes quiet past the idle timeout
//! are destroyed. The task holds only a weak reference to the manager and
//! exits once the manager is gone.

use crate::lifecycle::LifecycleManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Reaper statistics.
#[derive(Debug, Default)]
pub struct ReaperStats {
    /// Sweeps completed.
    pub sweeps: AtomicU64,
    /// Running sandboxes moved to Idle.
    pub idled: AtomicU64,
    /// Sandboxes queued for destruction.
    pub evicted: AtomicU64,
}

impl ReaperStats {
    /// Get the number of sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Get the number of idled sandboxes.
    pub fn idled(&self) -> u64 {
        self.idled.load(Ordering::Relaxed)
    }

    /// Get the number of evicted sandboxes.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Handle to the running reaper task.
pub struct Reaper {
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    stats: Arc<ReaperStats>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawn the reaper on `runtime`.
    pub fn start(manager: &Arc<LifecycleManager>, runtime: &Handle, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        let stats = Arc::new(ReaperStats::default());

        let handle = runtime.spawn(Self::sweep_loop(
            Arc::downgrade(manager),
            interval,
            Arc::clone(&shutdown),
            Arc::clone(&shutdown_notify),
            Arc::clone(&stats),
        ));

        tracing::info!(interval_ms = interval.as_millis() as u64, "Idle reaper started");
        Self {
            shutdown,
            shutdown_notify,
            stats,
            handle: Some(handle),
        }
    }

    async fn sweep_loop(
        manager: Weak<LifecycleManager>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
        stats: Arc<ReaperStats>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::info!("Idle reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(manager) = manager.upgrade() else {
                        tracing::debug!("Lifecycle manager dropped, reaper exiting");
                        break;
                    };
                    let report = manager.sweep();
                    stats.sweeps.fetch_add(1, Ordering::Relaxed);
                    stats.idled.fetch_add(report.idled as u64, Ordering::Relaxed);
                    stats.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
                }
            }
        }
    }

    /// Get the reaper statistics.
    pub fn stats(&self) -> &ReaperStats {
        &self.stats
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
            && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Signal the task to stop. It exits at its next wakeup.
    pub fn stop(&mut self) {
        if self.handle.take().is_some() {
            self.shutdown.store(true, Ordering::Relaxed);
            self.shutdown_notify.notify_one();
            tracing::info!(
                sweeps = self.stats.sweeps(),
                idled = self.stats.idled(),
                evicted = self.stats.evicted(),
                "Idle reaper stopped"
            );
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeConfig};
    use crate::config::{CairnConfig, SandboxConfig};
    use crate::lifecycle::ManagerSettings;
    use crate::registry::ProviderRegistry;
    use crate::sandbox::SandboxState;
    use crate::store::{MemoryStore, Store};
    use crate::vault::CredentialVault;

    fn manager(dir: &std::path::Path, idle_after: Duration) -> Arc<LifecycleManager> {
        let mut config = CairnConfig::default();
        config.local_root = dir.to_path_buf();
        config.idle_after = idle_after;
        let registry = Arc::new(ProviderRegistry::from_config(&config).unwrap());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(Arc::clone(&store), "default", None, 1_000).unwrap());
        let bridge = Arc::new(Bridge::new(BridgeConfig::default()).unwrap());
        LifecycleManager::new(registry, vault, store, bridge, ManagerSettings::from_config(&config))
    }

    #[test]
    fn test_reaper_idles_running_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), Duration::from_millis(50));
        let id = m.create(SandboxConfig::default()).unwrap().id;
        m.execute(id, "true", None).unwrap();
        assert_eq!(m.state(id).unwrap(), SandboxState::Running);

        let mut reaper = Reaper::start(&m, m.bridge().handle(), Duration::from_millis(50));
        assert!(reaper.is_running());
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(m.state(id).unwrap(), SandboxState::Idle);
        assert!(reaper.stats().sweeps() > 0);
        assert_eq!(reaper.stats().idled(), 1);

        reaper.stop();
        assert!(!reaper.is_running());
    }

    #[test]
    fn test_reaper_exits_when_manager_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), Duration::from_secs(60));
        let bridge = Arc::clone(m.bridge());
        let reaper = Reaper::start(&m, bridge.handle(), Duration::from_millis(20));
        drop(m);
        std::thread::sleep(Duration::from_millis(200));
        assert!(!reaper.is_running());
    }
}
