//! In-flight measurement registry.
//!
//! One entry per dispatched measurement, deleted when its handler returns.
//! A sweeper garbage-collects entries that outlive any plausible handler as
//! a hedge against leaks, and SIGTERM drains the registry before exit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Entries older than this are presumed leaked and swept.
pub const JOB_MAX_AGE: Duration = Duration::from_secs(30);
/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// How long SIGTERM waits for in-flight measurements before forcing exit.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Instant>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, measurement_id: &str) {
        self.jobs
            .lock()
            .unwrap()
            .insert(measurement_id.to_string(), Instant::now());
    }

    pub fn remove(&self, measurement_id: &str) {
        self.jobs.lock().unwrap().remove(measurement_id);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries older than [`JOB_MAX_AGE`], returning what was swept.
    pub fn sweep(&self) -> Vec<String> {
        let mut jobs = self.jobs.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<String> = jobs
            .iter()
            .filter(|(_, started)| now.duration_since(**started) > JOB_MAX_AGE)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            jobs.remove(id);
        }
        stale
    }

    /// Periodic sweeper task.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let swept = registry.sweep();
                if !swept.is_empty() {
                    tracing::warn!("Swept {} stale measurement entries: {:?}", swept.len(), swept);
                }
            }
        })
    }

    /// Wait for the registry to empty, polling every 100 ms. Returns false
    /// when [`DRAIN_TIMEOUT`] expires first.
    pub async fn drain(&self) -> bool {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_and_remove() {
        let registry = JobRegistry::new();
        registry.insert("m1");
        registry.insert("m2");
        assert_eq!(registry.len(), 2);
        registry.remove("m1");
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        registry.remove("m2");
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_stale_entries() {
        let registry = JobRegistry::new();
        registry.insert("old");
        tokio::time::sleep(JOB_MAX_AGE + Duration::from_secs(1)).await;
        registry.insert("fresh");
        let swept = registry.sweep();
        assert_eq!(swept, vec!["old".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_once_empty() {
        let registry = Arc::new(JobRegistry::new());
        registry.insert("m1");
        let handle = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                registry.remove("m1");
            })
        };
        assert!(registry.drain().await);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_the_timeout() {
        let registry = JobRegistry::new();
        registry.insert("stuck");
        let drained = registry.drain().await;
        assert!(!drained);
    }
}
