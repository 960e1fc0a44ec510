//! Network monitor - connectivity and backend reachability.
//!
//! The monitor folds two signal sources into one observable value:
//!
//! - platform events (interface up/down), and
//! - reachability probes against the remote backend.
//!
//! Going online needs a successful probe; a platform "connected" event only
//! schedules one. Going offline needs a platform disconnect or
//! `offline_after` consecutive failed probes, so one dropped request does
//! not flap the state.

use crate::{remote::RemoteBackend, status::StatusHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

type TransitionCallback = Box<dyn Fn() + Send + Sync>;

/// Tracks whether the remote backend is reachable.
pub struct NetworkMonitor {
    remote: Arc<dyn RemoteBackend>,
    status: StatusHandle,
    state: watch::Sender<Option<bool>>,
    failures: Mutex<u32>,
    offline_after: u32,
    probe_requested: Notify,
    listeners: Mutex<Vec<TransitionCallback>>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("state", &*self.state.borrow())
            .field("offline_after", &self.offline_after)
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    pub fn new(remote: Arc<dyn RemoteBackend>, status: StatusHandle, offline_after: u32) -> Self {
        let (state, _rx) = watch::channel(None);
        Self {
            remote,
            status,
            state,
            failures: Mutex::new(0),
            offline_after: offline_after.max(1),
            probe_requested: Notify::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// `None` until the first probe result or platform event.
    pub fn is_online(&self) -> Option<bool> {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
        self.state.subscribe()
    }

    /// Register a callback fired on every transition into the online state.
    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(callback));
        }
    }

    /// Feed a platform connectivity event.
    pub fn on_platform_change(&self, connected: bool) {
        if connected {
            tracing::debug!("platform reports connectivity, scheduling probe");
            self.probe_requested.notify_one();
        } else {
            self.reset_failures();
            self.set_online(false, "platform disconnect");
        }
    }

    /// Probe the backend now and fold the result into the state.
    pub async fn probe_now(&self) -> bool {
        let reachable = match self.remote.probe().await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "reachability probe failed");
                false
            }
        };
        self.record_probe(reachable);
        reachable
    }

    /// Fold one probe outcome into the state. Network failures seen while
    /// draining are reported here too.
    pub fn record_probe(&self, success: bool) {
        if success {
            self.reset_failures();
            self.set_online(true, "probe succeeded");
            return;
        }

        let failures = match self.failures.lock() {
            Ok(mut failures) => {
                *failures = failures.saturating_add(1);
                *failures
            }
            Err(_) => self.offline_after,
        };
        // nothing to debounce while the state is still unknown
        if failures >= self.offline_after || self.is_online().is_none() {
            self.set_online(false, "probes failing");
        }
    }

    /// Periodic probe loop. Also wakes early when a platform event asks for a
    /// probe. Returns once `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.probe_requested.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.probe_now().await;
        }
        tracing::debug!("network monitor stopped");
    }

    fn reset_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = 0;
        }
    }

    fn set_online(&self, online: bool, cause: &str) {
        let previous = self.state.send_replace(Some(online));
        if previous == Some(online) {
            return;
        }

        tracing::info!(online, cause, "connectivity changed");
        self.status.update(|s| s.is_online = Some(online));

        if online {
            if let Ok(listeners) = self.listeners.lock() {
                for listener in listeners.iter() {
                    listener();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::RemoteError, remote::PullResponse, QueueEntry, Record, Timestamp};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ProbeOnly {
        down: AtomicBool,
    }

    #[async_trait]
    impl RemoteBackend for ProbeOnly {
        async fn apply(&self, _entry: &QueueEntry) -> Result<Record, RemoteError> {
            Err(RemoteError::Network("not used".into()))
        }

        async fn pull(&self, _since: Option<Timestamp>) -> Result<PullResponse, RemoteError> {
            Err(RemoteError::Network("not used".into()))
        }

        async fn probe(&self) -> Result<(), RemoteError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RemoteError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn monitor(offline_after: u32) -> (NetworkMonitor, Arc<ProbeOnly>, Arc<AtomicUsize>) {
        let remote = Arc::new(ProbeOnly::default());
        let monitor = NetworkMonitor::new(remote.clone(), StatusHandle::new(), offline_after);
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        monitor.on_transition(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, remote, transitions)
    }

    #[test]
    fn one_success_goes_online() {
        let (monitor, _, transitions) = monitor(2);
        assert_eq!(monitor.is_online(), None);
        monitor.record_probe(true);
        assert_eq!(monitor.is_online(), Some(true));
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_failure_does_not_flap() {
        let (monitor, _, _) = monitor(2);
        monitor.record_probe(true);
        monitor.record_probe(false);
        assert_eq!(monitor.is_online(), Some(true));
        monitor.record_probe(false);
        assert_eq!(monitor.is_online(), Some(false));
    }

    #[test]
    fn success_resets_failure_count() {
        let (monitor, _, _) = monitor(2);
        monitor.record_probe(true);
        monitor.record_probe(false);
        monitor.record_probe(true);
        monitor.record_probe(false);
        assert_eq!(monitor.is_online(), Some(true));
    }

    #[test]
    fn first_failure_from_unknown_is_offline() {
        let (monitor, _, _) = monitor(3);
        monitor.record_probe(false);
        assert_eq!(monitor.is_online(), Some(false));
    }

    #[test]
    fn platform_disconnect_is_immediate() {
        let (monitor, _, _) = monitor(5);
        monitor.record_probe(true);
        monitor.on_platform_change(false);
        assert_eq!(monitor.is_online(), Some(false));
    }

    #[test]
    fn platform_connect_does_not_flip_state() {
        let (monitor, _, transitions) = monitor(2);
        monitor.on_platform_change(false);
        monitor.on_platform_change(true);
        assert_eq!(monitor.is_online(), Some(false));
        assert_eq!(transitions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn each_reconnect_fires_exactly_once() {
        let (monitor, _, transitions) = monitor(1);
        monitor.record_probe(true);
        monitor.record_probe(true);
        monitor.record_probe(false);
        monitor.record_probe(true);
        monitor.record_probe(true);
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_mirrors_state() {
        let status = StatusHandle::new();
        let monitor = NetworkMonitor::new(Arc::new(ProbeOnly::default()), status.clone(), 2);
        monitor.record_probe(true);
        assert_eq!(status.get().is_online, Some(true));
        monitor.on_platform_change(false);
        assert_eq!(status.get().is_online, Some(false));
    }

    #[tokio::test]
    async fn probe_now_uses_the_backend() {
        let (monitor, remote, _) = monitor(1);
        assert!(monitor.probe_now().await);
        assert_eq!(monitor.is_online(), Some(true));

        remote.down.store(true, Ordering::SeqCst);
        assert!(!monitor.probe_now().await);
        assert_eq!(monitor.is_online(), Some(false));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (monitor, _, _) = monitor(2);
        let monitor = Arc::new(monitor);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(Duration::from_millis(10), rx).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(monitor.is_online(), Some(true));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
