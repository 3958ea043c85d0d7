//! Keeps the residency callback registered with the power stats service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use super::StateResidencyCallback;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait PowerStatsService: Send + Sync {
    fn register_state_residency_callback(
        &self,
        entity_name: &str,
        callback: Arc<dyn StateResidencyCallback>,
    ) -> anyhow::Result<()>;

    /// Whether the service process is still alive.
    fn is_alive(&self) -> bool;
}

/// Registers the callback, and registers it again whenever the service restarts.
pub struct DisplayStateResidencyWatcher {
    should_stop: Arc<AtomicBool>,
}

impl Drop for DisplayStateResidencyWatcher {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }
}

impl DisplayStateResidencyWatcher {
    pub fn new(
        service: Arc<dyn PowerStatsService>,
        entity_name: String,
        callback: Arc<dyn StateResidencyCallback>,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let should_stop = Arc::new(AtomicBool::new(false));

        {
            let should_stop = should_stop.clone();
            thread::Builder::new()
                .name(format!("residency: {entity_name}"))
                .spawn(move || {
                    let mut registered = false;

                    loop {
                        if should_stop.load(Ordering::SeqCst) {
                            break;
                        }

                        let alive = service.is_alive();
                        if registered && !alive {
                            warn!("power stats service died, waiting for it to come back");
                            registered = false;
                        }

                        if !registered && alive {
                            let result = service
                                .register_state_residency_callback(&entity_name, callback.clone());
                            match result {
                                Ok(()) => {
                                    debug!("registered residency callback for {entity_name}");
                                    registered = true;
                                }
                                Err(err) => {
                                    warn!("error registering residency callback: {err:?}");
                                }
                            }
                        }

                        thread::sleep(poll_interval);
                    }

                    debug!("exiting residency watcher thread for {entity_name}");
                })
                .context("error spawning the residency watcher thread")?;
        }

        Ok(Self { should_stop })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;
    use crate::residency::StateResidency;

    #[derive(Default)]
    struct MockService {
        alive: AtomicBool,
        fail_next: AtomicBool,
        registrations: AtomicUsize,
    }

    impl PowerStatsService for MockService {
        fn register_state_residency_callback(
            &self,
            entity_name: &str,
            callback: Arc<dyn StateResidencyCallback>,
        ) -> anyhow::Result<()> {
            assert_eq!(entity_name, "Display");
            assert!(callback.get_state_residency().is_empty());
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("transaction failed");
            }
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct Empty;

    impl StateResidencyCallback for Empty {
        fn get_state_residency(&self) -> Vec<StateResidency> {
            Vec::new()
        }
    }

    fn wait_for(what: &str, mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn reregisters_after_service_death() {
        let service = Arc::new(MockService::default());
        service.fail_next.store(true, Ordering::SeqCst);

        let _watcher = DisplayStateResidencyWatcher::new(
            service.clone(),
            String::from("Display"),
            Arc::new(Empty),
            Duration::from_millis(5),
        )
        .unwrap();

        // Nothing happens until the service is up, and a failed attempt is retried.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(service.registrations.load(Ordering::SeqCst), 0);
        service.alive.store(true, Ordering::SeqCst);
        wait_for("registration", || {
            service.registrations.load(Ordering::SeqCst) == 1
        });

        service.alive.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        service.alive.store(true, Ordering::SeqCst);
        wait_for("re-registration", || {
            service.registrations.load(Ordering::SeqCst) == 2
        });
    }

    #[test]
    fn drop_stops_thread() {
        let service = Arc::new(MockService::default());
        service.alive.store(true, Ordering::SeqCst);

        let watcher = DisplayStateResidencyWatcher::new(
            service.clone(),
            String::from("Display"),
            Arc::new(Empty),
            Duration::from_millis(5),
        )
        .unwrap();
        wait_for("registration", || {
            service.registrations.load(Ordering::SeqCst) == 1
        });

        drop(watcher);
        // The thread holds the last other reference to the service.
        wait_for("thread exit", || Arc::strong_count(&service) == 1);
    }
}
