//! Periodic controller status monitors
//!
//! A monitor re-runs one controller's `status` on a fixed period so that its
//! keywords keep flowing without anyone asking. At most one monitor exists
//! per controller; setting a new period replaces the running one and a zero
//! period stops it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Monitor {
    period: Duration,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    monitors: Mutex<BTreeMap<String, Monitor>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let monitors = self
            .monitors
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for monitor in monitors.values() {
            monitor.token.cancel();
        }
    }
}

/// Registry of running status monitors, shared by every dispatcher clone.
#[derive(Clone, Default)]
pub struct Monitors {
    inner: Arc<Inner>,
}

impl Monitors {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Monitor>> {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start, retime or stop the monitor called `name`.
    ///
    /// `poll` is called once per period, the first time right away. A zero
    /// `period` only stops a running monitor. Must be called from within a
    /// tokio runtime.
    pub fn set<F, Fut>(&self, name: &str, period: Duration, poll: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut monitors = self.lock();
        if let Some(previous) = monitors.remove(name) {
            previous.token.cancel();
        }
        if period.is_zero() {
            info!("{} monitor stopped", name);
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // A slow status must not trigger a burst of catch-up polls.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("{} monitor tick", task_name);
                        poll().await;
                    }
                }
            }
            debug!("{} monitor task ended", task_name);
        });

        info!("{} monitor every {:?}", name, period);
        monitors.insert(name.to_string(), Monitor { period, token });
    }

    /// Period of every running monitor, by controller name.
    pub fn periods(&self) -> BTreeMap<String, Duration> {
        self.lock()
            .iter()
            .map(|(name, monitor)| (name.clone(), monitor.period))
            .collect()
    }

    /// `text="monitors: <name>=<secs>,..."`, as reported by `status`.
    pub fn keyword(&self) -> String {
        let periods = self.periods();
        let listed = if periods.is_empty() {
            "none".to_string()
        } else {
            periods
                .iter()
                .map(|(name, period)| format!("{name}={}", period.as_secs()))
                .collect::<Vec<_>>()
                .join(",")
        };
        crate::sink::text_keyword(&format!("monitors: {listed}"))
    }

    /// Stop every monitor.
    pub fn stop_all(&self) {
        let mut monitors = self.lock();
        for (name, monitor) in std::mem::take(&mut *monitors) {
            monitor.token.cancel();
            debug!("{} monitor stopped", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::future::Ready<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        (count, move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test]
    async fn test_monitor_polls_until_stopped() {
        let monitors = Monitors::new();
        let (count, poll) = counter();

        monitors.set("filterwheel", Duration::from_millis(20), poll);
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);
        assert_eq!(monitors.keyword(), "text=\"monitors: filterwheel=0\"");

        monitors.set("filterwheel", Duration::ZERO, || std::future::ready(()));
        assert!(monitors.periods().is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_new_period_replaces_running_monitor() {
        let monitors = Monitors::new();
        let (first, poll) = counter();
        monitors.set("sources", Duration::from_millis(10), poll);
        let (second, poll) = counter();
        monitors.set("sources", Duration::from_secs(5), poll);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(first.load(Ordering::SeqCst) <= 1);
        // Only the immediate first tick of the slow monitor.
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(
            monitors.periods().get("sources"),
            Some(&Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_stop_all_and_drop_cancel_tasks() {
        let monitors = Monitors::new();
        let (count, poll) = counter();
        monitors.set("filterwheel", Duration::from_millis(10), poll);
        monitors.stop_all();
        assert_eq!(monitors.keyword(), "text=\"monitors: none\"");

        let (dropped, poll) = counter();
        {
            let scoped = Monitors::new();
            scoped.set("sources", Duration::from_millis(10), poll);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = (count.load(Ordering::SeqCst), dropped.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            (count.load(Ordering::SeqCst), dropped.load(Ordering::SeqCst)),
            settled
        );
    }
}
