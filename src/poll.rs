// Periodic refresh driver.
// While running and in the foreground, calls the target once per interval.
// Cycles run inline in a single task, so a slow cycle delays the next tick
// instead of overlapping with it; ticks missed meanwhile are skipped.

use async_trait::async_trait;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[async_trait]
pub trait PollTarget: Send + Sync {
    /// One refresh cycle. Errors are the target's business; the loop keeps going.
    async fn poll_cycle(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Stopped,
    Running,
}

pub struct PollLoop {
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    live: Arc<AtomicBool>,
    foreground: watch::Sender<bool>,
    wake: Arc<Notify>,
    cycles: Arc<AtomicU64>,
}

impl PollLoop {
    pub fn new(period: Duration) -> Self {
        let (foreground, _) = watch::channel(true);
        Self {
            period,
            task: Mutex::new(None),
            live: Arc::new(AtomicBool::new(false)),
            foreground,
            wake: Arc::new(Notify::new()),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> PollState {
        if self.live.load(Ordering::SeqCst) {
            PollState::Running
        } else {
            PollState::Stopped
        }
    }

    /// False once the loop was stopped; results of a cycle that was in
    /// flight at that point must be dropped.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Completed cycles since creation
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Start polling `target`. The first cycle runs immediately. No-op if
    /// already running.
    pub fn start(&self, target: Arc<dyn PollTarget>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            debug!("Poll loop already running");
            return;
        }
        self.live.store(true, Ordering::SeqCst);

        let period = self.period;
        let live = self.live.clone();
        let wake = self.wake.clone();
        let cycles = self.cycles.clone();
        let mut foreground = self.foreground.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Poll loop started, every {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {
                        debug!("Out-of-band refresh requested");
                    }
                    changed = foreground.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *foreground.borrow() {
                            debug!("Back in foreground, refreshing now");
                            ticker.reset();
                        }
                    }
                }

                if !live.load(Ordering::SeqCst) {
                    break;
                }
                if !*foreground.borrow() {
                    continue;
                }

                target.poll_cycle().await;
                cycles.fetch_add(1, Ordering::SeqCst);
            }
            debug!("Poll loop task exiting");
        }));
    }

    /// Stop polling. Safe to call when already stopped.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            info!("Poll loop stopped");
        }
    }

    /// Pause while hidden; becoming visible again triggers an immediate cycle
    pub fn set_foreground(&self, visible: bool) {
        self.foreground.send_if_modified(|current| {
            if *current == visible {
                return false;
            }
            *current = visible;
            true
        });
    }

    pub fn is_foreground(&self) -> bool {
        *self.foreground.borrow()
    }

    /// Run a cycle as soon as the current one (if any) finishes
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        started: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        work: Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl PollTarget for Counter {
        async fn poll_cycle(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let work = *self.work.lock().unwrap();
            if let Some(work) = work {
                tokio::time::sleep(work).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn started(counter: &Counter) -> usize {
        counter.started.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval_while_running() {
        let counter = Arc::new(Counter::default());
        let poll = PollLoop::new(Duration::from_secs(2));
        assert_eq!(poll.state(), PollState::Stopped);

        poll.start(counter.clone());
        assert_eq!(poll.state(), PollState::Running);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(started(&counter), 3);

        poll.stop();
        assert_eq!(poll.state(), PollState::Stopped);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(started(&counter), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_never_overlap() {
        let counter = Arc::new(Counter::default());
        *counter.work.lock().unwrap() = Some(Duration::from_secs(5));
        let poll = PollLoop::new(Duration::from_secs(2));
        poll.start(counter.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        poll.stop();

        assert_eq!(counter.max_running.load(Ordering::SeqCst), 1);
        assert!(started(&counter) <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_pauses_and_refocus_refreshes_immediately() {
        let counter = Arc::new(Counter::default());
        let poll = PollLoop::new(Duration::from_secs(2));
        poll.start(counter.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started(&counter), 1);

        poll.set_foreground(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(started(&counter), 1);

        poll.set_foreground(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(started(&counter), 2);
        poll.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_refresh_runs_out_of_band() {
        let counter = Arc::new(Counter::default());
        let poll = PollLoop::new(Duration::from_secs(60));
        poll.start(counter.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started(&counter), 1);

        poll.request_refresh();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started(&counter), 2);
        assert_eq!(poll.cycles(), 2);
        poll.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_a_no_op() {
        let counter = Arc::new(Counter::default());
        let poll = PollLoop::new(Duration::from_secs(2));
        poll.start(counter.clone());
        poll.start(counter.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started(&counter), 1);
        poll.stop();
        poll.stop();
    }
}
