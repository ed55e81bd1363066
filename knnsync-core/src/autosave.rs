//! Debounced autosave.
//!
//! Every mutation of the session's store calls
//! [`AutosaveScheduler::notify_mutation`]. A background task waits until no
//! mutation arrived for the debounce window, then saves once:
//!
//! ```text
//! Idle --notify--> Pending --deadline--> Saving --done--> Idle
//!                   ^   |                  |
//!                   +---+ notify           | notify: one follow-up save
//!                   re-arms                v
//!                                       Pending
//! ```
//!
//! Saves go through the model lock of the session, so a save started by
//! [`AutosaveScheduler::flush_now`] and one started by the timer never run at
//! the same time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::AutosaveConfig;
use crate::error::SyncResult;
use crate::router::SaveOutcome;
use crate::session::SessionContext;

/// Persists the dataset of a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatasetSaver: Send + Sync {
    async fn save(&self, session: &SessionContext) -> SyncResult<SaveOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Pending,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NotAdmin,
    EmptyStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Scheduled,
    Skipped(SkipReason),
}

#[derive(Debug)]
struct Timing {
    state: SchedulerState,
    deadline: Option<Instant>,
    saves_in_flight: usize,
}

impl Timing {
    fn begin_save(&mut self) {
        self.saves_in_flight += 1;
        self.state = SchedulerState::Saving;
        self.deadline = None;
    }

    fn end_save(&mut self) {
        self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
        if self.saves_in_flight > 0 {
            return;
        }
        self.state = if self.deadline.is_some() {
            SchedulerState::Pending
        } else {
            SchedulerState::Idle
        };
    }
}

struct Shared {
    timing: Mutex<Timing>,
    wake: Notify,
}

impl Shared {
    fn timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        // a panic while holding the lock leaves plain data behind
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Leaves the `Saving` state when dropped, whether the save finished,
/// failed or was cancelled.
struct SaveGuard<'a> {
    shared: &'a Shared,
}

impl<'a> SaveGuard<'a> {
    fn begin(shared: &'a Shared) -> Self {
        shared.timing().begin_save();
        Self { shared }
    }
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.shared.timing().end_save();
    }
}

pub struct AutosaveScheduler {
    shared: Arc<Shared>,
    saver: Arc<dyn DatasetSaver>,
    session: SessionContext,
    config: AutosaveConfig,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveScheduler {
    /// Starts the background task. Must be called inside a tokio runtime.
    pub fn spawn(
        saver: Arc<dyn DatasetSaver>,
        session: SessionContext,
        config: AutosaveConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            timing: Mutex::new(Timing {
                state: SchedulerState::Idle,
                deadline: None,
                saves_in_flight: 0,
            }),
            wake: Notify::new(),
        });
        let (tx, rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(shared.clone(), saver.clone(), session.clone(), rx));

        Self {
            shared,
            saver,
            session,
            config,
            stop: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.timing().state
    }

    async fn gate(&self) -> Option<SkipReason> {
        if !self.config.enabled {
            return Some(SkipReason::Disabled);
        }
        if !self.session.is_admin() {
            return Some(SkipReason::NotAdmin);
        }
        if self.session.store.read().await.dataset().total_examples() == 0 {
            return Some(SkipReason::EmptyStore);
        }
        None
    }

    /// Arms or re-arms the debounce timer.
    pub async fn notify_mutation(&self) -> Notification {
        if let Some(reason) = self.gate().await {
            debug!(reason = ?reason, "Autosave skipped");
            return Notification::Skipped(reason);
        }

        let deadline = Instant::now() + self.config.debounce;
        {
            let mut timing = self.shared.timing();
            timing.deadline = Some(deadline);
            if timing.state == SchedulerState::Idle {
                timing.state = SchedulerState::Pending;
            }
        }
        self.shared.wake.notify_one();
        Notification::Scheduled
    }

    /// Saves immediately, cancelling a pending debounced save.
    /// Returns `None` if the save was skipped.
    pub async fn flush_now(&self) -> SyncResult<Option<SaveOutcome>> {
        if let Some(reason) = self.gate().await {
            debug!(reason = ?reason, "Flush skipped");
            return Ok(None);
        }
        let guard = SaveGuard::begin(&self.shared);
        self.shared.wake.notify_one();

        let outcome = self.saver.save(&self.session).await;
        drop(guard);
        let outcome = outcome?;
        info!(version = outcome.version, backend = %outcome.backend, "Flushed dataset");
        Ok(Some(outcome))
    }

    /// Stops the background task. A pending save is dropped.
    pub async fn shutdown(&self) {
        let stop = self.stop.lock().ok().and_then(|mut s| s.take());
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.abort();
            }
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    saver: Arc<dyn DatasetSaver>,
    session: SessionContext,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let deadline = shared.timing().deadline;
        match deadline {
            None => {
                tokio::select! {
                    _ = shared.wake.notified() => continue,
                    _ = &mut stop => break,
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = shared.wake.notified() => continue,
                    _ = &mut stop => break,
                }
            }
        }

        {
            let timing = shared.timing();
            match timing.deadline {
                // re-armed or flushed while we slept
                Some(current) if current > Instant::now() => continue,
                None => continue,
                Some(_) => {}
            }
        }

        let guard = SaveGuard::begin(&shared);
        let result = saver.save(&session).await;
        drop(guard);
        match result {
            Ok(outcome) => info!(
                version = outcome.version,
                backend = %outcome.backend,
                bytes = outcome.size_bytes,
                "Autosaved dataset"
            ),
            Err(e) => warn!(error = %e, kind = e.kind(), "Autosave failed"),
        }
    }
    debug!("Autosave worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackendKind;
    use crate::dataset::Label;
    use crate::error::SyncError;
    use crate::session::Principal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    /// Counts saves; each save takes `delay`.
    struct CountingSaver {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingSaver {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DatasetSaver for CountingSaver {
        async fn save(&self, _session: &SessionContext) -> SyncResult<SaveOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SaveOutcome {
                version: call as u64,
                backend: BackendKind::Chunked,
                locator: None,
                size_bytes: 0,
                chunk_count: Some(1),
                warnings: Vec::new(),
            })
        }
    }

    async fn session(admin: bool, examples: usize) -> SessionContext {
        let session = SessionContext::new(Principal { admin }, 2);
        let label = Label::parse("cat").unwrap();
        let mut store = session.store.write().await;
        store.add_class(label.clone()).unwrap();
        for _ in 0..examples {
            store.capture(&label, vec![1.0, 2.0].into()).unwrap();
        }
        drop(store);
        session
    }

    fn config() -> AutosaveConfig {
        AutosaveConfig {
            enabled: true,
            debounce: DEBOUNCE,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_one_save() {
        let saver = CountingSaver::new(Duration::from_millis(10));
        let scheduler = AutosaveScheduler::spawn(saver.clone(), session(true, 1).await, config());

        for _ in 0..5 {
            assert_eq!(scheduler.notify_mutation().await, Notification::Scheduled);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(scheduler.state(), SchedulerState::Pending);
        assert_eq!(saver.calls(), 0);

        tokio::time::sleep(DEBOUNCE).await;
        assert_eq!(saver.calls(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_during_save_triggers_exactly_one_follow_up() {
        let saver = CountingSaver::new(Duration::from_secs(1));
        let scheduler = AutosaveScheduler::spawn(saver.clone(), session(true, 1).await, config());

        scheduler.notify_mutation().await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;
        assert_eq!(scheduler.state(), SchedulerState::Saving);

        for _ in 0..3 {
            scheduler.notify_mutation().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(scheduler.state(), SchedulerState::Saving);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(saver.calls(), 2);
        assert_eq!(saver.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_cancels_pending_save() {
        let saver = CountingSaver::new(Duration::from_millis(10));
        let scheduler = AutosaveScheduler::spawn(saver.clone(), session(true, 1).await, config());

        scheduler.notify_mutation().await;
        let outcome = scheduler.flush_now().await.unwrap();
        assert!(outcome.is_some());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(saver.calls(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reports_saving_while_in_flight() {
        let saver = CountingSaver::new(Duration::from_secs(1));
        let scheduler = Arc::new(AutosaveScheduler::spawn(
            saver.clone(),
            session(true, 1).await,
            config(),
        ));

        let flushing = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.flush_now().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.state(), SchedulerState::Saving);

        scheduler.notify_mutation().await;
        assert_eq!(scheduler.state(), SchedulerState::Saving);

        assert!(flushing.await.unwrap().unwrap().is_some());
        assert_eq!(scheduler.state(), SchedulerState::Pending);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(saver.calls(), 2);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_returns_to_idle() {
        let mut saver = MockDatasetSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Err(SyncError::Timeout("slow".to_string())));
        let scheduler = AutosaveScheduler::spawn(Arc::new(saver), session(true, 1).await, config());

        assert!(matches!(scheduler.flush_now().await, Err(SyncError::Timeout(_))));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates() {
        let saver = CountingSaver::new(Duration::ZERO);

        let viewer = AutosaveScheduler::spawn(saver.clone(), session(false, 1).await, config());
        assert_eq!(
            viewer.notify_mutation().await,
            Notification::Skipped(SkipReason::NotAdmin)
        );

        let empty = AutosaveScheduler::spawn(saver.clone(), session(true, 0).await, config());
        assert_eq!(
            empty.notify_mutation().await,
            Notification::Skipped(SkipReason::EmptyStore)
        );
        assert!(empty.flush_now().await.unwrap().is_none());

        let disabled = AutosaveScheduler::spawn(
            saver.clone(),
            session(true, 1).await,
            AutosaveConfig {
                enabled: false,
                debounce: DEBOUNCE,
            },
        );
        assert_eq!(
            disabled.notify_mutation().await,
            Notification::Skipped(SkipReason::Disabled)
        );

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(saver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_returns_to_idle() {
        let mut saver = MockDatasetSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Err(SyncError::Timeout("slow".to_string())));
        let scheduler = AutosaveScheduler::spawn(Arc::new(saver), session(true, 1).await, config());

        scheduler.notify_mutation().await;
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_save() {
        let saver = CountingSaver::new(Duration::ZERO);
        let scheduler = AutosaveScheduler::spawn(saver.clone(), session(true, 1).await, config());
        scheduler.notify_mutation().await;
        scheduler.shutdown().await;

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(saver.calls(), 0);
    }
}
