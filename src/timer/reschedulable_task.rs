use crate::timer::timer_service::{TimerRegistration, TimerService};
use async_trait::async_trait;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// The work done by a [ReschedulableTimerTask] when it fires.
#[async_trait]
pub trait TimerAction: Send + Sync + 'static {
    /// Returns the delay after which the task should fire again, or `None` if it is done.
    async fn on_timer(&self) -> Option<Duration>;
}

/// A cancellable, reschedulable unit of delayed work on a [TimerService].
///
/// At most one firing is pending at any time: scheduling a task that is already scheduled
///  replaces the previous fire time. Periodic or backoff behavior is expressed by the action's
///  return value, so an action never needs to reschedule its own task.
///
/// Cancellation is synchronous for pending firings. An action that is already running is not
///  interrupted, but it will not fire again after it returns. Dropping the task cancels it.
pub struct ReschedulableTimerTask {
    name: &'static str,
    timer_service: TimerService,
    action: Arc<dyn TimerAction>,
    state: Arc<Mutex<TaskState>>,
}

#[derive(Default)]
struct TaskState {
    /// incremented for every schedule / cancel, invalidating all previous firings
    generation: u64,
    fire_at: Option<Instant>,
    registration: Option<TimerRegistration>,
    running: bool,
}

impl Debug for ReschedulableTimerTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReschedulableTimerTask{{{}:{:?}}}", self.name, self.time_remaining())
    }
}

impl ReschedulableTimerTask {
    pub fn new(timer_service: &TimerService, name: &'static str, action: Arc<dyn TimerAction>) -> ReschedulableTimerTask {
        ReschedulableTimerTask {
            name,
            timer_service: timer_service.clone(),
            action,
            state: Default::default(),
        }
    }

    fn lock_state(state: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, delay: Duration) {
        self.schedule_at(Instant::now() + delay);
    }

    pub fn schedule_at(&self, fire_at: Instant) {
        let mut state = Self::lock_state(&self.state);
        state.generation += 1;
        if !state.running {
            if let Some(prev) = state.registration.take() {
                prev.cancel();
            }
        }
        state.fire_at = Some(fire_at);
        state.running = false;

        trace!("scheduling timer {} in {:?}", self.name, fire_at.saturating_duration_since(Instant::now()));
        let generation = state.generation;
        state.registration = Some(self.timer_service.spawn(Self::run(
            self.name,
            self.state.clone(),
            self.action.clone(),
            generation,
            fire_at,
        )));
    }

    pub fn cancel(&self) {
        let mut state = Self::lock_state(&self.state);
        state.generation += 1;
        state.fire_at = None;
        if state.running {
            // the running action completes, and its generation check prevents refiring
            state.running = false;
            state.registration = None;
        }
        else if let Some(registration) = state.registration.take() {
            trace!("cancelling timer {}", self.name);
            registration.cancel();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        Self::lock_state(&self.state).fire_at.is_some()
    }

    /// time until the next pending firing, `None` if no firing is pending
    pub fn time_remaining(&self) -> Option<Duration> {
        Self::lock_state(&self.state).fire_at
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    async fn run(name: &'static str, state: Arc<Mutex<TaskState>>, action: Arc<dyn TimerAction>, generation: u64, mut fire_at: Instant) {
        loop {
            sleep_until(fire_at).await;
            {
                let mut state = Self::lock_state(&state);
                if state.generation != generation {
                    return;
                }
                state.fire_at = None;
                state.running = true;
            }

            trace!("timer {} fired", name);
            let next_delay = action.on_timer().await;

            let mut state = Self::lock_state(&state);
            if state.generation != generation {
                return;
            }
            state.running = false;
            match next_delay {
                Some(delay) => {
                    fire_at = Instant::now() + delay;
                    state.fire_at = Some(fire_at);
                }
                None => {
                    state.registration = None;
                    return;
                }
            }
        }
    }
}

impl Drop for ReschedulableTimerTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct CountingAction {
        count: AtomicUsize,
        repeat: Option<(usize, Duration)>,
    }
    impl CountingAction {
        fn once() -> Arc<CountingAction> {
            Arc::new(CountingAction { count: AtomicUsize::new(0), repeat: None })
        }
        fn repeating(times: usize, period: Duration) -> Arc<CountingAction> {
            Arc::new(CountingAction { count: AtomicUsize::new(0), repeat: Some((times, period)) })
        }
        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }
    #[async_trait]
    impl TimerAction for CountingAction {
        async fn on_timer(&self) -> Option<Duration> {
            let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            match self.repeat {
                Some((times, period)) if count < times => Some(period),
                _ => None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::once();
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        assert!(!task.is_scheduled());
        task.schedule(Duration::from_millis(100));
        assert!(task.is_scheduled());
        assert_eq!(task.time_remaining(), Some(Duration::from_millis(100)));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(task.time_remaining(), Some(Duration::from_millis(50)));
        assert_eq!(action.count(), 0);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(action.count(), 1);
        assert!(!task.is_scheduled());
        assert_eq!(task.time_remaining(), None);
        assert_eq!(service.num_registered(), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(action.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_fire_time() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::once();
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::from_millis(100));
        task.schedule(Duration::from_millis(300));
        assert_eq!(service.num_registered(), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(action.count(), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(action.count(), 1);

        task.schedule(Duration::from_millis(10));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(action.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::once();
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::from_millis(100));
        task.cancel();
        assert!(!task.is_scheduled());
        assert_eq!(service.num_registered(), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(action.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::repeating(3, Duration::from_millis(100));
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::ZERO);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(action.count(), 1);
        assert!(task.is_scheduled());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(action.count(), 2);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(action.count(), 3);
        assert!(!task.is_scheduled());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(action.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_repeating() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::repeating(100, Duration::from_millis(100));
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::ZERO);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(action.count(), 2);

        task.cancel();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(action.count(), 2);
        assert_eq!(service.num_registered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::once();
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::from_millis(100));
        drop(task);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(action.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_shutdown() {
        let service = TimerService::for_current_runtime();
        let action = CountingAction::once();
        let task = ReschedulableTimerTask::new(&service, "test", action.clone());

        task.schedule(Duration::from_millis(100));
        service.shutdown();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(action.count(), 0);
    }
}
