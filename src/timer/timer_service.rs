use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// The timer facility shared by all timer tasks of a gateway (or several gateways). There is no
///  process-wide instance: a service is created explicitly and passed to the components using it,
///  so tests can run isolated services side by side.
///
/// Scheduled work runs as tokio tasks on the service's runtime. Every task registers with the
///  service while it is pending and deregisters when it completes or is cancelled, so
///  [TimerService::shutdown] can cancel everything that is still outstanding.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<TimerServiceInner>,
}

struct TimerServiceInner {
    runtime: Handle,
    next_id: AtomicU64,
    registered: Mutex<FxHashMap<u64, AbortHandle>>,
}

impl Debug for TimerService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerService{{registered:{}}}", self.num_registered())
    }
}

impl TimerService {
    pub fn new(runtime: Handle) -> TimerService {
        TimerService {
            inner: Arc::new(TimerServiceInner {
                runtime,
                next_id: AtomicU64::new(0),
                registered: Default::default(),
            }),
        }
    }

    /// NB: panics if called outside a tokio runtime
    pub fn for_current_runtime() -> TimerService {
        Self::new(Handle::current())
    }

    fn lock_registered(&self) -> MutexGuard<'_, FxHashMap<u64, AbortHandle>> {
        self.inner.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn spawn<F>(&self, fut: F) -> TimerRegistration
    where F: Future<Output = ()> + Send + 'static
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // registration happens under the lock so that the wrapper's deregistration can not
        //  overtake it
        let mut registered = self.lock_registered();
        let inner = self.inner.clone();
        let handle = self.inner.runtime.spawn(async move {
            fut.await;
            inner.registered.lock().unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
        registered.insert(id, handle.abort_handle());
        trace!("registered timer #{}", id);

        TimerRegistration {
            id,
            service: self.clone(),
        }
    }

    /// number of timer tasks that are currently scheduled or running
    pub fn num_registered(&self) -> usize {
        self.lock_registered().len()
    }

    /// Cancels all outstanding timer tasks. Tasks that are running at the time of the call are
    ///  aborted at their next suspension point.
    pub fn shutdown(&self) {
        let drained = self.lock_registered()
            .drain()
            .collect::<Vec<_>>();
        debug!("shutting down timer service, cancelling {} timers", drained.len());
        for (_, handle) in drained {
            handle.abort();
        }
    }
}

/// A timer task's handle to its registration with the [TimerService]
pub(crate) struct TimerRegistration {
    id: u64,
    service: TimerService,
}

impl TimerRegistration {
    pub fn cancel(self) {
        if let Some(handle) = self.service.lock_registered().remove(&self.id) {
            trace!("cancelling timer #{}", self.id);
            handle.abort();
        }
    }
}
