//! Drive a [`PeriodicTask`] from a tokio runtime.
//!
//! The scalers themselves never sleep or spawn. [`TaskHandle::spawn`] moves a
//! task behind a mutex and runs a tokio task that sleeps until
//! [`PeriodicTask::poll_timeout`] and then calls
//! [`PeriodicTask::handle_timeout`]. Frames are reported through
//! [`TaskHandle::with`] so they are serialized with the checks.
//!
//! ```no_run
//! # async fn run() {
//! use std::sync::Arc;
//! use quality_scaler::{BandwidthQualityScaler, BandwidthScalerResource, ScalerConfig};
//! use quality_scaler::{DataSize, ResourceListener, ResourceListenerResponse, ResourceUsageState};
//! use quality_scaler::runtime::TaskHandle;
//!
//! struct Log;
//!
//! impl ResourceListener for Log {
//!     fn on_resource_usage_state_measured(
//!         &self,
//!         resource: &str,
//!         state: ResourceUsageState,
//!     ) -> ResourceListenerResponse {
//!         println!("{resource}: {state:?}");
//!         ResourceListenerResponse::Nothing
//!     }
//! }
//!
//! let resource = Arc::new(BandwidthScalerResource::new("bandwidth", Arc::new(Log)));
//! let now = tokio::time::Instant::now().into_std();
//! let scaler = BandwidthQualityScaler::new(ScalerConfig::default(), resource, now);
//! let handle = TaskHandle::spawn(scaler);
//!
//! // For every encoded frame.
//! let sent = tokio::time::Instant::now().into_std();
//! handle.with(|s| s.report_encode_info(DataSize::bytes(2500), sent, 640, 360));
//!
//! // Dropping the handle stops the checks.
//! drop(handle);
//! # }
//! ```

use std::future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

use crate::PeriodicTask;

pub use tokio_util::sync::CancellationToken;

/// Owner of a [`PeriodicTask`] driven by a tokio task.
///
/// Dropping the handle cancels the driver. A check that is already due when
/// that happens does not run.
///
/// The task is locked while [`PeriodicTask::handle_timeout`] runs, and so are
/// the handlers and listeners it calls. Those must not call
/// [`TaskHandle::with`] on the same handle, that deadlocks. Hand the work off
/// to another task instead.
pub struct TaskHandle<T> {
    task: Arc<Mutex<T>>,
    wake: Arc<Notify>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl<T> TaskHandle<T>
where
    T: PeriodicTask + Send + 'static,
{
    /// Start driving `task`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(task: T) -> Self {
        let task = Arc::new(Mutex::new(task));
        let wake = Arc::new(Notify::new());
        let token = CancellationToken::new();

        let join = tokio::spawn(drive(
            Arc::downgrade(&task),
            wake.clone(),
            token.clone(),
        ));

        TaskHandle {
            task,
            wake,
            token,
            join,
        }
    }

    /// Access the task, for instance to report a frame.
    ///
    /// The driver re-reads the next timeout afterwards. Must not be called
    /// from within a handler of the task itself.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let r = {
            let mut task = self.task.lock();
            f(&mut task)
        };
        self.wake.notify_one();
        r
    }

    /// Stop driving the task. The task itself stays accessible.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The token stopping this driver.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the driver has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn drive<T: PeriodicTask>(
    task: Weak<Mutex<T>>,
    wake: Arc<Notify>,
    token: CancellationToken,
) {
    trace!("Periodic task driver started");

    loop {
        let Some(deadline) = next_deadline(&task) else {
            break;
        };

        let sleep = async {
            match deadline {
                Some(d) => time::sleep_until(time::Instant::from_std(d)).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = wake.notified() => continue,
            _ = sleep => {}
        }

        if !fire(&task, &token, time::Instant::now().into_std()) {
            break;
        }
    }

    trace!("Periodic task driver stopped");
}

/// `None` if the task is gone.
fn next_deadline<T: PeriodicTask>(task: &Weak<Mutex<T>>) -> Option<Option<Instant>> {
    let task = task.upgrade()?;
    let deadline = task.lock().poll_timeout();
    Some(deadline)
}

/// Run a due check. Returns `false` if the driver should stop.
fn fire<T: PeriodicTask>(task: &Weak<Mutex<T>>, token: &CancellationToken, now: Instant) -> bool {
    if token.is_cancelled() {
        return false;
    }
    let Some(task) = task.upgrade() else {
        return false;
    };
    task.lock().handle_timeout(now);
    true
}
