//! # Repeater
//!
//! Runs a task on a fixed interval from a background tokio task.
//!
//! The loop selects between three signals:
//!
//! - the interval tick, for scheduled runs
//! - a [`Notify`] permit from [`Repeater::force`], for an immediate out-of-band run
//! - a [`CancellationToken`] from [`Repeater::stop`], which ends the loop
//!
//! Forces that arrive while a run is in progress collapse into a single follow-up run.
//! Every run gets a [`Context`] derived from the stop token, so stopping also aborts a
//! run that is still in flight. Failures are logged and counted; they never end the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::context::Context;
use crate::core::error::BalancerResult;
use crate::observability::metrics::{REPEATER_FORCED_TOTAL, REPEATER_RUNS_TOTAL};

#[derive(Debug, Clone)]
pub struct RepeaterOptions {
    /// Name used in logs and metric labels
    pub name: String,
}

impl RepeaterOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for RepeaterOptions {
    fn default() -> Self {
        Self::named("repeater")
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Tick,
    Force,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Tick => "tick",
            Trigger::Force => "force",
        }
    }
}

/// Handle to a background periodic task
#[derive(Debug)]
pub struct Repeater {
    name: String,
    force: Arc<Notify>,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Repeater {
    /// Spawn the loop. The first scheduled run happens one `interval` from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(interval: Duration, task: F, options: RepeaterOptions) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BalancerResult<()>> + Send + 'static,
    {
        let force = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        let name = options.name;

        let handle = tokio::spawn(run_loop(
            name.clone(),
            interval,
            task,
            force.clone(),
            stop.clone(),
        ));

        Self {
            name,
            force,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request an immediate run without waiting for the next tick
    pub fn force(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        counter!(REPEATER_FORCED_TOTAL, "name" => self.name.clone()).increment(1);
        self.force.notify_one();
    }

    /// Stop the loop; calling it again has no effect
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(repeater = %self.name, "Stopping repeater");
            self.stop.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait until the background loop has exited
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Repeater {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_loop<F, Fut>(
    name: String,
    interval: Duration,
    task: F,
    force: Arc<Notify>,
    stop: CancellationToken,
) where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BalancerResult<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(repeater = %name, interval_ms = interval.as_millis() as u64, "Repeater started");

    loop {
        let trigger = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = force.notified() => Trigger::Force,
            _ = ticker.tick() => Trigger::Tick,
        };

        if let Trigger::Force = trigger {
            ticker.reset();
        }

        let ctx = Context::from_token(stop.child_token());
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = task(ctx) => result,
        };

        counter!(
            REPEATER_RUNS_TOTAL,
            "name" => name.clone(),
            "trigger" => trigger.as_str(),
            "outcome" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);

        match result {
            Ok(()) => debug!(repeater = %name, trigger = trigger.as_str(), "Repeater run completed"),
            Err(e) => warn!(repeater = %name, trigger = trigger.as_str(), error = %e, "Repeater run failed"),
        }
    }

    debug!(repeater = %name, "Repeater stopped");
}
