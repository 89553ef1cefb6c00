//! Polling with exponential backoff for asynchronous remote resources
//!
//! The load-balancing API accepts a mutation and transitions the resource in
//! the background, so every mutation is followed by a poll until the resource
//! settles. Sleeps race against a [`CancellationToken`] so a shutting-down
//! controller never sits out a full backoff schedule.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lbaas::ResourceKind;

/// Bounded exponential backoff schedule
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: f64,
    /// Number of probes before giving up
    pub steps: u32,
}

impl Backoff {
    /// Roughly two minutes of waiting for a resource to become ACTIVE
    pub const ACTIVATION: Backoff = Backoff {
        initial_delay: Duration::from_secs(1),
        factor: 1.2,
        steps: 19,
    };

    /// Roughly thirty seconds of waiting for a deletion to be confirmed
    pub const DELETION: Backoff = Backoff {
        initial_delay: Duration::from_secs(1),
        factor: 1.2,
        steps: 11,
    };

    /// Sum of all sleeps of the schedule
    pub fn total_wait(&self) -> Duration {
        self.delays().sum()
    }

    fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.steps.saturating_sub(1))
            .map(move |i| self.initial_delay.mul_f64(self.factor.powi(i as i32)))
    }
}

/// Outcome of a single probe
#[derive(Debug)]
pub enum Progress<T> {
    /// The resource reached its target state
    Ready(T),
    /// Still transitioning; carries the status observed
    Pending(String),
}

/// Poll `probe` until it reports [`Progress::Ready`]
///
/// Transient errors from the probe are logged and retried within the step
/// budget. Any other error ends the wait immediately. Exhausting the budget
/// yields [`Error::Timeout`] carrying the last status seen.
pub async fn wait_until<T, F, Fut>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    kind: ResourceKind,
    id: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let mut delay = backoff.initial_delay;
    let mut last_status = String::from("UNKNOWN");

    for step in 1..=backoff.steps {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match probe().await {
            Ok(Progress::Ready(value)) => return Ok(value),
            Ok(Progress::Pending(status)) => {
                debug!("Waiting for {} {}: status {} (step {})", kind, id, status, step);
                last_status = status;
            }
            Err(e) if e.is_transient() => {
                warn!("Transient error while waiting for {} {}: {}", kind, id, e);
                last_status = e.to_string();
            }
            Err(e) => return Err(e),
        }

        if step == backoff.steps {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = delay.mul_f64(backoff.factor);
    }

    Err(Error::Timeout {
        kind,
        id: id.to_string(),
        status: last_status,
    })
}
