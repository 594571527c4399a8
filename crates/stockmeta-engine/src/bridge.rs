use std::thread;
use std::time::{Duration, Instant};

use stockmeta_contracts::metadata::MetadataRecord;
use stockmeta_contracts::target::{AssetReference, TargetId};
use thiserror::Error;

use crate::error::AutomationError;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The instruction never reached the page, usually because it was
    /// navigating at the time.
    #[error("page message undeliverable: {0}")]
    Undeliverable(String),
    #[error("required page elements missing: {0}")]
    FieldsMissing(String),
    #[error("page unreachable: {0}")]
    Unreachable(String),
}

/// Content-side collaborator that can look at and act on a target page.
///
/// Implementations block the calling thread; the runtime only calls them from
/// worker threads.
pub trait PageBridge: Send + Sync {
    /// One look for a usable image reference. `Ok(None)` means not rendered
    /// yet.
    fn probe_asset(&self, target: TargetId) -> Result<Option<AssetReference>, BridgeError>;

    /// Enters `record` into the page form so the page's own handlers react,
    /// then dispatches submit. The submit outcome arrives separately.
    fn fill_and_submit(&self, target: TargetId, record: &MetadataRecord)
        -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollPolicy {
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_millis() / self.interval.as_millis().max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    Exhausted { attempts: u32 },
    Probe(E),
}

/// Time source for [`poll_until`]. Probe time counts against the window too.
pub trait PollClock {
    fn elapsed(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall clock started when the wait begins.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl PollClock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Bounded retry loop. Calls `probe` until it yields a value, at most
/// `policy.max_attempts()` times and never after `policy.timeout` has
/// elapsed on `clock`. Probe errors end the loop immediately.
pub fn poll_until<T, E>(
    policy: &PollPolicy,
    clock: &impl PollClock,
    mut probe: impl FnMut(u32) -> Result<Option<T>, E>,
) -> Result<T, PollError<E>> {
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(found) = probe(attempt).map_err(PollError::Probe)? {
            return Ok(found);
        }
        let elapsed = clock.elapsed();
        if attempt >= max_attempts || elapsed >= policy.timeout {
            return Err(PollError::Exhausted { attempts: attempt });
        }
        clock.sleep(policy.interval.min(policy.timeout - elapsed));
    }
}

/// Waits for the target's image to render and returns its reference.
pub fn wait_for_asset(
    bridge: &dyn PageBridge,
    target: TargetId,
    policy: &PollPolicy,
    clock: &impl PollClock,
) -> Result<AssetReference, AutomationError> {
    poll_until(policy, clock, |attempt| {
        tracing::trace!(target_id = %target, attempt, "probing page for image");
        bridge.probe_asset(target)
    })
    .map_err(|err| match err {
        PollError::Exhausted { .. } => AutomationError::AssetNotFound,
        PollError::Probe(BridgeError::FieldsMissing(_)) => AutomationError::AssetNotFound,
        PollError::Probe(BridgeError::Unreachable(_) | BridgeError::Undeliverable(_)) => {
            AutomationError::NoQualifyingTarget
        }
    })
}
