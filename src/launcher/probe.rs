//! Readiness polling with exponential backoff

use crate::plan::spec::ProbeOverrides;
use crate::plan::Readiness;
use crate::runtime::{ContainerRuntime, InstanceHandle};
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline used when the budget does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Retry policy for readiness probes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbePolicy {
    /// Probes performed before giving up
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Cap on a single delay
    pub max_delay: Duration,
    /// Total wall-clock budget for one service
    pub timeout: Duration,
    /// Randomize each delay by up to 10% either way
    pub jitter: bool,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
            jitter: true,
        }
    }
}

impl ProbePolicy {
    /// Apply a service's overrides
    pub fn with_overrides(&self, overrides: &ProbeOverrides) -> Self {
        let mut policy = *self;
        if let Some(base) = overrides.base_delay {
            policy.base_delay = base;
        }
        if let Some(attempts) = overrides.max_attempts {
            policy.max_attempts = attempts.max(1);
        }
        if let Some(extra) = overrides.extra_budget {
            policy.timeout = policy.timeout.saturating_add(extra);
        }
        policy
    }

    /// Delay before attempt `attempt` (1-based), without jitter.
    /// The first attempt runs immediately.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi((attempt - 2) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        delay.mul_f64(factor)
    }
}

/// How polling ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { attempts: u32 },
    Exhausted { attempts: u32, waited: Duration },
    Cancelled { attempts: u32 },
}

/// Poll `instance` until it reports ready, the policy runs out, or
/// `cancel` fires. Probe errors count as failed attempts.
pub async fn wait_until_ready(
    runtime: &dyn ContainerRuntime,
    instance: &InstanceHandle,
    readiness: &Readiness,
    policy: &ProbePolicy,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let started = Instant::now();
    let deadline = started
        .checked_add(policy.timeout)
        .unwrap_or_else(|| started + FAR_FUTURE);
    let mut attempts = 0;

    loop {
        if attempts > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let delay = policy.jittered(policy.delay_for(attempts + 1)).min(remaining);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled { attempts },
                _ = sleep(delay) => {}
            }
        }

        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let check = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled { attempts },
            r = timeout(remaining, runtime.probe_ready(instance, readiness)) => r,
        };

        match check {
            Ok(Ok(true)) => return ProbeOutcome::Ready { attempts },
            Ok(Ok(false)) => {
                debug!("{} not ready ({}), attempt {}", instance, readiness, attempts);
            }
            Ok(Err(e)) => {
                warn!("Probe of {} failed on attempt {}: {}", instance, attempts, e);
            }
            Err(_) => {
                debug!("Probe of {} ran past the wait budget", instance);
            }
        }

        if attempts >= policy.max_attempts {
            break;
        }
    }

    ProbeOutcome::Exhausted {
        attempts,
        waited: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    fn instance(service: &str) -> InstanceHandle {
        InstanceHandle {
            id: format!("fake-{}", service),
            service: service.to_string(),
        }
    }

    fn no_jitter() -> ProbePolicy {
        ProbePolicy {
            jitter: false,
            ..ProbePolicy::default()
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(7), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ProbePolicy::default();
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_overrides() {
        let policy = no_jitter().with_overrides(&ProbeOverrides {
            base_delay: Some(Duration::from_millis(100)),
            max_attempts: Some(0),
            extra_budget: Some(Duration::from_secs(30)),
        });
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.timeout, Duration::from_secs(150));
    }

    #[test]
    fn test_overrides_saturate() {
        let policy = no_jitter().with_overrides(&ProbeOverrides {
            extra_budget: Some(Duration::MAX),
            ..ProbeOverrides::default()
        });
        assert_eq!(policy.timeout, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_still_polls() {
        let runtime = FakeRuntime::new().ready_after("db", 2);
        let policy = ProbePolicy {
            timeout: Duration::MAX,
            ..no_jitter()
        };
        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Running,
            &policy,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Ready { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_retries() {
        let runtime = FakeRuntime::new().ready_after("db", 3);
        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Running,
            &no_jitter(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Ready { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let runtime = FakeRuntime::new().never_ready("db");
        let policy = ProbePolicy {
            max_attempts: 4,
            ..no_jitter()
        };
        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Running,
            &policy,
            &CancellationToken::new(),
        )
        .await;

        match outcome {
            ProbeOutcome::Exhausted { attempts, waited } => {
                assert_eq!(attempts, 4);
                // 500 + 1000 + 2000
                assert!(waited >= Duration::from_millis(3500));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_budget_bounds_attempts() {
        let runtime = FakeRuntime::new().never_ready("db");
        let policy = ProbePolicy {
            timeout: Duration::from_secs(5),
            ..no_jitter()
        };
        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Running,
            &policy,
            &CancellationToken::new(),
        )
        .await;

        match outcome {
            ProbeOutcome::Exhausted { attempts, waited } => {
                assert!(attempts < policy.max_attempts);
                assert!(waited <= Duration::from_secs(6));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_count_as_attempts() {
        let runtime = FakeRuntime::new().probe_errors("db");
        let policy = ProbePolicy {
            max_attempts: 2,
            ..no_jitter()
        };
        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Healthcheck,
            &policy,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, ProbeOutcome::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let runtime = FakeRuntime::new().never_ready("db");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let outcome = wait_until_ready(
            &runtime,
            &instance("db"),
            &Readiness::Running,
            &no_jitter(),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, ProbeOutcome::Cancelled { .. }));
    }
}
