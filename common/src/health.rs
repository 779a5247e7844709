// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The health gate: start a service once, then poll it until it reports
//! healthy or a fixed retry budget runs out.
//!
//! Unlike the exponential backoff used for internal service discovery, the
//! gate has a hard upper bound on how long it can wait
//! ([`HealthCheckPolicy::max_wait`]).  Exhausting the budget is reported as
//! [`HealthOutcome::TimedOut`]; it is never treated as success.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use slog::{debug, info, warn, Logger};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Timing parameters for one health gate.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckPolicy {
    /// How long to wait after the start action before the first poll.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "grace_period_secs")]
    pub grace_period: Duration,

    /// How long to wait between two consecutive polls.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "poll_interval_secs")]
    pub poll_interval: Duration,

    /// Number of polls before giving up.
    pub retries: u32,

    /// Upper bound on a single poll.  A probe that takes longer counts as an
    /// unhealthy poll.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "probe_timeout_secs")]
    pub probe_timeout: Duration,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    #[error("health check retries must be at least 1")]
    NoRetries,
    #[error("health check poll interval must be non-zero")]
    ZeroPollInterval,
    #[error("health check probe timeout must be non-zero")]
    ZeroProbeTimeout,
}

impl HealthCheckPolicy {
    pub const fn new(
        grace_period: Duration,
        poll_interval: Duration,
        retries: u32,
        probe_timeout: Duration,
    ) -> Self {
        Self { grace_period, poll_interval, retries, probe_timeout }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.retries == 0 {
            return Err(PolicyError::NoRetries);
        }
        if self.poll_interval.is_zero() {
            return Err(PolicyError::ZeroPollInterval);
        }
        if self.probe_timeout.is_zero() {
            return Err(PolicyError::ZeroProbeTimeout);
        }
        Ok(())
    }

    /// The longest [`wait_until_healthy`] can take once the start action has
    /// returned: the grace period, every poll hitting its timeout, and an
    /// interval between each pair of polls.
    pub fn max_wait(&self) -> Duration {
        let polls = self.probe_timeout.saturating_mul(self.retries);
        let gaps =
            self.poll_interval.saturating_mul(self.retries.saturating_sub(1));
        self.grace_period.saturating_add(polls).saturating_add(gaps)
    }
}

/// How a health gate resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The probe reported healthy on poll number `polls` (1-based).
    Healthy { polls: u32 },
    /// Every one of the `polls` polls came back unhealthy.
    TimedOut { polls: u32 },
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy { .. })
    }

    pub fn polls(&self) -> u32 {
        match self {
            HealthOutcome::Healthy { polls }
            | HealthOutcome::TimedOut { polls } => *polls,
        }
    }
}

/// Runs `start` exactly once, waits out the policy's grace period, then calls
/// `probe` up to `policy.retries` times until it returns `Ok(true)`.
///
/// An error from `start` aborts the gate immediately and is returned as is;
/// the probe is never called in that case.  Probe errors and probes that
/// exceed `policy.probe_timeout` are logged and counted as unhealthy polls.
/// There is no sleep after the final poll, so a gate that times out returns
/// as soon as its last poll resolves.
pub async fn wait_until_healthy<E, S, SFut, P, PFut, PE>(
    log: &Logger,
    policy: &HealthCheckPolicy,
    start: S,
    mut probe: P,
) -> Result<HealthOutcome, E>
where
    S: FnOnce() -> SFut,
    SFut: Future<Output = Result<(), E>>,
    P: FnMut() -> PFut,
    PFut: Future<Output = Result<bool, PE>>,
    PE: Display,
{
    start().await?;
    debug!(log, "start action returned; waiting out grace period";
        "grace_period" => ?policy.grace_period);
    tokio::time::sleep(policy.grace_period).await;

    for poll in 1..=policy.retries {
        match tokio::time::timeout(policy.probe_timeout, probe()).await {
            Ok(Ok(true)) => {
                info!(log, "health check passed"; "poll" => poll);
                return Ok(HealthOutcome::Healthy { polls: poll });
            }
            Ok(Ok(false)) => {
                debug!(log, "not healthy yet";
                    "poll" => poll, "retries" => policy.retries);
            }
            Ok(Err(error)) => {
                warn!(log, "health probe failed";
                    "poll" => poll, "error" => %error);
            }
            Err(_) => {
                warn!(log, "health probe timed out";
                    "poll" => poll, "timeout" => ?policy.probe_timeout);
            }
        }
        if poll < policy.retries {
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    warn!(log, "health check retry budget exhausted";
        "retries" => policy.retries);
    Ok(HealthOutcome::TimedOut { polls: policy.retries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use slog::o;
    use std::cell::Cell;
    use tokio::time::Instant;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn policy() -> HealthCheckPolicy {
        HealthCheckPolicy::new(
            Duration::from_secs(90),
            Duration::from_secs(5),
            3,
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_on_first_poll_only_waits_grace_period() {
        let policy = policy();
        let starts = Cell::new(0);
        let probes = Cell::new(0);
        let began = Instant::now();

        let outcome = wait_until_healthy::<String, _, _, _, _, String>(
            &log(),
            &policy,
            || async {
                starts.set(starts.get() + 1);
                Ok(())
            },
            || async {
                probes.set(probes.get() + 1);
                Ok(true)
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, HealthOutcome::Healthy { polls: 1 });
        assert_eq!(starts.get(), 1);
        assert_eq!(probes.get(), 1);
        assert_eq!(began.elapsed(), policy.grace_period);
    }

    #[tokio::test(start_paused = true)]
    async fn never_healthy_polls_exactly_retries_times() {
        for retries in [1, 3, 7] {
            let policy = HealthCheckPolicy { retries, ..policy() };
            let probes = Cell::new(0);
            let began = Instant::now();

            let outcome = wait_until_healthy::<String, _, _, _, _, String>(
                &log(),
                &policy,
                || async { Ok(()) },
                || async {
                    probes.set(probes.get() + 1);
                    Ok(false)
                },
            )
            .await
            .unwrap();

            assert_eq!(outcome, HealthOutcome::TimedOut { polls: retries });
            assert!(!outcome.is_healthy());
            assert_eq!(probes.get(), retries);
            assert_eq!(
                began.elapsed(),
                policy.grace_period + policy.poll_interval * (retries - 1)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_after_a_few_polls() {
        let policy = HealthCheckPolicy { retries: 5, ..policy() };
        let probes = Cell::new(0);
        let began = Instant::now();

        let outcome = wait_until_healthy::<String, _, _, _, _, String>(
            &log(),
            &policy,
            || async { Ok(()) },
            || async {
                probes.set(probes.get() + 1);
                Ok(probes.get() == 3)
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, HealthOutcome::Healthy { polls: 3 });
        assert_eq!(outcome.polls(), 3);
        assert_eq!(
            began.elapsed(),
            policy.grace_period + policy.poll_interval * 2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_aborts_without_probing() {
        let probes = Cell::new(0);
        let began = Instant::now();

        let result = wait_until_healthy::<String, _, _, _, _, String>(
            &log(),
            &policy(),
            || async { Err("container failed to start".to_string()) },
            || async {
                probes.set(probes.get() + 1);
                Ok(true)
            },
        )
        .await;

        assert_matches!(result, Err(e) if e == "container failed to start");
        assert_eq!(probes.get(), 0);
        assert_eq!(began.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_count_as_unhealthy() {
        let policy = policy();
        let probes = Cell::new(0);

        let outcome = wait_until_healthy::<String, _, _, _, _, String>(
            &log(),
            &policy,
            || async { Ok(()) },
            || async {
                probes.set(probes.get() + 1);
                if probes.get() < 3 {
                    Err("connection reset".to_string())
                } else {
                    Ok(true)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, HealthOutcome::Healthy { polls: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_is_bounded_by_max_wait() {
        let policy = policy();
        let began = Instant::now();

        let outcome = wait_until_healthy::<String, _, _, _, _, String>(
            &log(),
            &policy,
            || async { Ok(()) },
            || std::future::pending::<Result<bool, String>>(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, HealthOutcome::TimedOut { polls: 3 });
        assert_eq!(began.elapsed(), policy.max_wait());
        assert_eq!(policy.max_wait(), Duration::from_secs(90 + 3 * 10 + 2 * 5));
    }

    #[test]
    fn policy_validation() {
        assert_eq!(policy().validate(), Ok(()));
        assert_eq!(
            HealthCheckPolicy { retries: 0, ..policy() }.validate(),
            Err(PolicyError::NoRetries)
        );
        assert_eq!(
            HealthCheckPolicy { poll_interval: Duration::ZERO, ..policy() }
                .validate(),
            Err(PolicyError::ZeroPollInterval)
        );
        assert_eq!(
            HealthCheckPolicy { probe_timeout: Duration::ZERO, ..policy() }
                .validate(),
            Err(PolicyError::ZeroProbeTimeout)
        );
    }

    #[test]
    fn policy_deserializes_from_seconds() {
        let policy: HealthCheckPolicy = serde_json::from_str(
            r#"{
                "grace_period_secs": 25,
                "poll_interval_secs": 5,
                "retries": 3,
                "probe_timeout_secs": 5
            }"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            HealthCheckPolicy::new(
                Duration::from_secs(25),
                Duration::from_secs(5),
                3,
                Duration::from_secs(5),
            )
        );
    }
}
