//! Runner configuration with strict environment validation.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_TASK_ASSIGNMENT_TIMEOUT_SECS: &str = "STRATA_RUNNER_TASK_ASSIGNMENT_TIMEOUT_SECS";
const ENV_TASK_CLEANUP_TIMEOUT_SECS: &str = "STRATA_RUNNER_TASK_CLEANUP_TIMEOUT_SECS";
const ENV_MAX_RETRIES_BEFORE_BLACKLIST: &str = "STRATA_RUNNER_MAX_RETRIES_BEFORE_BLACKLIST";
const ENV_MAX_PERCENTAGE_BLACKLIST_WORKERS: &str =
    "STRATA_RUNNER_MAX_PERCENTAGE_BLACKLIST_WORKERS";
const ENV_WORKER_BLACKLIST_BACKOFF_SECS: &str = "STRATA_RUNNER_WORKER_BLACKLIST_BACKOFF_SECS";
const ENV_PENDING_TASKS_NUM_THREADS: &str = "STRATA_RUNNER_PENDING_TASKS_NUM_THREADS";
const ENV_MAX_PAYLOAD_BYTES: &str = "STRATA_RUNNER_MAX_PAYLOAD_BYTES";

const DEFAULT_TASK_ASSIGNMENT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TASK_CLEANUP_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES_BEFORE_BLACKLIST: u64 = 5;
const DEFAULT_MAX_PERCENTAGE_BLACKLIST_WORKERS: u64 = 20;
const DEFAULT_WORKER_BLACKLIST_BACKOFF_SECS: u64 = 900;
const DEFAULT_PENDING_TASKS_NUM_THREADS: u64 = 1;
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 512 * 1024;

/// Configuration for the remote task runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Bound on the ASSIGNED → RUNNING transition: how long a worker may sit
    /// on an assignment node without posting status before the task fails.
    pub task_assignment_timeout: Duration,
    /// Grace period after a worker disappears before its tasks are failed.
    pub task_cleanup_timeout: Duration,
    /// Consecutive per-worker failures before the worker is blacklisted.
    pub max_retries_before_blacklist: u32,
    /// Cap on the fraction of workers blacklisted simultaneously (0..=100).
    pub max_percentage_blacklist_workers: u8,
    /// How long a blacklisted worker stays suspended.
    pub worker_blacklist_backoff: Duration,
    /// Parallelism of the assignment loop.
    pub pending_tasks_runner_num_threads: usize,
    /// Largest serialized task payload accepted by an assignment node.
    pub max_payload_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_assignment_timeout: Duration::from_secs(DEFAULT_TASK_ASSIGNMENT_TIMEOUT_SECS),
            task_cleanup_timeout: Duration::from_secs(DEFAULT_TASK_CLEANUP_TIMEOUT_SECS),
            max_retries_before_blacklist: 5,
            max_percentage_blacklist_workers: 20,
            worker_blacklist_backoff: Duration::from_secs(DEFAULT_WORKER_BLACKLIST_BACKOFF_SECS),
            pending_tasks_runner_num_threads: 1,
            max_payload_bytes: 512 * 1024,
        }
    }
}

impl RunnerConfig {
    /// Loads runner config from the process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or is out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads runner config with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or is out of range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let assignment_timeout_secs = parse_positive_u64_env(
            &get_env,
            ENV_TASK_ASSIGNMENT_TIMEOUT_SECS,
            DEFAULT_TASK_ASSIGNMENT_TIMEOUT_SECS,
        )?;
        let cleanup_timeout_secs = parse_positive_u64_env(
            &get_env,
            ENV_TASK_CLEANUP_TIMEOUT_SECS,
            DEFAULT_TASK_CLEANUP_TIMEOUT_SECS,
        )?;
        let max_retries = parse_positive_u64_env(
            &get_env,
            ENV_MAX_RETRIES_BEFORE_BLACKLIST,
            DEFAULT_MAX_RETRIES_BEFORE_BLACKLIST,
        )?;
        let max_percentage = parse_u64_env(
            &get_env,
            ENV_MAX_PERCENTAGE_BLACKLIST_WORKERS,
            DEFAULT_MAX_PERCENTAGE_BLACKLIST_WORKERS,
        )?;
        let backoff_secs = parse_positive_u64_env(
            &get_env,
            ENV_WORKER_BLACKLIST_BACKOFF_SECS,
            DEFAULT_WORKER_BLACKLIST_BACKOFF_SECS,
        )?;
        let num_threads = parse_positive_u64_env(
            &get_env,
            ENV_PENDING_TASKS_NUM_THREADS,
            DEFAULT_PENDING_TASKS_NUM_THREADS,
        )?;
        let max_payload = parse_positive_u64_env(
            &get_env,
            ENV_MAX_PAYLOAD_BYTES,
            DEFAULT_MAX_PAYLOAD_BYTES,
        )?;

        let max_percentage = u8::try_from(max_percentage)
            .ok()
            .filter(|value| *value <= 100)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{ENV_MAX_PERCENTAGE_BLACKLIST_WORKERS} must be in 0..=100, got {max_percentage}"
                ))
            })?;

        Ok(Self {
            task_assignment_timeout: Duration::from_secs(assignment_timeout_secs),
            task_cleanup_timeout: Duration::from_secs(cleanup_timeout_secs),
            max_retries_before_blacklist: u32::try_from(max_retries).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_MAX_RETRIES_BEFORE_BLACKLIST} value {max_retries} exceeds supported range"
                ))
            })?,
            max_percentage_blacklist_workers: max_percentage,
            worker_blacklist_backoff: Duration::from_secs(backoff_secs),
            pending_tasks_runner_num_threads: usize::try_from(num_threads).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_PENDING_TASKS_NUM_THREADS} value {num_threads} exceeds supported range"
                ))
            })?,
            max_payload_bytes: usize::try_from(max_payload).map_err(|_| {
                Error::configuration(format!(
                    "{ENV_MAX_PAYLOAD_BYTES} value {max_payload} exceeds supported range"
                ))
            })?,
        })
    }
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
    })
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_u64_env(get_env, key, default)?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}
