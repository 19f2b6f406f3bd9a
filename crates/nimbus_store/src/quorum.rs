//! Quorum fan-out engine.
//!
//! `do_write` and `do_read` launch one async operation per replica, drain
//! results as they arrive, and return as soon as the required count is met.
//! Operations are spawned tasks, so an early return never cancels stragglers;
//! their late results are simply discarded. Each operation runs under its own
//! per-replica deadline, which also bounds how long an abandoned straggler
//! can linger. The engine never retries.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Per-replica RPC deadline applied inside the engine.
pub const DEFAULT_PER_REPLICA_TIMEOUT: Duration = Duration::from_secs(2);

/// How many representative per-replica errors quorum failures report.
const MAX_REPORTED_ERRORS: usize = 3;

/// Result of a quorum write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub success: bool,
    pub acks: usize,
    pub required: usize,
    pub replicas: usize,
    pub error: Option<String>,
}

/// Result of a quorum read carrying whatever the per-replica op returned.
///
/// Value order bears no relation to replica order; callers that need
/// attribution thread a replica identifier through `T`.
#[derive(Debug)]
pub struct ReadOutcome<T> {
    pub success: bool,
    pub responses: usize,
    pub required: usize,
    pub replicas: usize,
    pub values: Vec<T>,
    pub error: Option<String>,
}

/// Fan a write out to `replicas`, succeeding once `required` acks arrive.
///
/// `required == 0` selects a majority. The op resolves to `Ok(true)` for an
/// ack, `Ok(false)` for a clean negative, and `Err` for a transport failure;
/// failures only ever show up as missing acks plus diagnostic text.
pub async fn do_write<F, Fut>(
    replicas: &[String],
    required: usize,
    per_replica_timeout: Duration,
    op: F,
) -> WriteOutcome
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    if replicas.is_empty() {
        return WriteOutcome {
            success: false,
            acks: 0,
            required,
            replicas: 0,
            error: Some("no replicas provided".to_string()),
        };
    }

    let required = if required == 0 {
        replicas.len() / 2 + 1
    } else {
        required
    };
    if required > replicas.len() {
        return WriteOutcome {
            success: false,
            acks: 0,
            required,
            replicas: replicas.len(),
            error: Some(format!(
                "required W={required} exceeds replica count={}",
                replicas.len()
            )),
        };
    }

    let mut rx = spawn_ops(replicas, per_replica_timeout, op);

    let mut acks = 0usize;
    let mut completed = 0usize;
    let mut errors = Vec::new();
    while let Some((replica_id, result)) = rx.recv().await {
        completed += 1;
        match result {
            Ok(true) => {
                acks += 1;
                if acks >= required {
                    return WriteOutcome {
                        success: true,
                        acks,
                        required,
                        replicas: replicas.len(),
                        error: None,
                    };
                }
            }
            Ok(false) => {}
            Err(err) => errors.push(format!("replica {replica_id}: {err}")),
        }
        if completed == replicas.len() {
            break;
        }
    }

    WriteOutcome {
        success: false,
        acks,
        required,
        replicas: replicas.len(),
        error: Some(quorum_error(
            "acks",
            acks,
            required,
            replicas.len(),
            &errors,
        )),
    }
}

/// Fan a read out to `replicas`, succeeding once `required` responses arrive.
///
/// Every `Ok` op output counts as a response and is collected; a replica
/// that answers "not found" is still a response (the caller models that
/// inside `T`).
pub async fn do_read<T, F, Fut>(
    replicas: &[String],
    required: usize,
    per_replica_timeout: Duration,
    op: F,
) -> ReadOutcome<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    if replicas.is_empty() {
        return ReadOutcome {
            success: false,
            responses: 0,
            required,
            replicas: 0,
            values: Vec::new(),
            error: Some("no replicas provided".to_string()),
        };
    }

    let required = if required == 0 {
        replicas.len() / 2 + 1
    } else {
        required
    };
    if required > replicas.len() {
        return ReadOutcome {
            success: false,
            responses: 0,
            required,
            replicas: replicas.len(),
            values: Vec::new(),
            error: Some(format!(
                "required R={required} exceeds replica count={}",
                replicas.len()
            )),
        };
    }

    let mut rx = spawn_ops(replicas, per_replica_timeout, op);

    let mut values = Vec::with_capacity(replicas.len());
    let mut completed = 0usize;
    let mut errors = Vec::new();
    while let Some((replica_id, result)) = rx.recv().await {
        completed += 1;
        match result {
            Ok(value) => {
                values.push(value);
                if values.len() >= required {
                    let responses = values.len();
                    return ReadOutcome {
                        success: true,
                        responses,
                        required,
                        replicas: replicas.len(),
                        values,
                        error: None,
                    };
                }
            }
            Err(err) => errors.push(format!("replica {replica_id}: {err}")),
        }
        if completed == replicas.len() {
            break;
        }
    }

    let responses = values.len();
    ReadOutcome {
        success: false,
        responses,
        required,
        replicas: replicas.len(),
        values,
        error: Some(quorum_error(
            "responses",
            responses,
            required,
            replicas.len(),
            &errors,
        )),
    }
}

/// Spawn one op per replica under the per-replica deadline and return the
/// channel results arrive on.
fn spawn_ops<T, F, Fut>(
    replicas: &[String],
    per_replica_timeout: Duration,
    op: F,
) -> mpsc::UnboundedReceiver<(String, anyhow::Result<T>)>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    for replica_id in replicas {
        let fut = op(replica_id.clone());
        let tx = tx.clone();
        let replica_id = replica_id.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(per_replica_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("rpc timed out")),
            };
            // The receiver may be gone after an early quorum; that is fine.
            let _ = tx.send((replica_id, result));
        });
    }
    rx
}

/// Build the diagnostic text for an unmet quorum.
fn quorum_error(
    counter: &str,
    observed: usize,
    required: usize,
    replicas: usize,
    errors: &[String],
) -> String {
    let mut msg =
        format!("quorum not met: {counter}={observed} required={required} replicas={replicas}");
    if !errors.is_empty() {
        let shown = &errors[..errors.len().min(MAX_REPORTED_ERRORS)];
        msg.push_str(&format!(" errors={shown:?}"));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn replicas(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("n{i}")).collect()
    }

    #[tokio::test]
    async fn write_fails_without_replicas() {
        let outcome = do_write(&[], 2, DEFAULT_PER_REPLICA_TIMEOUT, |_| async {
            Ok(true)
        })
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no replicas"));
    }

    #[tokio::test]
    async fn write_fails_when_quorum_exceeds_replicas() {
        let outcome = do_write(&replicas(2), 3, DEFAULT_PER_REPLICA_TIMEOUT, |_| async {
            Ok(true)
        })
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("exceeds replica count"));
    }

    #[tokio::test]
    async fn write_succeeds_at_threshold_despite_one_failure() {
        let outcome = do_write(
            &replicas(3),
            2,
            DEFAULT_PER_REPLICA_TIMEOUT,
            |replica_id| async move {
                if replica_id == "n3" {
                    anyhow::bail!("connection refused");
                }
                Ok(true)
            },
        )
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.acks, 2);
        assert_eq!(outcome.required, 2);
    }

    #[tokio::test]
    async fn write_fails_below_threshold_with_diagnostics() {
        let outcome = do_write(
            &replicas(3),
            2,
            DEFAULT_PER_REPLICA_TIMEOUT,
            |replica_id| async move {
                if replica_id == "n1" {
                    Ok(true)
                } else {
                    anyhow::bail!("boom")
                }
            },
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.acks, 1);
        let msg = outcome.error.unwrap();
        assert!(msg.contains("acks=1"));
        assert!(msg.contains("required=2"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn write_returns_early_without_waiting_for_stragglers() {
        let started = Instant::now();
        let outcome = do_write(
            &replicas(3),
            2,
            Duration::from_secs(10),
            |replica_id| async move {
                if replica_id == "n3" {
                    // Straggler that quorum must not wait for.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(true)
            },
        )
        .await;
        assert!(outcome.success);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "early termination took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn per_replica_timeout_counts_as_missing_ack() {
        let outcome = do_write(
            &replicas(2),
            2,
            Duration::from_millis(50),
            |replica_id| async move {
                if replica_id == "n2" {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(true)
            },
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.acks, 1);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn zero_required_defaults_to_majority() {
        let outcome = do_write(&replicas(3), 0, DEFAULT_PER_REPLICA_TIMEOUT, |_| async {
            Ok(true)
        })
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.required, 2);

        let outcome = do_read(&replicas(5), 0, DEFAULT_PER_REPLICA_TIMEOUT, |_| async {
            Ok(1u8)
        })
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.required, 3);
    }

    #[tokio::test]
    async fn read_collects_values_from_responders() {
        let outcome = do_read(
            &replicas(3),
            2,
            DEFAULT_PER_REPLICA_TIMEOUT,
            |replica_id| async move {
                if replica_id == "n2" {
                    anyhow::bail!("down");
                }
                Ok((replica_id.clone(), 42u32))
            },
        )
        .await;
        assert!(outcome.success);
        assert!(outcome.responses >= 2);
        assert!(outcome.values.iter().all(|(_, v)| *v == 42));
    }

    #[tokio::test]
    async fn read_fails_below_threshold() {
        let outcome = do_read(
            &replicas(3),
            3,
            DEFAULT_PER_REPLICA_TIMEOUT,
            |replica_id| async move {
                if replica_id == "n1" {
                    Ok(1u8)
                } else {
                    anyhow::bail!("down")
                }
            },
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.responses, 1);
        let msg = outcome.error.unwrap();
        assert!(msg.contains("responses=1"));
        assert!(msg.contains("replicas=3"));
    }
}
