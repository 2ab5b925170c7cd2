// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

use crate::init::BoxError;

/// Wait for the first task of the set to finish and return its result.
pub async fn wait_for_any_task(tasks: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => Ok(()), // empty set
        Some(res) => res?,
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<Result<(), BoxError>>,
    timeout: Duration,
) -> Result<(), BoxError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

/// Join every task until `stop_at`. The last task error wins; tasks still
/// running at the deadline are aborted.
pub async fn wait_for_tasks_with_deadline(
    tasks: &mut JoinSet<Result<(), BoxError>>,
    stop_at: Instant,
) -> Result<(), BoxError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                tasks.abort_all();
                result = Err(format!("timed out waiting for {} tasks to complete", tasks.len()).into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => error!("Failed to join with task: {:?}", e),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_task_returns_first_error() {
        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        tasks.spawn(async { Err("boom".into()) });
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let err = wait_for_any_task(&mut tasks).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_timeout_aborts_stragglers() {
        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        tasks.spawn(async { Ok(()) });
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let res = wait_for_tasks_with_timeout(&mut tasks, Duration::from_millis(50)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_all_tasks_complete() {
        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        for _ in 0..3 {
            tasks.spawn(async { Ok(()) });
        }

        wait_for_tasks_with_timeout(&mut tasks, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }
}
