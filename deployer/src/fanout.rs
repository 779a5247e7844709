// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded per-node parallelism within one stage.

use crate::error::DeployError;
use crate::stage::StageName;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};

/// Per-node tasks of one stage, at most `max_parallelism` of them running at
/// a time.
///
/// The first task to fail aborts every other task of the set; the stage
/// result is that first error.
pub(crate) struct NodeTaskSet<T> {
    stage: StageName,
    semaphore: Arc<Semaphore>,
    set: JoinSet<Result<T, DeployError>>,
    nodes: HashMap<Id, String>,
}

impl<T: Send + 'static> NodeTaskSet<T> {
    pub fn new(stage: StageName, max_parallelism: usize) -> Self {
        Self {
            stage,
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            set: JoinSet::new(),
            nodes: HashMap::new(),
        }
    }

    /// Spawns `task` for `node`.  It starts running once a permit is free.
    pub fn spawn<F>(&mut self, node: &str, task: F)
    where
        F: Future<Output = Result<T, DeployError>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let handle = self.set.spawn(async move {
            // The semaphore is never closed; holding the permit (or nothing)
            // until the task finishes is all that matters.
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        });
        self.nodes.insert(handle.id(), node.to_string());
    }

    /// Waits for every task.  Returns the outputs in completion order, or
    /// the first failure once every other task has been aborted and reaped.
    pub async fn join_all(mut self) -> Result<Vec<T>, DeployError> {
        let mut outputs = Vec::with_capacity(self.nodes.len());
        let mut first_error = None;
        while let Some(joined) = self.set.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => Err(DeployError::TaskPanicked {
                    stage: self.stage,
                    node: self
                        .nodes
                        .get(&err.id())
                        .cloned()
                        .unwrap_or_default(),
                }),
            };
            match result {
                Ok(output) if first_error.is_none() => outputs.push(output),
                Ok(_) => {}
                Err(err) => {
                    if first_error.is_none() {
                        self.set.abort_all();
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut set = NodeTaskSet::new(StageName::Storage, 2);
        for i in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            set.spawn(&format!("n{i}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            });
        }
        let mut outputs = set.join_all().await.unwrap();
        outputs.sort();
        assert_eq!(outputs, [0, 1, 2, 3, 4]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_aborts_the_rest() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut set = NodeTaskSet::new(StageName::Storage, 4);
        set.spawn("slow", {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_secs(600)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        set.spawn("bad", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err(DeployError::LoginBundle {
                node: "bad".into(),
                attempts: 1,
                reason: "test".into(),
            })
        });
        let err = set.join_all().await.unwrap_err();
        assert_eq!(err.node(), Some("bad"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_name_the_node() {
        let mut set = NodeTaskSet::<()>::new(StageName::Routing, 1);
        set.spawn("r2", async {
            let healthy: Option<()> = None;
            healthy.expect("boom");
            Ok(())
        });
        assert_matches!(
            set.join_all().await,
            Err(DeployError::TaskPanicked { stage: StageName::Routing, node })
                if node == "r2"
        );
    }
}
