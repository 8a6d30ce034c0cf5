//! A bounded pool of tokio tasks.
//!
//! At most `size` tasks run at once.  Tasks live in a [`JoinSet`], so whatever is still running
//! when the pool is dropped is aborted: no task outlives the call that created the pool, even
//! when [`TaskPool::join`] returns early with an error.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};

use crate::error::Result;

pub(crate) struct TaskPool {
    sem: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl TaskPool {
    pub(crate) fn new(size: usize) -> Self {
        TaskPool {
            sem: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
        }
    }

    /// Waits for a free slot, then starts `task` in it.
    pub(crate) async fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.sem).acquire_owned().await?;
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
        Ok(())
    }

    /// Waits for every task.  The first task that panicked or was cancelled fails the join, and
    /// the tasks still running are aborted.
    pub(crate) async fn join(mut self) -> Result<()> {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                self.tasks.abort_all();
                return Err(err.into());
            }
        }
        Ok(())
    }
}
