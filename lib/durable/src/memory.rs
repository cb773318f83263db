//! In-memory execution store.
//!
//! Backs tests and embedded single-process runs. The log and queue live
//! in process memory; durability semantics (replay, diff discipline,
//! timer re-arming) are still exercised because the worker only ever
//! talks to the [`ExecutionStore`] seam.

use crate::event::HistoryEvent;
use crate::store::{ExecutionRequest, ExecutionStore, StoreError};
use async_trait::async_trait;
use cascade_core::ExecutionId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Event log and work queue held in memory.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    events: Mutex<HashMap<ExecutionId, Vec<HistoryEvent>>>,
    queue: Mutex<VecDeque<ExecutionRequest>>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops `next_request` waiters; subsequent calls return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of recorded events for an execution (test helper).
    #[must_use]
    pub fn event_count(&self, execution_id: ExecutionId) -> usize {
        self.events
            .lock()
            .unwrap()
            .get(&execution_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn append_event(
        &self,
        execution_id: ExecutionId,
        event: HistoryEvent,
    ) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap()
            .entry(execution_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn load_events(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn enqueue(&self, request: ExecutionRequest) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.queue.lock().unwrap().push_back(request);
        self.notify.notify_one();
        Ok(())
    }

    async fn next_request(&self) -> Result<Option<ExecutionRequest>, StoreError> {
        loop {
            if let Some(request) = self.queue.lock().unwrap().pop_front() {
                return Ok(Some(request));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_engine::orchestrator::OrchestrationInput;
    use chrono::Utc;

    fn request(execution_id: ExecutionId) -> ExecutionRequest {
        ExecutionRequest {
            execution_id,
            input: OrchestrationInput {
                execution_id: execution_id.to_string(),
                workflow_definition: Default::default(),
                input_data: None,
            },
        }
    }

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let store = InMemoryExecutionStore::new();
        let first = ExecutionId::new();
        let second = ExecutionId::new();

        store.enqueue(request(first)).await.expect("enqueue");
        store.enqueue(request(second)).await.expect("enqueue");

        assert_eq!(
            store.next_request().await.unwrap().map(|r| r.execution_id),
            Some(first)
        );
        assert_eq!(
            store.next_request().await.unwrap().map(|r| r.execution_id),
            Some(second)
        );
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_none() {
        let store = std::sync::Arc::new(InMemoryExecutionStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.next_request().await })
        };

        tokio::task::yield_now().await;
        store.close();

        assert_eq!(waiter.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_detection_scans_events() {
        let store = InMemoryExecutionStore::new();
        let id = ExecutionId::new();

        assert!(!store.cancel_requested(id).await.unwrap());
        store
            .append_event(
                id,
                HistoryEvent::CancelRequested {
                    timestamp: Utc::now(),
                },
            )
            .await
            .expect("append");
        assert!(store.cancel_requested(id).await.unwrap());
    }
}
