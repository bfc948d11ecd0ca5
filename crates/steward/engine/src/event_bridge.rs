//! Event bridge: persists execution events and fans them out to subscribers
//!
//! Every event is appended to the [`EventStore`] first, which assigns the
//! run's next sequence number, and only then broadcast. Subscribers replay
//! from the store and follow the broadcast; a gap or lag is filled from the
//! store again, so a stream never skips or repeats a sequence number.

use crate::error::EngineResult;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use steward_storage::EventStore;
use steward_types::{EventType, ExecutionEvent, RunId, StepId};
use tokio::sync::{broadcast, Mutex};

/// Ordered stream of one run's events
pub type EventStream = BoxStream<'static, ExecutionEvent>;

pub struct EventBridge {
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<ExecutionEvent>,
    publish_locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl EventBridge {
    pub fn new(store: Arc<dyn EventStore>, buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            store,
            sender,
            publish_locks: DashMap::new(),
        }
    }

    /// Persist and broadcast an event. Returns it with its sequence number.
    pub async fn publish(&self, event: ExecutionEvent) -> EngineResult<ExecutionEvent> {
        let lock = self
            .publish_locks
            .entry(event.run_id.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let stored = self.store.append_event(event).await?;
        tracing::debug!(
            run_id = %stored.run_id,
            seq = stored.seq,
            event_type = %stored.event_type,
            "Event published"
        );
        // No receivers is fine
        let _ = self.sender.send(stored.clone());

        if stored.is_terminal() {
            self.publish_locks.remove(&stored.run_id);
        }
        Ok(stored)
    }

    /// Shorthand for building and publishing an event
    pub async fn emit(
        &self,
        run_id: &RunId,
        event_type: EventType,
        step_id: Option<&StepId>,
        payload: Value,
    ) -> EngineResult<ExecutionEvent> {
        let mut event = ExecutionEvent::new(run_id.clone(), event_type).with_payload(payload);
        if let Some(step_id) = step_id {
            event = event.with_step(step_id.clone());
        }
        self.publish(event).await
    }

    /// Stored events of a run with `seq > after`
    pub async fn history(&self, run_id: &RunId, after: u64) -> EngineResult<Vec<ExecutionEvent>> {
        Ok(self.store.list_events(run_id, after).await?)
    }

    /// Subscribe to a run's events after sequence `after` (zero or `None`
    /// replays everything). The stream ends after the run's terminal event.
    pub async fn subscribe(&self, run_id: &RunId, after: Option<u64>) -> EngineResult<EventStream> {
        let after = after.unwrap_or(0);
        // Subscribe before replaying so nothing published in between is lost
        let rx = self.sender.subscribe();

        // Include the event at `after` itself to learn whether the run already ended there
        let replay = self
            .store
            .list_events(run_id, after.saturating_sub(1))
            .await?;
        let mut finished = replay
            .iter()
            .any(|e| e.seq <= after && e.is_terminal());
        let buffer: VecDeque<_> = replay.into_iter().filter(|e| e.seq > after).collect();
        if !finished && buffer.is_empty() && after > 0 {
            // `after` may point past the end of a finished log
            finished = self
                .store
                .last_event(run_id)
                .await?
                .is_some_and(|last| last.seq <= after && last.is_terminal());
        }

        let state = Subscription {
            store: self.store.clone(),
            rx,
            run_id: run_id.clone(),
            last_seq: after,
            buffer,
            done: finished,
        };
        Ok(stream::unfold(state, Subscription::next).boxed())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

struct Subscription {
    store: Arc<dyn EventStore>,
    rx: broadcast::Receiver<ExecutionEvent>,
    run_id: RunId,
    last_seq: u64,
    buffer: VecDeque<ExecutionEvent>,
    done: bool,
}

impl Subscription {
    async fn next(mut self) -> Option<(ExecutionEvent, Self)> {
        loop {
            if self.done {
                return None;
            }
            if let Some(event) = self.buffer.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                self.done = event.is_terminal();
                return Some((event, self));
            }

            match self.rx.recv().await {
                Ok(event) if event.run_id != self.run_id || event.seq <= self.last_seq => {}
                Ok(event) if event.seq == self.last_seq + 1 => self.buffer.push_back(event),
                Ok(_) => {
                    if !self.refill().await {
                        return None;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %self.run_id, skipped, "Subscriber lagged, refilling");
                    if !self.refill().await {
                        return None;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn refill(&mut self) -> bool {
        match self.store.list_events(&self.run_id, self.last_seq).await {
            Ok(events) => {
                self.buffer.extend(events);
                true
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Event replay failed, closing stream");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use steward_storage::InMemoryStewardStorage;

    fn bridge(buffer: usize) -> EventBridge {
        EventBridge::new(Arc::new(InMemoryStewardStorage::new()), buffer)
    }

    async fn emit(bridge: &EventBridge, run_id: &RunId, event_type: EventType) -> u64 {
        bridge
            .emit(run_id, event_type, None, Value::Null)
            .await
            .unwrap()
            .seq
    }

    #[tokio::test]
    async fn sequences_are_per_run_and_monotonic() {
        let bridge = bridge(16);
        let a = RunId::new("a");
        let b = RunId::new("b");
        assert_eq!(emit(&bridge, &a, EventType::RunStarted).await, 1);
        assert_eq!(emit(&bridge, &b, EventType::RunStarted).await, 1);
        assert_eq!(emit(&bridge, &a, EventType::StepStarted).await, 2);
    }

    #[tokio::test]
    async fn subscriber_sees_replay_then_live_then_ends() {
        let bridge = bridge(16);
        let run = RunId::new("r");
        emit(&bridge, &run, EventType::RunStarted).await;
        emit(&bridge, &run, EventType::StepStarted).await;

        let mut stream = bridge.subscribe(&run, None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().seq, 1);
        assert_eq!(stream.next().await.unwrap().seq, 2);

        emit(&bridge, &RunId::new("other"), EventType::RunStarted).await;
        emit(&bridge, &run, EventType::StepCompleted).await;
        emit(&bridge, &run, EventType::RunCompleted).await;

        let third = stream.next().await.unwrap();
        assert_eq!((third.seq, third.event_type), (3, EventType::StepCompleted));
        assert_eq!(stream.next().await.unwrap().event_type, EventType::RunCompleted);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn resubscribe_resumes_after_last_seen() {
        let bridge = bridge(16);
        let run = RunId::new("r");
        for event_type in [
            EventType::RunStarted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::RunCompleted,
        ] {
            emit(&bridge, &run, event_type).await;
        }
        let seqs: Vec<u64> = bridge
            .subscribe(&run, Some(2))
            .await
            .unwrap()
            .map(|e| e.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn subscribing_at_terminal_seq_ends_immediately() {
        let bridge = bridge(16);
        let run = RunId::new("r");
        emit(&bridge, &run, EventType::RunStarted).await;
        let last = emit(&bridge, &run, EventType::RunCancelled).await;
        let mut stream = bridge.subscribe(&run, Some(last)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn subscribing_past_the_end_of_a_finished_run_ends_immediately() {
        let bridge = bridge(16);
        let run = RunId::new("r");
        emit(&bridge, &run, EventType::RunStarted).await;
        let last = emit(&bridge, &run, EventType::RunCompleted).await;
        let mut stream = bridge.subscribe(&run, Some(last + 3)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn subscribing_past_the_end_of_a_live_run_waits() {
        let bridge = bridge(16);
        let run = RunId::new("r");
        emit(&bridge, &run, EventType::RunStarted).await;
        let mut stream = bridge.subscribe(&run, Some(5)).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn lagging_subscriber_refills_from_store() {
        let bridge = bridge(2);
        let run = RunId::new("r");
        let mut stream = bridge.subscribe(&run, None).await.unwrap();
        for _ in 0..10 {
            emit(&bridge, &run, EventType::StepCompleted).await;
        }
        emit(&bridge, &run, EventType::RunFailed).await;

        let seqs: Vec<u64> = tokio::time::timeout(Duration::from_secs(1), async {
            let mut seqs = Vec::new();
            while let Some(event) = stream.next().await {
                seqs.push(event.seq);
            }
            seqs
        })
        .await
        .unwrap();
        assert_eq!(seqs, (1..=11).collect::<Vec<_>>());
    }
}
