use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{ExecutionHistory, HistoryFilter, Order, State};
use crate::error::HistoryError;

const FEED_CAPACITY: usize = 256;

/// History kept entirely in RAM, newest event first.
///
/// Suitable for tests, demos and short runs; memory grows with every event.
#[derive(Debug)]
pub struct InMemoryExecutionHistory {
    states: RwLock<Vec<State>>,
    feed: broadcast::Sender<State>,
}

impl InMemoryExecutionHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            states: RwLock::new(Vec::new()),
            feed,
        }
    }

    /// Live feed of appended events. Slow receivers observe `Lagged`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<State> {
        self.feed.subscribe()
    }

    /// Copy of every stored event, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<State> {
        self.states.read().clone()
    }
}

impl Default for InMemoryExecutionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionHistory for InMemoryExecutionHistory {
    fn append(&self, state: State) -> Result<(), HistoryError> {
        if state.activation_time > state.time {
            return Err(HistoryError::Rejected(format!(
                "{}: started at {} after completing at {}",
                state.id, state.activation_time, state.time
            )));
        }
        {
            let mut states = self.states.write();
            // After every event with the same or a later time.
            let at = states.partition_point(|stored| stored.time >= state.time);
            states.insert(at, state.clone());
        }
        let _ = self.feed.send(state);
        Ok(())
    }

    fn query(&self, filter: &HistoryFilter) -> Result<Vec<State>, HistoryError> {
        filter.validate()?;
        let limit = filter.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let states = self.states.read();
        let wanted = |state: &&State| filter.matches(state);
        let found = match filter.order.unwrap_or_default() {
            Order::Desc => states.iter().filter(wanted).take(limit).cloned().collect(),
            Order::Asc => states
                .iter()
                .rev()
                .filter(wanted)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(found)
    }

    fn len(&self) -> usize {
        self.states.read().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{clock::Timestamp, entity::EntityId};

    fn at(from: EntityId, time: i64, tag: &str) -> State {
        State::instant(from, None, Timestamp(time), json!({ "tag": tag }))
    }

    #[test]
    fn keeps_descending_time_order_regardless_of_append_order() {
        let history = InMemoryExecutionHistory::new();
        let from = EntityId::generate();
        for time in [5, 1, 9, 3] {
            history.append(at(from, time, "x")).unwrap();
        }
        let times: Vec<_> = history
            .query(&HistoryFilter::new())
            .unwrap()
            .iter()
            .map(|s| s.time.micros())
            .collect();
        assert_eq!(times, vec![9, 5, 3, 1]);
        let asc: Vec<_> = history
            .query(&HistoryFilter::new().order(Order::Asc))
            .unwrap()
            .iter()
            .map(|s| s.time.micros())
            .collect();
        assert_eq!(asc, vec![1, 3, 5, 9]);
    }

    #[test]
    fn equal_times_keep_insertion_order() {
        let history = InMemoryExecutionHistory::new();
        let from = EntityId::generate();
        history.append(at(from, 2, "first")).unwrap();
        history.append(at(from, 2, "second")).unwrap();
        let tags: Vec<_> = history
            .snapshot()
            .iter()
            .map(|s| s.payload_str("tag").unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["first", "second"]);
    }

    #[test]
    fn limit_truncates_without_reordering() {
        let history = InMemoryExecutionHistory::new();
        let wanted = EntityId::generate();
        let other = EntityId::generate();
        for time in 1..=6 {
            let from = if time % 2 == 0 { wanted } else { other };
            history.append(at(from, time, "x")).unwrap();
        }
        let newest = history
            .query(&HistoryFilter::new().from_id(wanted).limit(2))
            .unwrap();
        assert_eq!(
            newest.iter().map(|s| s.time.micros()).collect::<Vec<_>>(),
            vec![6, 4]
        );
        let oldest = history
            .query(&HistoryFilter::new().from_id(wanted).limit(1).order(Order::Asc))
            .unwrap();
        assert_eq!(oldest[0].time, Timestamp(2));
        assert!(history
            .query(&HistoryFilter::new().limit(0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn value_filter_uses_structural_equality() {
        let history = InMemoryExecutionHistory::new();
        let from = EntityId::generate();
        history.append(at(from, 1, "a")).unwrap();
        history.append(at(from, 2, "b")).unwrap();
        let found = history
            .query(&HistoryFilter::new().value(json!({ "tag": "a" })))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].time, Timestamp(1));
    }

    #[test]
    fn events_completing_before_they_start_are_refused() {
        let history = InMemoryExecutionHistory::new();
        let backwards = State::new(
            EntityId::generate(),
            None,
            Timestamp(10),
            Timestamp(4),
            json!({}),
        );
        let err = history.append(backwards).unwrap_err();
        assert!(matches!(err, HistoryError::Rejected(ref reason) if reason.contains("after completing")));
        assert!(history.is_empty());

        let spanning = State::new(EntityId::generate(), None, Timestamp(4), Timestamp(10), json!({}));
        history.append(spanning).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let history = InMemoryExecutionHistory::new();
        let err = history
            .query(&HistoryFilter::new().min_time(Timestamp(3)).max_time(Timestamp(1)))
            .unwrap_err();
        assert!(matches!(err, HistoryError::InvalidFilter(_)));
    }

    #[test]
    fn concurrent_appends_are_all_visible() {
        let history = Arc::new(InMemoryExecutionHistory::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let history = Arc::clone(&history);
                std::thread::spawn(move || {
                    let from = EntityId::generate();
                    for i in 0..250 {
                        history.append(at(from, worker * 1_000 + i, "x")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let all = history.snapshot();
        assert_eq!(all.len(), 1_000);
        assert!(all.windows(2).all(|pair| pair[0].time >= pair[1].time));
    }

    #[tokio::test]
    async fn feed_and_async_queries_observe_appends() {
        let history = InMemoryExecutionHistory::new();
        let mut feed = history.subscribe();
        let from = EntityId::generate();
        history.append_async(at(from, 7, "live")).await.unwrap();
        let seen = feed.recv().await.unwrap();
        assert_eq!(seen.time, Timestamp(7));
        let found = history
            .query_async(HistoryFilter::new().from_id(from))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            history.latest(HistoryFilter::new()).unwrap().unwrap().id,
            seen.id
        );
    }
}
