use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use yamc::MetricRecord;
use yamc::provider::Emitter;

/// The named state objects shared by the state writers and providers.
///
/// Cloning the store gives another handle to the same objects.
#[derive(Clone, Default)]
pub struct StateStore {
    states: Arc<Mutex<HashMap<String, Arc<State>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state object called `name`, creating it if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<State> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(State::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<State>> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(name).cloned()
    }
}

/// A state object: the last record of each topic.
///
/// The topic of a record is its name.
pub struct State {
    name: String,
    inner: Mutex<StateData>,
}

#[derive(Default)]
struct StateData {
    last: BTreeMap<String, MetricRecord>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

struct Subscriber {
    id: u64,
    /// Empty means every topic.
    topics: Vec<String>,
    emitter: Emitter,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == topic)
    }
}

impl State {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            inner: Mutex::new(StateData::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateData> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores the records and notifies the subscribers of their topics.
    ///
    /// Never waits for a subscriber: the caller is usually the writer of another task.
    /// A subscriber whose queue is full (with the `block` overflow policy) misses the records that don't fit.
    pub fn update(&self, records: &[MetricRecord]) {
        let deliveries: Vec<(u64, Emitter, Vec<MetricRecord>)> = {
            let mut data = self.lock();
            for r in records {
                data.last.insert(r.name().to_owned(), r.clone());
            }
            data.subscribers
                .iter()
                .filter_map(|s| {
                    let wanted: Vec<MetricRecord> = records
                        .iter()
                        .filter(|r| s.wants(r.name()))
                        .map(|r| r.clone().with_tag("state", self.name.clone()))
                        .collect();
                    (!wanted.is_empty()).then(|| (s.id, s.emitter.clone(), wanted))
                })
                .collect()
        };

        let mut closed = Vec::new();
        for (id, emitter, records) in deliveries {
            match emitter.try_emit(records) {
                Ok(missed) if !missed.is_empty() => log::warn!(
                    "State '{}': the queue of subscription {id} is full, {} records not delivered",
                    self.name,
                    missed.len()
                ),
                Ok(_) => (),
                Err(_) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            log::debug!("State '{}': removing {} closed subscription(s)", self.name, closed.len());
            self.lock().subscribers.retain(|s| !closed.contains(&s.id));
        }
    }

    /// The last record of a topic.
    pub fn get(&self, topic: &str) -> Option<MetricRecord> {
        self.lock().last.get(topic).cloned()
    }

    /// The last record of each topic in `topics`, or of every topic if `topics` is empty.
    pub fn snapshot(&self, topics: &[String]) -> Vec<MetricRecord> {
        let data = self.lock();
        if topics.is_empty() {
            data.last.values().cloned().collect()
        } else {
            topics.iter().filter_map(|t| data.last.get(t).cloned()).collect()
        }
    }

    /// Sends the future updates of `topics` to `emitter`. Returns the id of the subscription.
    pub fn subscribe(&self, topics: Vec<String>, emitter: Emitter) -> u64 {
        let mut data = self.lock();
        let id = data.next_subscriber;
        data.next_subscriber += 1;
        data.subscribers.push(Subscriber { id, topics, emitter });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use yamc::task::OverflowPolicy;
    use yamc::{MetricRecord, Timestamp};

    use super::StateStore;

    #[test]
    fn same_name_same_state() {
        let store = StateStore::new();
        let a = store.get_or_create("home");
        let b = store.clone().get_or_create("home");
        a.update(&[MetricRecord::new(Timestamp::now(), "temperature", 21.5)]);
        assert_eq!(b.get("temperature").map(|r| r.value().as_f64()), Some(Some(21.5)));
        assert!(store.get("garden").is_none());
    }

    #[test]
    fn updates_reach_the_subscribed_topics() {
        let store = StateStore::new();
        let state = store.get_or_create("home");
        let (emitter, sink) = yamc::test::emitter(16);
        state.subscribe(vec![String::from("door")], emitter);

        let now = Timestamp::now();
        state.update(&[
            MetricRecord::new(now, "door", "open"),
            MetricRecord::new(now, "temperature", 20u64),
        ]);
        let received = sink.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].name(), "door");
        assert_eq!(received[0].tag("state"), Some("home"));

        // every topic is kept, subscribed or not
        let names: Vec<String> = state.snapshot(&[]).iter().map(|r| r.name().to_owned()).collect();
        assert_eq!(names, vec!["door", "temperature"]);
    }

    #[test]
    fn full_subscriber_does_not_block_updates() {
        let state = StateStore::new().get_or_create("home");
        let (emitter, sink) = yamc::test::emitter_with_policy(2, OverflowPolicy::Block);
        state.subscribe(Vec::new(), emitter);

        let now = Timestamp::now();
        let records: Vec<MetricRecord> = (0..5u64).map(|i| MetricRecord::new(now, format!("sensor{i}"), i)).collect();
        // returns although the subscriber has no room for every record
        state.update(&records);
        state.update(&records);
        assert_eq!(sink.drain().len(), 2);
        assert_eq!(state.snapshot(&[]).len(), 5);
        assert_eq!(state.subscriber_count(), 1);
    }

    #[test]
    fn closed_subscriptions_are_removed() {
        let state = StateStore::new().get_or_create("home");
        let (emitter, sink) = yamc::test::emitter(16);
        state.subscribe(Vec::new(), emitter);
        assert_eq!(state.subscriber_count(), 1);

        sink.close();
        state.update(&[MetricRecord::new(Timestamp::now(), "door", "closed")]);
        assert_eq!(state.subscriber_count(), 0);
    }
}
