//! The sliding-window event buffer (§4.J "Window").
//!
//! Single writer (the ingestor's processing loop); readers take a read-lock
//! over the same structure rather than a cloned snapshot — cloning the
//! window on every read would defeat its purpose, so `query_*` methods
//! return owned `Vec<CorrelationEvent>` copies instead of borrowing past the
//! lock guard.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use telemetry_types::EventType;

use crate::model::CorrelationEvent;

type Key = (i64, String);

fn key_of(event: &CorrelationEvent) -> Key {
    (event.timestamp_ns, event.event_id.clone())
}

struct WindowInner {
    events: BTreeMap<Key, CorrelationEvent>,
    by_entity: HashMap<String, BTreeSet<Key>>,
    by_event_type: HashMap<EventType, BTreeSet<Key>>,
    by_tag: HashMap<String, BTreeSet<Key>>,
}

impl WindowInner {
    fn new() -> Self {
        Self {
            events: BTreeMap::new(),
            by_entity: HashMap::new(),
            by_event_type: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    fn index(&mut self, key: &Key, event: &CorrelationEvent) {
        self.by_entity
            .entry(event.entity_id.clone())
            .or_default()
            .insert(key.clone());
        self.by_event_type
            .entry(event.event_type)
            .or_default()
            .insert(key.clone());
        for tag in &event.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
    }

    fn deindex(&mut self, key: &Key, event: &CorrelationEvent) {
        if let Some(set) = self.by_entity.get_mut(&event.entity_id) {
            set.remove(key);
            if set.is_empty() {
                self.by_entity.remove(&event.entity_id);
            }
        }
        if let Some(set) = self.by_event_type.get_mut(&event.event_type) {
            set.remove(key);
            if set.is_empty() {
                self.by_event_type.remove(&event.event_type);
            }
        }
        for tag in &event.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(key);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }
}

/// Configuration the window was opened with (§6 `engine.window_seconds`,
/// `engine.max_events_in_window`).
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub horizon_ns: i64,
    pub max_events: usize,
}

/// Rolling in-memory event buffer consulted by rules (§4.J).
pub struct CorrelationWindow {
    inner: RwLock<WindowInner>,
    config: WindowConfig,
}

impl CorrelationWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            inner: RwLock::new(WindowInner::new()),
            config,
        }
    }

    /// Insert `event`, then evict anything older than the horizon relative
    /// to `now_ns`, bounded to `max_evict_per_call` entries so a single
    /// insert can never stall the writer on an unbounded eviction sweep
    /// (§4.J "eviction is background and bounded per tick").
    pub fn insert(&self, event: CorrelationEvent, now_ns: i64, max_evict_per_call: usize) {
        let mut inner = self.inner.write();
        let key = key_of(&event);
        inner.index(&key, &event);
        inner.events.insert(key, event);

        let cutoff = now_ns - self.config.horizon_ns;
        let mut evicted = 0usize;
        while evicted < max_evict_per_call {
            let Some((&(ts, _), _)) = inner.events.iter().next() else {
                break;
            };
            if ts >= cutoff && inner.events.len() <= self.config.max_events {
                break;
            }
            let (k, ev) = inner.events.pop_first().unwrap();
            inner.deindex(&k, &ev);
            evicted += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    pub fn contains_event_id(&self, event_id: &str) -> bool {
        self.inner.read().events.values().any(|e| e.event_id == event_id)
    }

    /// All events for `entity_id`, oldest first.
    pub fn by_entity(&self, entity_id: &str) -> Vec<CorrelationEvent> {
        let inner = self.inner.read();
        inner
            .by_entity
            .get(entity_id)
            .map(|keys| keys.iter().map(|k| inner.events[k].clone()).collect())
            .unwrap_or_default()
    }

    pub fn by_event_type(&self, event_type: EventType) -> Vec<CorrelationEvent> {
        let inner = self.inner.read();
        inner
            .by_event_type
            .get(&event_type)
            .map(|keys| keys.iter().map(|k| inner.events[k].clone()).collect())
            .unwrap_or_default()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<CorrelationEvent> {
        let inner = self.inner.read();
        inner
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().map(|k| inner.events[k].clone()).collect())
            .unwrap_or_default()
    }
}
