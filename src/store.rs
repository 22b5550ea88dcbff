//! Shared run state: every element, the run log and token usage.
//!
//! The store has exactly one way to change an element: [`ElementStore::update`],
//! which applies a closure to the latest stored value under the lock. Workers
//! never write back a whole element they read earlier, so a log append and a
//! status change made close together both survive. Observers read cloned
//! snapshots or subscribe to [`ElementEvent`]s and never hold the lock across
//! an await.

use crate::element::{Element, ElementId, ElementStatus};
use crate::output::UsageStats;
use crate::service::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

const EVENT_CAPACITY: usize = 256;

/// Emitted after every merge into an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEvent {
    pub id: ElementId,
    pub status: ElementStatus,
    pub attempts: u32,
    pub last_qa_score: Option<u8>,
}

impl From<&Element> for ElementEvent {
    fn from(e: &Element) -> Self {
        Self {
            id: e.id.clone(),
            status: e.status(),
            attempts: e.attempts,
            last_qa_score: e.last_qa_score,
        }
    }
}

#[derive(Default)]
struct StoreState {
    order: Vec<ElementId>,
    elements: HashMap<ElementId, Element>,
    log: Vec<String>,
    usage: UsageStats,
    processing: usize,
    peak_processing: usize,
}

/// Keyed element state shared by all workers of a session.
pub struct ElementStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<ElementEvent>,
}

impl Default for ElementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an element. Returns false if the id is already taken.
    pub fn insert(&self, element: Element) -> bool {
        let mut state = self.lock();
        if state.elements.contains_key(&element.id) {
            return false;
        }
        if element.status() == ElementStatus::Processing {
            state.processing += 1;
            state.peak_processing = state.peak_processing.max(state.processing);
        }
        state.order.push(element.id.clone());
        state.elements.insert(element.id.clone(), element);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.lock().elements.contains_key(id)
    }

    /// Clone of one element.
    pub fn snapshot(&self, id: &ElementId) -> Option<Element> {
        self.lock().elements.get(id).cloned()
    }

    /// Clones of every element in insertion order.
    pub fn snapshots(&self) -> Vec<Element> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.elements.get(id).cloned())
            .collect()
    }

    /// Ids matching `pred`, in insertion order.
    pub fn ids_where(&self, pred: impl Fn(&Element) -> bool) -> Vec<ElementId> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter(|id| state.elements.get(*id).is_some_and(&pred))
            .cloned()
            .collect()
    }

    /// Apply `f` to the current value of element `id` and publish the result.
    ///
    /// This is the single merge entry point. `f` runs under the store lock,
    /// so it must not block or await. Returns `None` for an unknown id.
    pub fn update<R>(&self, id: &ElementId, f: impl FnOnce(&mut Element) -> R) -> Option<R> {
        let (result, event) = {
            let mut state = self.lock();
            let element = state.elements.get_mut(id)?;
            let was_processing = element.status() == ElementStatus::Processing;
            let result = f(element);
            let is_processing = element.status() == ElementStatus::Processing;
            let event = ElementEvent::from(&*element);

            match (was_processing, is_processing) {
                (false, true) => {
                    state.processing += 1;
                    state.peak_processing = state.peak_processing.max(state.processing);
                }
                (true, false) => state.processing = state.processing.saturating_sub(1),
                _ => {}
            }
            (result, event)
        };
        // No receivers is fine.
        let _ = self.events.send(event);
        Some(result)
    }

    /// Append a line to the human-readable run log.
    pub fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.lock().log.push(line);
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn record_usage(&self, usage: &TokenUsage) {
        self.lock().usage.record(usage);
    }

    pub fn usage(&self) -> UsageStats {
        self.lock().usage.clone()
    }

    /// Elements currently PROCESSING.
    pub fn processing_count(&self) -> usize {
        self.lock().processing
    }

    /// Highest PROCESSING count seen since the store was created.
    pub fn peak_processing(&self) -> usize {
        self.lock().peak_processing
    }

    /// Receive an [`ElementEvent`] after every merge. A receiver that falls
    /// more than a few hundred events behind skips the oldest.
    pub fn subscribe(&self) -> broadcast::Receiver<ElementEvent> {
        self.events.subscribe()
    }
}
