//! Streaming progress API: observe element state as it changes.
//!
//! Every merge into the [`ElementStore`] publishes an [`ElementEvent`]. The
//! stream returned here yields those events as they happen, so a UI can
//! follow a run without polling or blocking workers. Events from different
//! elements interleave in whatever order the workers produce them.
//!
//! The stream is backed by a broadcast channel: a consumer that falls too
//! far behind silently skips the oldest events rather than slowing the
//! pipeline down. Call [`ElementStore::snapshot`] when exact state matters.

use crate::store::{ElementEvent, ElementStore};
use futures::stream::StreamExt;
use std::pin::Pin;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::debug;

/// A boxed stream of element events.
pub type ElementEventStream = Pin<Box<dyn Stream<Item = ElementEvent> + Send>>;

/// Subscribe to every future merge into `store`.
///
/// The stream ends when the store is dropped.
pub fn element_events(store: &ElementStore) -> ElementEventStream {
    BroadcastStream::new(store.subscribe())
        .filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(lagged) => {
                    debug!("Event stream lagging: {}", lagged);
                    None
                }
            }
        })
        .boxed()
}

/// Like [`element_events`], restricted to COMPLETED and FAILED transitions.
pub fn terminal_events(store: &ElementStore) -> ElementEventStream {
    element_events(store)
        .filter(|event| futures::future::ready(event.status.is_terminal()))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{BoundingBox, Element, ElementId, ElementStatus, ElementType};
    use std::sync::Arc;

    fn store_with(n: usize) -> Arc<ElementStore> {
        let store = Arc::new(ElementStore::new());
        for i in 0..n {
            store.insert(Element::new(
                ElementId::from_index(i),
                ElementType::Icon,
                None,
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                0,
            ));
        }
        store
    }

    #[tokio::test]
    async fn yields_merges_in_order() {
        let store = store_with(1);
        let mut events = element_events(&store);
        let id = ElementId::from_index(0);

        store.update(&id, |e| e.transition_to(ElementStatus::Processing));
        store.update(&id, |e| e.attempts = 1);
        store.update(&id, |e| e.transition_to(ElementStatus::Completed));

        let seen: Vec<_> = (&mut events).take(3).collect().await;
        assert_eq!(seen[0].status, ElementStatus::Processing);
        assert_eq!(seen[1].attempts, 1);
        assert_eq!(seen[2].status, ElementStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_filter_skips_intermediate_states() {
        let store = store_with(2);
        let mut events = terminal_events(&store);

        for i in 0..2 {
            let id = ElementId::from_index(i);
            store.update(&id, |e| e.transition_to(ElementStatus::Processing));
        }
        store.update(&ElementId::from_index(1), |e| e.transition_to(ElementStatus::Failed));

        let first = events.next().await.expect("event");
        assert_eq!(first.id, ElementId::from_index(1));
        assert_eq!(first.status, ElementStatus::Failed);
    }

    #[tokio::test]
    async fn lagging_consumer_keeps_receiving() {
        let store = store_with(1);
        let mut events = element_events(&store);
        let id = ElementId::from_index(0);
        for _ in 0..1000 {
            store.update(&id, |e| e.attempts += 1);
        }
        let next = events.next().await.expect("event after lag");
        assert!(next.attempts > 1);
    }
}
