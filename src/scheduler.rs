//! Fixed-size worker pool over a FIFO queue of element ids.
//!
//! Popping the queue is the only synchronised step between workers. A
//! worker that pops an id owns that element until it reaches a terminal
//! state; it crops the element's region and hands it to the
//! [`Orchestrator`] before pulling the next id. Workers exit when the queue
//! is empty and the run completes when all of them have been joined.
//!
//! A panic while processing one element fails that element and the worker
//! moves on to the next id.

use crate::config::PipelineConfig;
use crate::element::{ElementId, ElementStatus};
use crate::error::ElementError;
use crate::orchestrator::Orchestrator;
use crate::pipeline::crop::{crop_and_downscale, crop_region};
use crate::store::ElementStore;
use futures::FutureExt;
use image::RgbaImage;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Insertion-ordered queue shared by the workers.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<ElementId>>,
}

impl WorkQueue {
    pub fn new(ids: impl IntoIterator<Item = ElementId>) -> Self {
        Self {
            items: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// Take the oldest id, if any.
    pub fn pop(&self) -> Option<ElementId> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a worker needs, shared behind one `Arc`.
struct WorkerContext {
    orchestrator: Orchestrator,
    store: Arc<ElementStore>,
    config: Arc<PipelineConfig>,
    slide: Arc<RgbaImage>,
}

/// Drains a [`WorkQueue`] with up to `concurrency` workers.
pub struct Scheduler {
    ctx: Arc<WorkerContext>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Orchestrator,
        store: Arc<ElementStore>,
        config: Arc<PipelineConfig>,
        slide: Arc<RgbaImage>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                orchestrator,
                store,
                config,
                slide,
            }),
        }
    }

    /// Process every queued element to a terminal state.
    ///
    /// Spawns `min(concurrency, queued)` workers and returns how many ran.
    pub async fn run(&self, queue: WorkQueue) -> usize {
        let workers = self.ctx.config.concurrency.min(queue.len());
        if workers == 0 {
            return 0;
        }
        info!("Starting {} worker(s) for {} element(s)", workers, queue.len());

        let queue = Arc::new(queue);
        let mut set = JoinSet::new();
        for n in 0..workers {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&self.ctx);
            set.spawn(async move {
                while let Some(id) = queue.pop() {
                    debug!("Worker {} took {}", n, id);
                    if let Err(panic) = AssertUnwindSafe(ctx.process(&id)).catch_unwind().await {
                        ctx.recover(&id, panic_message(&*panic));
                    }
                }
                debug!("Worker {} idle, exiting", n);
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        workers
    }
}

impl WorkerContext {
    async fn process(&self, id: &ElementId) {
        let claimed = self.store.update(id, |e| {
            e.transition_to(ElementStatus::Processing)
                .map(|_| (e.element_type, e.bbox))
        });
        let (element_type, bbox) = match claimed {
            Some(Ok(claim)) => claim,
            Some(Err(e)) => {
                warn!("[{}] skipped: {}", id, e);
                return;
            }
            None => {
                warn!("[{}] skipped: not in store", id);
                return;
            }
        };
        if let Some(cb) = &self.config.progress_callback {
            cb.on_element_start(id, element_type);
        }

        let (width, height) = self.slide.dimensions();
        let rect = match crop_region(width, height, &bbox, self.config.crop_padding) {
            Ok(rect) => rect,
            Err(e) => {
                self.orchestrator.abort(ElementError::Geometry {
                    id: id.clone(),
                    detail: e.to_string(),
                });
                return;
            }
        };

        let slide = Arc::clone(&self.slide);
        let max_dimension = self.config.max_crop_dimension;
        let crop = match tokio::task::spawn_blocking(move || {
            crop_and_downscale(&slide, rect, max_dimension)
        })
        .await
        {
            Ok(crop) => Arc::new(crop),
            Err(e) => {
                self.orchestrator.abort(ElementError::Geometry {
                    id: id.clone(),
                    detail: format!("crop task panicked: {e}"),
                });
                return;
            }
        };
        debug!(
            "[{}] crop {}x{} at ({}, {})",
            id,
            crop.width(),
            crop.height(),
            rect.x,
            rect.y
        );
        self.store.update(id, |e| e.original_crop = Some(crop));

        self.orchestrator.drive(id).await;
    }

    /// Fail an element whose processing panicked, unless it already reached
    /// a terminal state.
    fn recover(&self, id: &ElementId, detail: String) {
        warn!("[{}] panicked while processing: {}", id, detail);
        let still_held = self
            .store
            .snapshot(id)
            .is_some_and(|e| e.status() == ElementStatus::Processing);
        if still_held {
            self.orchestrator.abort(ElementError::Panicked {
                id: id.clone(),
                detail,
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_in_insertion_order() {
        let q = WorkQueue::new((0..3).map(ElementId::from_index));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(ElementId::from_index(0)));
        assert_eq!(q.pop(), Some(ElementId::from_index(1)));
        assert_eq!(q.pop(), Some(ElementId::from_index(2)));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let from_str = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*from_str), "static");
        let from_string = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
        assert_eq!(panic_message(&*from_string), "formatted 7");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*other), "unknown panic");
    }

    #[test]
    fn queue_pop_is_exclusive_across_threads() {
        let q = Arc::new(WorkQueue::new((0..1000).map(ElementId::from_index)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(id) = q.pop() {
                        got.push(id);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<ElementId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
