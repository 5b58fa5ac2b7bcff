//! Event Dispatch
//!
//! One dispatcher thread per engine delivers listener callbacks off the
//! writer's critical path.
//!
//! # How Delivery Works
//!
//! 1. The writer enqueues one [`DispatchMessage::Batch`] per pass that
//!    changed anything, carrying every changed node's event and the pass's
//!    fence sequence number. `subscribe` enqueues a
//!    [`DispatchMessage::CatchUp`] for the new listener. Both go through
//!    the same FIFO channel, so everything one listener sees arrives in
//!    enqueue order; enqueueing itself is serialized by the engine's fence.
//!
//! 2. The worker consumes messages with `blocking_recv` and runs callbacks
//!    inline. One thread per engine means per-listener ordering needs no
//!    further machinery, and a slow callback delays only this engine's
//!    deliveries, never its recomputation.
//!
//! 3. Batch events are skipped for listeners whose registration fence is
//!    newer than the batch: their catch-up event already reflects that
//!    pass's outcome.
//!
//! Dropping the engine drops the sender; the worker drains whatever is
//! queued and exits, and the engine joins it (unless the drop itself runs
//! on the dispatcher thread, where the worker is left to unwind on its
//! own).

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::trace;

use crate::engine::listener::{ListenerId, ListenerRegistry};
use crate::graph::NodeRef;
use crate::value::{NodeFailure, Payload, Timestamp};

/// One value-change notification delivered to listeners.
///
/// `value` mirrors the node's slot: `Ok` with the payload, or `Err` with
/// the originating failures. `timestamp` is the pass that committed the
/// change, or [`Timestamp::CATCH_UP`] when the event replays the current
/// value to a new listener.
#[derive(Clone, Debug)]
pub struct NodeEvent {
    pub node: NodeRef,
    pub value: Result<Payload, NodeFailure>,
    pub timestamp: Timestamp,
}

pub(crate) enum DispatchMessage {
    /// Every change of one pass, in walk order.
    Batch { seq: u64, events: Vec<NodeEvent> },
    /// The current value replayed to one just-registered listener.
    CatchUp {
        listener: ListenerId,
        event: NodeEvent,
    },
}

/// Owns the dispatcher thread and the channel feeding it.
pub(crate) struct EventDispatcher {
    sender: Option<mpsc::UnboundedSender<DispatchMessage>>,
    worker: Option<JoinHandle<()>>,
    thread: ThreadId,
}

impl EventDispatcher {
    pub(crate) fn spawn(registry: Arc<ListenerRegistry>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("rivulet-dispatch".to_string())
            .spawn(move || run(registry, receiver))
            .expect("spawning the dispatcher thread");
        let thread = worker.thread().id();
        EventDispatcher {
            sender: Some(sender),
            worker: Some(worker),
            thread,
        }
    }

    pub(crate) fn send(&self, message: DispatchMessage) {
        if let Some(sender) = &self.sender {
            // Failure means the worker is gone, which only happens while
            // the engine itself is being torn down.
            let _ = sender.send(message);
        }
    }

    /// The dispatcher thread's id, for re-entrancy checks.
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.thread {
                let _ = worker.join();
            }
        }
    }
}

fn run(registry: Arc<ListenerRegistry>, mut receiver: mpsc::UnboundedReceiver<DispatchMessage>) {
    while let Some(message) = receiver.blocking_recv() {
        match message {
            DispatchMessage::Batch { seq, events } => {
                trace!(seq, events = events.len(), "delivering pass batch");
                for event in &events {
                    for entry in registry.listeners_for(&event.node.target) {
                        if seq < entry.min_seq {
                            continue;
                        }
                        entry.deliver(event);
                    }
                }
            }
            DispatchMessage::CatchUp { listener, event } => {
                if let Some(entry) = registry.get(listener) {
                    entry.deliver(&event);
                }
            }
        }
    }
}
