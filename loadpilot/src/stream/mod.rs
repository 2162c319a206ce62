//! Glass door: live visibility into running workflows
//!
//! Every event is written to the durable per-run log first and
//! broadcast second, under a per-run lock. Subscribing takes the same
//! lock to read the backlog and register the receiver, so an observer
//! who joins mid-run sees the full history followed by live events
//! with no gap and no duplicate at the boundary.
//!
//! Channels are bounded. A subscriber that falls too far behind
//! observes a lag error and must reconnect with a replay from its last
//! acknowledged sequence number; slow consumers never stall a run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::db::{Database, StoreError};
use crate::events::{EventDraft, StreamEvent};

/// Per-run channel capacity; a subscriber this far behind is lagged
pub const CHANNEL_CAPACITY: usize = 256;

type Topic = Arc<Mutex<broadcast::Sender<StreamEvent>>>;

/// Fan-out hub for run event streams
#[derive(Clone)]
pub struct GlassDoor {
    db: Database,
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl GlassDoor {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn topic(&self, run_id: &str) -> Topic {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(run_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(Mutex::new(tx))
            })
            .clone()
    }

    /// Durably append an event, then broadcast it to live subscribers
    ///
    /// The per-run lock is held across both so sequence numbers reach
    /// subscribers in order. A send with no receivers is not an error.
    pub fn publish(&self, run_id: &str, draft: EventDraft) -> Result<StreamEvent, StoreError> {
        let topic = self.topic(run_id);
        let tx = topic.lock().unwrap();

        let event = self.db.append_event(run_id, &draft)?;
        let _ = tx.send(event.clone());

        Ok(event)
    }

    /// Join a run's stream: replay everything after `after_seq`, then
    /// receive live
    ///
    /// The backlog read and receiver registration happen under the
    /// publish lock, so no event can land between them.
    pub fn subscribe(
        &self,
        run_id: &str,
        after_seq: u64,
    ) -> Result<(Vec<StreamEvent>, broadcast::Receiver<StreamEvent>), StoreError> {
        let topic = self.topic(run_id);
        let tx = topic.lock().unwrap();

        let backlog = self.db.events_after(run_id, after_seq)?;
        let rx = tx.subscribe();

        Ok((backlog, rx))
    }

    /// Drop the live channel for a finished run
    ///
    /// Existing receivers see the channel close after draining; the
    /// durable log remains readable forever.
    pub fn retire(&self, run_id: &str) {
        let mut topics = self.topics.lock().unwrap();
        topics.remove(run_id);
    }
}
