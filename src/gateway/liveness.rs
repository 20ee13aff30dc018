//! Dead-device detection.
//!
//! Battery sensors report at least once an hour, so a device that stays
//! silent for [`LIVENESS_WINDOW`] is declared dead. Each device has at most one
//! pending expiration; touching it cancels the old one and schedules a new one.

use serde_json::Value;
use std::collections::HashMap;
use std::future::poll_fn;
use std::task::{Context, Poll};
use tokio::time::Duration;
use tokio_util::time::{delay_queue::Key, DelayQueue};
use tracing::trace;

use super::Sid;

pub const LIVENESS_WINDOW: Duration = Duration::from_secs(80 * 60);

/// What the dead-state envelope needs to describe an expired device.
#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub sid: Sid,
    pub model: Option<String>,
    pub short_id: Option<Value>,
}

#[derive(Debug)]
pub struct LivenessTracker {
    window: Duration,
    queue: DelayQueue<Expired>,
    keys: HashMap<Sid, Key>,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(LIVENESS_WINDOW)
    }
}

impl LivenessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    /// (Re)arms the expiration for `sid`. Must be called from within a tokio
    /// runtime.
    pub fn touch(&mut self, sid: &str, model: Option<&str>, short_id: Option<&Value>) {
        if let Some(key) = self.keys.remove(sid) {
            self.queue.try_remove(&key);
        }
        let key = self.queue.insert(
            Expired {
                sid: sid.to_string(),
                model: model.map(str::to_string),
                short_id: short_id.cloned(),
            },
            self.window,
        );
        self.keys.insert(sid.to_string(), key);
        trace!("Liveness timer for {} armed, {} pending", sid, self.keys.len());
    }

    pub fn pending(&self) -> usize {
        self.keys.len()
    }

    pub fn is_armed(&self, sid: &str) -> bool {
        self.keys.contains_key(sid)
    }

    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<Expired>> {
        match self.queue.poll_expired(cx) {
            Poll::Ready(Some(entry)) => {
                let expired = entry.into_inner();
                self.keys.remove(&expired.sid);
                Poll::Ready(Some(expired))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Resolves with the next expired device, or `None` right away when no
    /// timer is pending.
    pub async fn next_expired(&mut self) -> Option<Expired> {
        poll_fn(|cx| self.poll_expired(cx)).await
    }
}
