//! Periodic "hot content" push: a handful of featured Q&A entries, one at a
//! time, over a long-lived connection.

use crate::bridge::{EventSender, RelayStream, WorkerPool, relay_channel};
use crate::error::SourceError;
use crate::protocol::WireEvent;
use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ITEMS_PER_ROUND: usize = 3;
const EMPTY_MESSAGE: &str = "no recommended content yet";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotItem {
    /// Sent as a string; browsers lose precision on large ids.
    #[serde(serialize_with = "id_as_string")]
    pub id: i64,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub is_hot: u8,
    #[serde(default)]
    pub view_count: u32,
}

fn id_as_string<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

#[async_trait]
pub trait HotContentSource: Send + Sync {
    async fn hot_items(&self) -> Result<Vec<HotItem>, SourceError>;
}

/// Entries loaded once at startup; only those flagged hot are served.
#[derive(Debug, Default)]
pub struct StaticHotContent {
    items: Vec<HotItem>,
}

impl StaticHotContent {
    pub fn new(items: Vec<HotItem>) -> Self {
        Self { items }
    }

    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)?;
        let items: Vec<HotItem> = serde_json::from_str(&raw)?;
        Ok(Self::new(items))
    }
}

#[async_trait]
impl HotContentSource for StaticHotContent {
    async fn hot_items(&self) -> Result<Vec<HotItem>, SourceError> {
        Ok(self
            .items
            .iter()
            .filter(|item| item.is_hot == 1)
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct HotFeed {
    source: Arc<dyn HotContentSource>,
    workers: Arc<WorkerPool>,
    interval: Duration,
    capacity: usize,
}

impl HotFeed {
    pub fn new(
        source: Arc<dyn HotContentSource>,
        workers: Arc<WorkerPool>,
        interval: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            source,
            workers,
            interval,
            capacity,
        }
    }

    /// Starts one push round on the worker pool.
    pub fn open(&self) -> RelayStream {
        let (sender, stream) = relay_channel(self.capacity);
        let source = Arc::clone(&self.source);
        let interval = self.interval;

        self.workers.spawn(async move {
            let cancel = sender.cancellation_token();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => debug!("hot content push cancelled"),
                _ = push_round(source.as_ref(), sender, interval) => {}
            }
        });

        stream
    }
}

async fn push_round(source: &dyn HotContentSource, mut sender: EventSender, interval: Duration) {
    let items = match source.hot_items().await {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "hot content source failed");
            let payload = json!({"type": "error", "message": err.to_string()});
            sender.fail(payload.to_string()).await;
            return;
        }
    };

    if items.is_empty() {
        let payload = json!({"type": "empty", "message": EMPTY_MESSAGE});
        if sender.send(WireEvent::message(payload.to_string())).await.is_continue() {
            let _ = sender.send(WireEvent::done()).await;
        }
        return;
    }

    let selected = pick_round(items, &mut rand::rng());
    debug!(count = selected.len(), "pushing hot content");

    for (index, item) in selected.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(interval).await;
        }
        let payload = match serde_json::to_string(item) {
            Ok(payload) => payload,
            Err(err) => {
                sender.fail(err.to_string()).await;
                return;
            }
        };
        if sender.send(WireEvent::message(payload)).await.is_break() {
            return;
        }
    }

    let _ = sender.send(WireEvent::done()).await;
}

/// Between one and three entries, in random order, never more than exist.
pub fn pick_round<R: Rng>(mut items: Vec<HotItem>, rng: &mut R) -> Vec<HotItem> {
    let count = rng.random_range(1..=MAX_ITEMS_PER_ROUND).min(items.len());
    items.shuffle(rng);
    items.truncate(count);
    items
}
