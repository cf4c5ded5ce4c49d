//! Operation log and its tailer.
//!
//! A store with log tailing appends one [`OplogEntry`] per document write.
//! The [`OplogHandle`] tails the log on a background task and fans every
//! entry out through its own crossbar, with the notification
//! `{collection, id, op}` (no `id` for collection drops). Entries lost to a
//! lagging tailer are reported to the skipped-entries listeners instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use livedata_core::{Document, DocumentId, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::crossbar::{Crossbar, ListenHandle, Notification};

/// How an update was recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OplogUpdate {
    /// The whole document was replaced.
    Replace { doc: Document },
    /// Field-level modification.
    Modifier {
        #[serde(default)]
        set: Document,
        #[serde(default)]
        unset: Vec<String>,
    },
}

/// A logical operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OplogOp {
    Insert { doc: Document },
    Update { id: DocumentId, update: OplogUpdate },
    Remove { id: DocumentId },
    DropCollection,
}

/// One entry of the operation log. `ts` increases monotonically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: u64,
    pub collection: String,
    #[serde(flatten)]
    pub op: OplogOp,
}

impl OplogEntry {
    /// Returns the id of the affected document, if the entry has one.
    pub fn id(&self) -> Option<DocumentId> {
        match &self.op {
            OplogOp::Insert { doc } => DocumentId::of(doc).ok(),
            OplogOp::Update { id, .. } | OplogOp::Remove { id } => Some(id.clone()),
            OplogOp::DropCollection => None,
        }
    }

    /// Builds the crossbar notification announcing this entry.
    pub fn to_notification(&self) -> Result<Notification> {
        let mut notification = Notification::new();
        notification.insert("collection".into(), Value::String(self.collection.clone()));
        if let Some(id) = self.id() {
            notification.insert("id".into(), id.to_value());
        }
        if matches!(self.op, OplogOp::DropCollection) {
            notification.insert("dropCollection".into(), Value::Bool(true));
        }
        notification.insert("op".into(), serde_json::to_value(self)?);
        Ok(notification)
    }

    /// Recovers the entry carried by a notification.
    pub fn from_notification(notification: &Notification) -> Result<Self> {
        let op = notification
            .get("op")
            .ok_or_else(|| Error::malformed("oplog notification without op"))?;
        Ok(serde_json::from_value(op.clone())?)
    }
}

/// Write side of the log, owned by the store.
pub(crate) struct OplogWriter {
    sender: broadcast::Sender<OplogEntry>,
    last_ts: Arc<AtomicU64>,
}

impl OplogWriter {
    /// Appends an entry. Must be called in write order.
    pub(crate) fn append(&self, collection: &str, op: OplogOp) {
        let ts = self.last_ts.load(Ordering::SeqCst) + 1;
        let entry = OplogEntry {
            ts,
            collection: collection.to_string(),
            op,
        };
        // no receivers only means nobody tails
        let _ = self.sender.send(entry);
        self.last_ts.store(ts, Ordering::SeqCst);
    }
}

struct HandleInner {
    entries: Crossbar,
    skipped: Crossbar,
    last_ts: Arc<AtomicU64>,
    processed: watch::Receiver<u64>,
    tailer: JoinHandle<()>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.tailer.abort();
    }
}

/// Tailer of a store's operation log. Cloning is cheap.
#[derive(Clone)]
pub struct OplogHandle {
    inner: Arc<HandleInner>,
}

impl OplogHandle {
    /// Creates the log and starts tailing it. Must be called within a tokio
    /// runtime.
    pub(crate) fn start(capacity: usize) -> (OplogWriter, OplogHandle) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        let last_ts = Arc::new(AtomicU64::new(0));
        let (processed_tx, processed) = watch::channel(0u64);
        let entries = Crossbar::new();
        let skipped = Crossbar::new();

        let tailer = tokio::spawn(tail(receiver, entries.clone(), skipped.clone(), processed_tx));

        let writer = OplogWriter {
            sender,
            last_ts: last_ts.clone(),
        };
        let handle = OplogHandle {
            inner: Arc::new(HandleInner {
                entries,
                skipped,
                last_ts,
                processed,
                tailer,
            }),
        };
        (writer, handle)
    }

    /// Calls `callback` for every entry matching `trigger`
    /// (`{collection}` or `{collection, id}`).
    pub fn on_oplog_entry<F>(&self, trigger: Value, callback: F) -> Result<ListenHandle>
    where
        F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.entries.listen(trigger, callback)
    }

    /// Calls `callback` whenever the tailer fell behind and lost entries.
    pub fn on_skipped_entries<F>(&self, callback: F) -> Result<ListenHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.skipped.listen(json!({}), move |_| {
            callback();
            Ok(())
        })
    }

    /// Returns the timestamp of the last entry dispatched to listeners.
    pub fn last_processed(&self) -> u64 {
        *self.inner.processed.borrow()
    }

    /// Waits until every entry appended before this call has been
    /// dispatched to listeners.
    pub async fn wait_until_caught_up(&self) -> Result<()> {
        let target = self.inner.last_ts.load(Ordering::SeqCst);
        let mut processed = self.inner.processed.clone();
        processed
            .wait_for(|ts| *ts >= target)
            .await
            .map(|_| ())
            .map_err(|_| Error::stopped("oplog tailer"))
    }
}

async fn tail(
    mut receiver: broadcast::Receiver<OplogEntry>,
    entries: Crossbar,
    skipped: Crossbar,
    processed: watch::Sender<u64>,
) {
    loop {
        match receiver.recv().await {
            Ok(entry) => {
                match entry.to_notification() {
                    Ok(notification) => entries.fire_notification(&notification),
                    Err(err) => log::error!("unencodable oplog entry {}: {}", entry.ts, err),
                }
                processed.send_replace(entry.ts);
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                log::warn!("oplog tailer fell behind, {} entries skipped", count);
                skipped.fire_notification(&Notification::new());
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("oplog closed, tailer exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_core::value::to_document;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_entry_notification_round_trip() {
        let entry = OplogEntry {
            ts: 7,
            collection: "docs".into(),
            op: OplogOp::Update {
                id: "a".into(),
                update: OplogUpdate::Modifier {
                    set: to_document(json!({"status": "open"})).unwrap(),
                    unset: vec!["old".into()],
                },
            },
        };
        let notification = entry.to_notification().unwrap();
        assert_eq!(notification["collection"], json!("docs"));
        assert_eq!(notification["id"], json!("a"));
        assert_eq!(OplogEntry::from_notification(&notification).unwrap(), entry);
    }

    #[test]
    fn test_drop_notification_has_no_id() {
        let entry = OplogEntry {
            ts: 1,
            collection: "docs".into(),
            op: OplogOp::DropCollection,
        };
        let notification = entry.to_notification().unwrap();
        assert!(!notification.contains_key("id"));
        assert_eq!(notification["dropCollection"], json!(true));
    }

    #[tokio::test]
    async fn test_tailer_dispatches_in_order() {
        let (writer, handle) = OplogHandle::start(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _listener = handle
            .on_oplog_entry(json!({"collection": "docs"}), move |n| {
                s.lock().push(OplogEntry::from_notification(n)?.ts);
                Ok(())
            })
            .unwrap();

        for i in 0..3 {
            writer.append("docs", OplogOp::Remove { id: format!("d{}", i).into() });
        }
        writer.append("other", OplogOp::DropCollection);

        handle.wait_until_caught_up().await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(handle.last_processed(), 4);
    }

    #[tokio::test]
    async fn test_lagging_tailer_reports_skipped_entries() {
        let (writer, handle) = OplogHandle::start(2);
        let skips = Arc::new(AtomicUsize::new(0));
        let s = skips.clone();
        let _listener = handle
            .on_skipped_entries(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // current-thread runtime: the tailer cannot run until we yield
        for i in 0..10 {
            writer.append("docs", OplogOp::Remove { id: format!("d{}", i).into() });
        }
        handle.wait_until_caught_up().await.unwrap();
        assert!(skips.load(Ordering::SeqCst) >= 1);
    }
}
