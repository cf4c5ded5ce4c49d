//! Sessions, publications and methods end to end over in-memory stores.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livedata_core::protocol::ServerMessage;
use livedata_core::value::to_document;
use livedata_core::{Document, DocumentId, Error, Result};
use livedata_query::CursorDescription;
use livedata_reactive::{ClientStore, Tracker};
use livedata_server::{MethodInvocation, Publish, Server, ServerConfig, Session};
use livedata_storage::{
    Crossbar, DocumentStore, MemoryStore, StoreCapabilities, UpdateOptions, UpdateOutcome,
    DEFAULT_OPLOG_CAPACITY,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn doc(value: Value) -> Document {
    to_document(value).unwrap()
}

async fn connect(server: &Server) -> (Session, UnboundedReceiver<ServerMessage>) {
    let (session, mut rx) = server.connect();
    session.handle_frame(r#"{"msg":"connect","version":"1"}"#).await;
    assert!(matches!(rx.recv().await, Some(ServerMessage::Connected { .. })));
    (session, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn register_open_docs(server: &Server) {
    server
        .publish("open", |_, _| async {
            Ok::<_, Error>(Publish::Cursors(vec![CursorDescription::new(
                "docs",
                json!({"status": "open"}),
            )]))
        })
        .unwrap();
    server
        .method("reopen", |invocation: MethodInvocation, params: Vec<Value>| async move {
            let id = params.first().cloned().unwrap_or(Value::Null);
            let outcome = invocation
                .update(
                    "docs",
                    &json!({"_id": id}),
                    &json!({"$set": {"status": "open"}}),
                    UpdateOptions::default(),
                )
                .await?;
            Ok::<_, Error>(json!(outcome.matched))
        })
        .unwrap();
}

#[tokio::test]
async fn test_partial_update_reaches_other_client_before_updated() {
    init_logger();
    let store = Arc::new(MemoryStore::with_oplog(DEFAULT_OPLOG_CAPACITY));
    store
        .insert("docs", doc(json!({"_id": "d1", "status": "closed", "title": "t"})))
        .await
        .unwrap();
    let server = Server::new(store.clone(), ServerConfig::default());
    register_open_docs(&server);

    let (watcher, mut watcher_rx) = connect(&server).await;
    watcher.handle_frame(r#"{"msg":"sub","id":"s1","name":"open"}"#).await;
    assert_eq!(
        drain(&mut watcher_rx),
        vec![ServerMessage::Ready {
            subs: vec!["s1".into()]
        }]
    );

    let (writer, mut writer_rx) = connect(&server).await;
    writer
        .handle_frame(r#"{"msg":"method","id":"m1","method":"reopen","params":["d1"]}"#)
        .await;
    assert!(matches!(
        writer_rx.recv().await,
        Some(ServerMessage::Result { result: Some(_), error: None, .. })
    ));
    assert_eq!(
        writer_rx.recv().await,
        Some(ServerMessage::Updated {
            methods: vec!["m1".into()]
        })
    );

    // the fence only fired once the watcher had been told
    assert_eq!(
        drain(&mut watcher_rx),
        vec![ServerMessage::Added {
            collection: "docs".into(),
            id: "d1".into(),
            fields: doc(json!({"status": "open", "title": "t"})),
        }]
    );
    assert_eq!(
        watcher.document("docs", &"d1".into()),
        Some(doc(json!({"status": "open", "title": "t"})))
    );
}

#[tokio::test]
async fn test_identical_subscriptions_share_one_observer() {
    init_logger();
    let store = Arc::new(MemoryStore::with_oplog(DEFAULT_OPLOG_CAPACITY));
    store
        .insert("docs", doc(json!({"_id": "d1", "status": "open"})))
        .await
        .unwrap();
    let server = Server::new(store.clone(), ServerConfig::default());
    register_open_docs(&server);

    let (a, mut a_rx) = connect(&server).await;
    let (b, mut b_rx) = connect(&server).await;
    a.handle_frame(r#"{"msg":"sub","id":"s1","name":"open"}"#).await;
    b.handle_frame(r#"{"msg":"sub","id":"s1","name":"open"}"#).await;
    assert_eq!(server.registry().live_query_count(), 1);
    assert_eq!(drain(&mut a_rx).len(), 2);
    assert_eq!(drain(&mut b_rx).len(), 2);

    drop(a);
    assert_eq!(server.registry().live_query_count(), 1);
    b.handle_frame(r#"{"msg":"unsub","id":"s1"}"#).await;
    assert_eq!(server.registry().live_query_count(), 0);
}

#[tokio::test]
async fn test_overlapping_subscriptions_merge_fields() {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    store
        .insert("docs", doc(json!({"_id": "d1", "status": "open", "secret": 42})))
        .await
        .unwrap();
    let server = Server::new(store.clone(), ServerConfig::default());
    server
        .publish("titles", |_, _| async {
            Ok::<_, Error>(Publish::Cursors(vec![CursorDescription::new("docs", json!({}))
                .with_fields(json!({"secret": 0}))]))
        })
        .unwrap();
    server
        .publish("everything", |_, _| async {
            Ok::<_, Error>(Publish::Cursors(vec![CursorDescription::new("docs", json!({}))]))
        })
        .unwrap();

    let (session, mut rx) = connect(&server).await;
    session.handle_frame(r#"{"msg":"sub","id":"s1","name":"titles"}"#).await;
    session.handle_frame(r#"{"msg":"sub","id":"s2","name":"everything"}"#).await;
    let msgs = drain(&mut rx);
    assert!(matches!(msgs[0], ServerMessage::Added { .. }));
    assert_eq!(msgs[1], ServerMessage::Ready { subs: vec!["s1".into()] });
    assert_eq!(
        msgs[2],
        ServerMessage::Changed {
            collection: "docs".into(),
            id: "d1".into(),
            fields: doc(json!({"secret": 42})),
            cleared: Vec::new(),
        }
    );

    session.handle_frame(r#"{"msg":"unsub","id":"s2"}"#).await;
    assert_eq!(
        drain(&mut rx),
        vec![
            ServerMessage::Changed {
                collection: "docs".into(),
                id: "d1".into(),
                fields: Document::new(),
                cleared: vec!["secret".into()],
            },
            ServerMessage::Nosub { id: "s2".into(), error: None },
        ]
    );
    assert_eq!(
        session.document("docs", &"d1".into()),
        Some(doc(json!({"status": "open"})))
    );
}

#[tokio::test]
async fn test_sorted_window_publishes_positions() {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    for (id, n) in [("a", 3), ("b", 1), ("c", 2)] {
        store.insert("docs", doc(json!({"_id": id, "n": n}))).await.unwrap();
    }
    let config = ServerConfig {
        polling_throttle_ms: 10,
        ..ServerConfig::default()
    };
    let server = Server::new(store.clone(), config);
    server
        .publish("top", |_, _| async {
            Ok::<_, Error>(Publish::Cursors(vec![CursorDescription::new("docs", json!({}))
                .with_sort(json!({"n": 1}))
                .with_limit(2)]))
        })
        .unwrap();

    let (session, mut rx) = connect(&server).await;
    session.handle_frame(r#"{"msg":"sub","id":"s1","name":"top"}"#).await;
    let ids: Vec<(String, Option<String>)> = drain(&mut rx)
        .into_iter()
        .filter_map(|msg| match msg {
            ServerMessage::AddedBefore { id, before, .. } => {
                Some((id.as_str().to_string(), before.map(|b| b.as_str().to_string())))
            }
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec![("b".to_string(), None), ("c".to_string(), None)]);

    store.remove("docs", &json!({"_id": "b"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let msgs = drain(&mut rx);
    assert!(msgs.contains(&ServerMessage::Removed {
        collection: "docs".into(),
        id: "b".into()
    }));
    assert!(msgs.contains(&ServerMessage::AddedBefore {
        collection: "docs".into(),
        id: "a".into(),
        fields: doc(json!({"n": 3})),
        before: None,
    }));
}

/// Store whose queries always fail.
struct BrokenStore {
    inner: MemoryStore,
}

#[async_trait]
impl DocumentStore for BrokenStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    fn invalidation_crossbar(&self) -> &Crossbar {
        self.inner.invalidation_crossbar()
    }

    async fn find(&self, _cursor: &CursorDescription) -> Result<Vec<Document>> {
        Err(Error::store("disk is gone"))
    }

    async fn find_one(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        self.inner.find_one(collection, id).await
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<DocumentId> {
        self.inner.insert(collection, doc).await
    }

    async fn update(
        &self,
        collection: &str,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        self.inner.update(collection, selector, modifier, options).await
    }

    async fn remove(&self, collection: &str, selector: &Value) -> Result<usize> {
        self.inner.remove(collection, selector).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.inner.drop_collection(collection).await
    }
}

#[tokio::test]
async fn test_failed_query_stops_subscription_with_error() {
    init_logger();
    for store in [
        BrokenStore { inner: MemoryStore::new() },
        BrokenStore { inner: MemoryStore::with_oplog(DEFAULT_OPLOG_CAPACITY) },
    ] {
        let server = Server::new(Arc::new(store), ServerConfig::default());
        register_open_docs(&server);
        let (session, mut rx) = connect(&server).await;
        session.handle_frame(r#"{"msg":"sub","id":"s1","name":"open"}"#).await;

        match rx.recv().await {
            Some(ServerMessage::Nosub { id, error: Some(error) }) => {
                assert_eq!(id, "s1");
                assert_eq!(error.error, json!(500));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(server.registry().live_query_count(), 0);
    }
}

#[tokio::test]
async fn test_client_stub_predicts_inserted_id() {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let server = Server::new(store.clone(), ServerConfig::default());
    server
        .publish("tasks", |_, _| async {
            Ok::<_, Error>(Publish::Cursors(vec![CursorDescription::new("tasks", json!({}))]))
        })
        .unwrap();
    server
        .method("addTask", |invocation: MethodInvocation, params: Vec<Value>| async move {
            let title = params.first().cloned().unwrap_or(Value::Null);
            let id = invocation
                .insert("tasks", doc(json!({"title": title, "owner": "server"})))
                .await?;
            Ok::<_, Error>(id.to_value())
        })
        .unwrap();

    let client = ClientStore::new(Tracker::new());
    client.subscribe("tasks", Vec::new());
    let predicted = Rc::new(RefCell::new(None));
    let outcome = Rc::new(RefCell::new(None));
    let (p, o) = (predicted.clone(), outcome.clone());
    client.call_with_stub(
        "addTask",
        vec![json!("write docs")],
        move |ctx, params| {
            *p.borrow_mut() = Some(ctx.insert("tasks", doc(json!({"title": params[0]})))?);
            Ok(())
        },
        move |result| *o.borrow_mut() = Some(result),
    );
    let id = predicted.borrow().clone().unwrap();
    assert!(client.collection("tasks").get(&id).is_some());

    let (session, mut rx) = connect(&server).await;
    for msg in client.take_outgoing() {
        session.handle_message(msg).await;
    }
    let mut batch = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let done = matches!(msg, ServerMessage::Updated { .. });
        batch.push(msg);
        if done {
            break;
        }
    }
    client.apply_batch(batch).unwrap();

    assert_eq!(*outcome.borrow(), Some(Ok(Some(id.to_value()))));
    let stored = store.find_one("tasks", &id).await.unwrap();
    assert_eq!(stored.as_ref().map(|d| d["owner"].clone()), Some(json!("server")));
    assert_eq!(client.collection("tasks").get(&id), stored);
    assert_eq!(client.collection("tasks").len(), 1);
}
