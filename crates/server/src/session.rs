//! One client connection.
//!
//! A [`Session`] consumes parsed client messages and emits server messages
//! on an unbounded channel; moving frames over an actual transport is left
//! to the caller. Messages are handled one at a time, in arrival order.

use std::sync::Arc;

use hashbrown::HashMap;
use livedata_core::protocol::{ClientMessage, ErrorPayload, ServerMessage, PROTOCOL_VERSION};
use livedata_core::{Document, DocumentId, Error, ObserveEvent, Result};
use livedata_random::RandomScope;
use livedata_storage::{with_fence, WriteFence};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::method::MethodInvocation;
use crate::publication::SubscriptionView;
use crate::server::{Publish, ServerInner};
use crate::session_view::SessionCollectionView;
use crate::subscription::{PublishContext, Subscription};

struct SessionState {
    connected: bool,
    closed: bool,
    views: HashMap<String, SessionCollectionView>,
    subscriptions: HashMap<String, Arc<Subscription>>,
}

pub(crate) struct SessionInner {
    id: String,
    server: Arc<ServerInner>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    pub(crate) fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).is_err() {
            log::debug!("session {}: receiver gone, dropping message", self.id);
        }
    }

    pub(crate) fn send_ready(&self, subscription: &str) {
        self.send(ServerMessage::Ready {
            subs: vec![subscription.to_string()],
        });
    }

    /// Merges a subscription's event into the client's view and sends the
    /// resulting message, if any.
    pub(crate) fn apply(&self, subscription: &str, collection: &str, event: ObserveEvent) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let view = state
            .views
            .entry(collection.to_string())
            .or_insert_with(|| SessionCollectionView::new(collection));
        let msg = match event {
            ObserveEvent::Added { id, fields } => view.added(subscription, id, fields, None),
            ObserveEvent::AddedBefore { id, fields, before } => {
                view.added(subscription, id, fields, Some(before))
            }
            ObserveEvent::Changed { id, fields } => view.changed(subscription, id, &fields)?,
            ObserveEvent::MovedBefore { id, before } => view.moved_before(id, before)?,
            ObserveEvent::Removed { id } => view.removed(subscription, id)?,
        };
        if view.is_empty() {
            state.views.remove(collection);
        }
        if let Some(msg) = msg {
            self.send(msg);
        }
        Ok(())
    }

    /// Stops a subscription, withdraws its documents and answers `nosub`.
    pub(crate) fn stop_subscription(&self, id: &str, error: Option<&Error>) {
        let subscription = self.state.lock().subscriptions.remove(id);
        let Some(subscription) = subscription else {
            return;
        };
        let views = subscription.deactivate();
        self.withdraw(subscription.id(), views);
        self.send(ServerMessage::Nosub {
            id: id.to_string(),
            error: error.map(ErrorPayload::from_error),
        });
    }

    fn withdraw(&self, subscription: &str, views: HashMap<String, SubscriptionView>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        for (collection, published) in views {
            let Some(view) = state.views.get_mut(&collection) else {
                continue;
            };
            for id in published.ids() {
                match view.removed(subscription, id) {
                    Ok(Some(msg)) => self.send(msg),
                    Ok(None) => {}
                    Err(err) => log::error!("session {}: {}", self.id, err),
                }
            }
            if view.is_empty() {
                state.views.remove(&collection);
            }
        }
    }

    fn close(&self) {
        let subscriptions: Vec<Arc<Subscription>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.views.clear();
            state.subscriptions.drain().map(|(_, sub)| sub).collect()
        };
        for subscription in subscriptions {
            subscription.deactivate();
        }
        log::debug!("session {} closed", self.id);
    }

    async fn handle_message(self: &Arc<Self>, msg: ClientMessage) {
        let connected = {
            let state = self.state.lock();
            if state.closed {
                return;
            }
            state.connected
        };

        match msg {
            msg @ ClientMessage::Connect { .. } if connected => {
                self.send_error("Already connected", &msg)
            }
            ClientMessage::Connect { version, .. } => {
                if version == PROTOCOL_VERSION {
                    self.state.lock().connected = true;
                    self.send(ServerMessage::Connected {
                        session: self.id.clone(),
                    });
                } else {
                    self.send(ServerMessage::Failed {
                        version: PROTOCOL_VERSION.to_string(),
                    });
                }
            }
            msg if !connected => self.send_error("Must connect first", &msg),
            ClientMessage::Ping { id } => self.send(ServerMessage::Pong { id }),
            ClientMessage::Pong { .. } => {}
            ClientMessage::Sub { id, name, params } => self.subscribe(id, name, params).await,
            ClientMessage::Unsub { id } => self.stop_subscription(&id, None),
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
            } => self.call_method(id, method, params, random_seed).await,
        }
    }

    fn send_error(&self, reason: &str, offending: &ClientMessage) {
        self.send(ServerMessage::Error {
            reason: reason.to_string(),
            offending_message: offending.to_frame().ok(),
        });
    }

    async fn subscribe(self: &Arc<Self>, id: String, name: String, params: Vec<Value>) {
        if self.state.lock().subscriptions.contains_key(&id) {
            log::debug!("session {}: ignoring duplicate sub {}", self.id, id);
            return;
        }
        let Some(handler) = self.server.publication(&name) else {
            log::debug!("session {}: no publication named {}", self.id, name);
            self.send(ServerMessage::Nosub {
                id,
                error: Some(ErrorPayload::from_error(&Error::PublicationNotFound { name })),
            });
            return;
        };

        let subscription = Arc::new(Subscription::new(
            id.clone(),
            name,
            Arc::downgrade(self),
            self.server.registry().clone(),
        ));
        {
            let mut state = self.state.lock();
            if state.closed || state.subscriptions.contains_key(&id) {
                return;
            }
            state.subscriptions.insert(id, subscription.clone());
        }

        let ctx = PublishContext::new(subscription);
        let published = match handler(ctx.clone(), params).await {
            Ok(Publish::Cursors(cursors)) => ctx.publish_cursors(&cursors).await.map(|()| true),
            Ok(Publish::Manual) => Ok(false),
            Err(err) => Err(err),
        };
        match published {
            Ok(true) => ctx.ready(),
            Ok(false) => {}
            Err(err) => ctx.error(err),
        }
    }

    async fn call_method(
        self: &Arc<Self>,
        id: String,
        method: String,
        params: Vec<Value>,
        random_seed: Option<String>,
    ) {
        let fence = WriteFence::with_warning_timeout(self.server.config().fence_warning_timeout());
        let session = Arc::downgrade(self);
        let method_id = id.clone();
        let registered = fence.on_all_committed(move || {
            if let Some(session) = session.upgrade() {
                session.send(ServerMessage::Updated {
                    methods: vec![method_id],
                });
            }
        });
        if let Err(err) = registered {
            log::error!("session {}: cannot track writes of method {}: {}", self.id, id, err);
        }

        let invocation = MethodInvocation::new(
            method.clone(),
            Some(self.id.clone()),
            Arc::new(RandomScope::new(random_seed)),
            self.server.clone(),
        );
        let outcome = with_fence(fence.clone(), self.server.invoke(&method, invocation, params)).await;
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => {
                log::debug!("session {}: method {} failed: {}", self.id, method, err);
                (None, Some(ErrorPayload::from_error(&err)))
            }
        };
        self.send(ServerMessage::Result { id, result, error });

        let session_id = self.id.clone();
        tokio::spawn(async move {
            let fired = fence.arm_and_wait().await.and_then(|()| fence.retire());
            if let Err(err) = fired {
                log::error!("session {}: write fence of {} failed: {}", session_id, method, err);
            }
        });
    }
}

/// A client connection, closed when dropped.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        server: Arc<ServerInner>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                server,
                outbound,
                state: Mutex::new(SessionState {
                    connected: false,
                    closed: false,
                    views: HashMap::new(),
                    subscriptions: HashMap::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Handles one text frame. Frames that do not parse are answered with
    /// an `error` message and otherwise ignored.
    pub async fn handle_frame(&self, frame: &str) {
        match ClientMessage::parse(frame) {
            Ok(msg) => self.handle_message(msg).await,
            Err(err) => {
                log::debug!("session {}: {}", self.inner.id, err);
                self.inner.send(ServerMessage::Error {
                    reason: err.to_string(),
                    offending_message: Some(frame.to_string()),
                });
            }
        }
    }

    pub async fn handle_message(&self, msg: ClientMessage) {
        self.inner.handle_message(msg).await;
    }

    /// Stops every subscription without notifying the client.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Fields of a document as the client currently sees it.
    pub fn document(&self, collection: &str, id: &DocumentId) -> Option<Document> {
        self.inner
            .state
            .lock()
            .views
            .get(collection)
            .and_then(|view| view.get(id))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}
