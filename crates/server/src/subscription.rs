//! Running subscriptions and the context handed to publish functions.

use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use livedata_core::{ChangedFields, Document, DocumentId, Error, ObserveEvent, Result};
use livedata_query::CursorDescription;
use parking_lot::Mutex;

use crate::observe::{EventSink, ObserveHandle, ObserveRegistry};
use crate::publication::SubscriptionView;
use crate::session::SessionInner;

type StopCallback = Box<dyn FnOnce() + Send>;

struct SubState {
    views: HashMap<String, SubscriptionView>,
    ready: bool,
    stopped: bool,
    handles: Vec<ObserveHandle>,
    on_stop: Vec<StopCallback>,
}

/// One `sub` of one session.
pub(crate) struct Subscription {
    id: String,
    name: String,
    session: Weak<SessionInner>,
    registry: Arc<ObserveRegistry>,
    state: Mutex<SubState>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        name: String,
        session: Weak<SessionInner>,
        registry: Arc<ObserveRegistry>,
    ) -> Self {
        Self {
            id,
            name,
            session,
            registry,
            state: Mutex::new(SubState {
                views: HashMap::new(),
                ready: false,
                stopped: false,
                handles: Vec::new(),
                on_stop: Vec::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Records `event` in the subscription's view of `collection` and
    /// forwards whatever the client has not seen yet to the session.
    fn deliver(&self, collection: &str, event: ObserveEvent) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }
        let view = state
            .views
            .entry(collection.to_string())
            .or_insert_with(|| SubscriptionView::new(false));
        let outgoing = match event {
            ObserveEvent::Added { id, fields } => view.added(id, fields),
            ObserveEvent::AddedBefore { id, fields, before } => view.added_before(id, fields, before)?,
            ObserveEvent::Changed { id, fields } => view.apply_changes(&id, &fields)?,
            ObserveEvent::MovedBefore { id, before } => view.moved_before(&id, before)?,
            ObserveEvent::Removed { id } => view.removed(&id),
        };
        match outgoing {
            Some(event) => session.apply(&self.id, collection, event),
            None => Ok(()),
        }
    }

    /// Reports a delivery failure. Runs on a separate task since sinks may
    /// be called while their driver is locked.
    fn fail(&self, err: Error) {
        log::error!("subscription {} ({}) failed: {}", self.id, self.name, err);
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    session.stop_subscription(&id, Some(&err));
                });
            }
            Err(_) => session.stop_subscription(&id, Some(&err)),
        }
    }

    fn sink(self: &Arc<Self>, collection: String) -> EventSink {
        let subscription = Arc::downgrade(self);
        Arc::new(move |event: &ObserveEvent| {
            if let Some(subscription) = subscription.upgrade() {
                if let Err(err) = subscription.deliver(&collection, event.clone()) {
                    subscription.fail(err);
                }
            }
        })
    }

    fn ensure_view(&self, collection: &str, ordered: bool) {
        self.state
            .lock()
            .views
            .entry(collection.to_string())
            .or_insert_with(|| SubscriptionView::new(ordered));
    }

    fn add_handle(&self, handle: ObserveHandle) {
        let rejected = {
            let mut state = self.state.lock();
            if state.stopped {
                Some(handle)
            } else {
                state.handles.push(handle);
                None
            }
        };
        if let Some(handle) = rejected {
            handle.stop();
        }
    }

    /// Stops observing and returns what had been published, so the session
    /// can withdraw it.
    pub(crate) fn deactivate(&self) -> HashMap<String, SubscriptionView> {
        let (views, handles, callbacks) = {
            let mut state = self.state.lock();
            if state.stopped {
                return HashMap::new();
            }
            state.stopped = true;
            (
                std::mem::take(&mut state.views),
                std::mem::take(&mut state.handles),
                std::mem::take(&mut state.on_stop),
            )
        };
        for handle in handles {
            handle.stop();
        }
        for callback in callbacks {
            callback();
        }
        log::debug!("deactivated subscription {} ({})", self.id, self.name);
        views
    }
}

/// Handle given to publish functions.
///
/// Manual publications push documents through [`added`](Self::added),
/// [`changed`](Self::changed) and [`removed`](Self::removed) and call
/// [`ready`](Self::ready) themselves.
#[derive(Clone)]
pub struct PublishContext {
    subscription: Arc<Subscription>,
}

impl PublishContext {
    pub(crate) fn new(subscription: Arc<Subscription>) -> Self {
        Self { subscription }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription.id
    }

    pub fn name(&self) -> &str {
        &self.subscription.name
    }

    pub fn added(&self, collection: &str, id: DocumentId, fields: Document) -> Result<()> {
        self.subscription
            .deliver(collection, ObserveEvent::Added { id, fields })
    }

    /// Fails with an invariant violation if `id` was not published.
    pub fn changed(&self, collection: &str, id: DocumentId, fields: ChangedFields) -> Result<()> {
        self.subscription
            .deliver(collection, ObserveEvent::Changed { id, fields })
    }

    pub fn removed(&self, collection: &str, id: DocumentId) -> Result<()> {
        self.subscription
            .deliver(collection, ObserveEvent::Removed { id })
    }

    /// Tells the client the initial documents are all there. Only the first
    /// call has an effect.
    pub fn ready(&self) {
        let Some(session) = self.subscription.session.upgrade() else {
            return;
        };
        let mut state = self.subscription.state.lock();
        if state.stopped || state.ready {
            return;
        }
        state.ready = true;
        session.send_ready(&self.subscription.id);
    }

    /// Stops the subscription and reports `err` to the client.
    pub fn error(&self, err: Error) {
        if self.is_stopped() {
            return;
        }
        log::warn!(
            "subscription {} ({}) stopped with an error: {}",
            self.subscription.id,
            self.subscription.name,
            err
        );
        if let Some(session) = self.subscription.session.upgrade() {
            session.stop_subscription(&self.subscription.id, Some(&err));
        }
    }

    /// Stops the subscription from the server side.
    pub fn stop(&self) {
        if let Some(session) = self.subscription.session.upgrade() {
            session.stop_subscription(&self.subscription.id, None);
        }
    }

    /// Registers `f` to run when the subscription stops; runs it right away
    /// if it already has.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.subscription.state.lock();
        if state.stopped {
            drop(state);
            f();
        } else {
            state.on_stop.push(Box::new(f));
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.subscription.state.lock().stopped
    }

    pub fn is_ready(&self) -> bool {
        self.subscription.state.lock().ready
    }

    /// Publishes live queries, at most one per collection. Returns once
    /// every initial result set has been delivered.
    pub async fn publish_cursors(&self, cursors: &[CursorDescription]) -> Result<()> {
        let mut collections = HashSet::new();
        for cursor in cursors {
            if !collections.insert(cursor.collection.as_str()) {
                return Err(Error::malformed(format!(
                    "publication {} returned more than one cursor for collection {}",
                    self.subscription.name, cursor.collection
                )));
            }
        }

        for cursor in cursors {
            let ordered = cursor.is_ordered();
            self.subscription.ensure_view(&cursor.collection, ordered);
            let sink = self.subscription.sink(cursor.collection.clone());
            let handle = self
                .subscription
                .registry
                .observe_changes(cursor, ordered, sink)
                .await?;
            self.subscription.add_handle(handle);
        }
        Ok(())
    }
}
