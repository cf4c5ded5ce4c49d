//! Method and publication registry, and the entry point for new sessions.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use livedata_core::protocol::ServerMessage;
use livedata_core::{Error, Result};
use livedata_query::CursorDescription;
use livedata_random::{make_rpc_seed, RandomGenerator, RandomScope};
use livedata_storage::DocumentStore;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::method::MethodInvocation;
use crate::observe::ObserveRegistry;
use crate::session::Session;
use crate::subscription::PublishContext;

pub type MethodHandler =
    Arc<dyn Fn(MethodInvocation, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub type PublishHandler =
    Arc<dyn Fn(PublishContext, Vec<Value>) -> BoxFuture<'static, Result<Publish>> + Send + Sync>;

/// What a publish function hands back.
pub enum Publish {
    /// Live queries the server keeps the client in sync with.
    Cursors(Vec<CursorDescription>),
    /// The function drives the [`PublishContext`] itself.
    Manual,
}

pub(crate) struct ServerInner {
    store: Arc<dyn DocumentStore>,
    registry: Arc<ObserveRegistry>,
    config: ServerConfig,
    methods: RwLock<HashMap<String, MethodHandler>>,
    publications: RwLock<HashMap<String, PublishHandler>>,
}

impl ServerInner {
    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn registry(&self) -> &Arc<ObserveRegistry> {
        &self.registry
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn publication(&self, name: &str) -> Option<PublishHandler> {
        self.publications.read().get(name).cloned()
    }

    pub(crate) fn invoke(
        &self,
        name: &str,
        invocation: MethodInvocation,
        params: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value>> {
        let handler = self.methods.read().get(name).cloned();
        match handler {
            Some(handler) => handler(invocation, params),
            None => {
                let name = name.to_string();
                async move { Err(Error::MethodNotFound { name }) }.boxed()
            }
        }
    }
}

/// A live-data server over one document store.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Self {
        let registry = ObserveRegistry::new(store.clone(), config.clone());
        Self {
            inner: Arc::new(ServerInner {
                store,
                registry,
                config,
                methods: RwLock::new(HashMap::new()),
                publications: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers a method. Names are unique.
    pub fn method<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(MethodInvocation, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut methods = self.inner.methods.write();
        if methods.contains_key(name) {
            return Err(Error::malformed(format!("a method named '{}' is already defined", name)));
        }
        let boxed: MethodHandler = Arc::new(move |invocation: MethodInvocation, params: Vec<Value>| {
            handler(invocation, params).boxed()
        });
        methods.insert(name.to_string(), boxed);
        Ok(())
    }

    /// Registers a publication. Names are unique.
    pub fn publish<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(PublishContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Publish>> + Send + 'static,
    {
        let mut publications = self.inner.publications.write();
        if publications.contains_key(name) {
            return Err(Error::malformed(format!(
                "a publication named '{}' is already defined",
                name
            )));
        }
        let boxed: PublishHandler =
            Arc::new(move |ctx: PublishContext, params: Vec<Value>| handler(ctx, params).boxed());
        publications.insert(name.to_string(), boxed);
        Ok(())
    }

    /// Opens a session. Everything the server sends to it arrives on the
    /// returned receiver.
    pub fn connect(&self) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = RandomGenerator::from_entropy().id();
        log::debug!("session {} opened", id);
        (Session::new(id, self.inner.clone(), tx), rx)
    }

    /// Server-side invocation context, for running store helpers outside a
    /// client call.
    pub fn invocation(&self, name: &str, random_seed: Option<String>) -> MethodInvocation {
        MethodInvocation::new(
            name.to_string(),
            None,
            Arc::new(RandomScope::new(random_seed)),
            self.inner.clone(),
        )
    }

    /// Calls a method from server code.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value> {
        let invocation = self.invocation(name, Some(make_rpc_seed(None, name)));
        self.inner.invoke(name, invocation, params).await
    }

    pub fn registry(&self) -> &Arc<ObserveRegistry> {
        self.inner.registry()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.inner.store()
    }

    pub fn config(&self) -> &ServerConfig {
        self.inner.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let server = Server::new(Arc::new(MemoryStore::new()), ServerConfig::default());
        server
            .method("echo", |_, params: Vec<Value>| async move { Ok::<_, Error>(json!(params)) })
            .unwrap();
        assert!(server
            .method("echo", |_, _| async { Ok::<_, Error>(Value::Null) })
            .is_err());
        assert!(server.publish("docs", |_, _| async { Ok::<_, Error>(Publish::Manual) }).is_ok());
        assert!(server.publish("docs", |_, _| async { Ok::<_, Error>(Publish::Manual) }).is_err());

        assert_eq!(server.call("echo", vec![json!(1)]).await.unwrap(), json!([1]));
    }
}
