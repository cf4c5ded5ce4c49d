//! Context of a running method call.

use std::sync::Arc;

use livedata_core::value::ID_FIELD;
use livedata_core::{Document, DocumentId, Result};
use livedata_query::modifier::upsert_document;
use livedata_query::CursorDescription;
use livedata_random::{make_rpc_seed, RandomScope, RandomStream, SharedGenerator};
use livedata_storage::{DocumentStore, UpdateOptions, UpdateOutcome};
use serde_json::Value;

use crate::server::ServerInner;

/// Passed to every method handler.
///
/// Writes made through the invocation run under the caller's write fence,
/// and documents inserted without an `_id` get one drawn from the
/// invocation's seeded `/collection/<name>` sequence, so a client that
/// simulated the call with the same seed predicted the same id.
pub struct MethodInvocation {
    name: String,
    session_id: Option<String>,
    scope: Arc<RandomScope>,
    server: Arc<ServerInner>,
}

impl MethodInvocation {
    pub(crate) fn new(
        name: String,
        session_id: Option<String>,
        scope: Arc<RandomScope>,
        server: Arc<ServerInner>,
    ) -> Self {
        Self {
            name,
            session_id,
            scope,
            server,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session the call came from; `None` for server-side calls.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn random_seed(&self) -> Option<&str> {
        self.scope.random_seed()
    }

    /// Named random sequence of this invocation.
    pub fn random_stream(&self, name: &str) -> SharedGenerator {
        RandomStream::get(Some(&self.scope), name)
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.server.store()
    }

    fn collection_id(&self, collection: &str) -> Value {
        let id = self
            .random_stream(&format!("/collection/{}", collection))
            .lock()
            .id();
        Value::String(id)
    }

    pub async fn insert(&self, collection: &str, mut doc: Document) -> Result<DocumentId> {
        if !doc.contains_key(ID_FIELD) {
            let id = self.collection_id(collection);
            doc.insert(ID_FIELD.to_string(), id);
        }
        self.store().insert(collection, doc).await
    }

    /// Updates matching documents. An upsert that matches nothing inserts a
    /// document whose `_id` comes from the invocation's sequence.
    pub async fn update(
        &self,
        collection: &str,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        if !options.upsert {
            return self.store().update(collection, selector, modifier, options).await;
        }
        let plain = UpdateOptions {
            upsert: false,
            ..options
        };
        let outcome = self.store().update(collection, selector, modifier, plain).await?;
        if outcome.matched > 0 {
            return Ok(outcome);
        }
        let doc = upsert_document(selector, modifier)?;
        let id = self.insert(collection, doc).await?;
        Ok(UpdateOutcome {
            matched: 0,
            upserted_id: Some(id),
        })
    }

    pub async fn remove(&self, collection: &str, selector: &Value) -> Result<usize> {
        self.store().remove(collection, selector).await
    }

    pub async fn find(&self, cursor: &CursorDescription) -> Result<Vec<Document>> {
        self.store().find(cursor).await
    }

    pub async fn find_one(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        self.store().find_one(collection, id).await
    }

    /// Calls another method from within this one. The nested call shares
    /// the write fence and gets a seed derived from this invocation's.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value> {
        let seed = make_rpc_seed(Some(&self.scope), name);
        let nested = MethodInvocation::new(
            name.to_string(),
            self.session_id.clone(),
            Arc::new(RandomScope::new(Some(seed))),
            self.server.clone(),
        );
        self.server.invoke(name, nested, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Server, ServerConfig};
    use livedata_core::value::to_document;
    use livedata_core::Error;
    use livedata_storage::MemoryStore;
    use serde_json::json;

    fn server() -> (Server, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Server::new(store.clone(), ServerConfig::default()), store)
    }

    #[tokio::test]
    async fn test_upsert_draws_id_from_stream() {
        let (server, store) = server();
        let invocation = server.invocation("fix", Some("seed".into()));
        let outcome = invocation
            .update(
                "docs",
                &json!({"name": "a"}),
                &json!({"$set": {"n": 1}}),
                UpdateOptions {
                    multi: false,
                    upsert: true,
                },
            )
            .await
            .unwrap();

        let expected = RandomStream::with_seed(["seed"])
            .sequence("/collection/docs")
            .lock()
            .id();
        assert_eq!(outcome.upserted_id, Some(DocumentId::new(expected.clone())));
        let stored = store.find_one("docs", &DocumentId::new(expected)).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("a"));
        assert_eq!(stored["n"], json!(1));

        let again = invocation
            .update(
                "docs",
                &json!({"name": "a"}),
                &json!({"$set": {"n": 2}}),
                UpdateOptions {
                    multi: false,
                    upsert: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(again.matched, 1);
        assert_eq!(store.count("docs"), 1);
    }

    #[tokio::test]
    async fn test_nested_call_gets_derived_seed() {
        let (server, _) = server();
        server
            .method("inner", |invocation: MethodInvocation, _| async move {
                Ok::<_, Error>(json!(invocation.random_seed()))
            })
            .unwrap();
        let outer = server.invocation("outer", Some("seed".into()));
        let seed = outer.call("inner", Vec::new()).await.unwrap();
        let expected = make_rpc_seed(Some(&RandomScope::new(Some("seed".into()))), "inner");
        assert_eq!(seed, json!(expected));

        assert!(matches!(
            server.call("missing", Vec::new()).await,
            Err(Error::MethodNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_explicit_id_is_kept() {
        let (server, store) = server();
        let invocation = server.invocation("add", None);
        let id = invocation
            .insert("docs", to_document(json!({"_id": "mine"})).unwrap())
            .await
            .unwrap();
        assert_eq!(id.as_str(), "mine");
        assert_eq!(store.count("docs"), 1);
    }
}
