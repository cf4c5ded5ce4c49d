//! Livedata Server - Live queries, publications and sessions.
//!
//! This crate provides the server half of the live-data system:
//!
//! - `observe`: live queries over a `DocumentStore`, fed either by the
//!   store's operation log (`OplogObserveDriver`) or by re-polling
//!   (`PollingObserveDriver`), shared between identical queries through an
//!   `ObserveMultiplexer`
//! - `SubscriptionView`: what one subscription has sent its client
//! - `Session`: one client connection; merges the documents of all its
//!   subscriptions and runs methods inside write fences so `updated` is
//!   only sent once the method's writes reached every observer
//! - `Server`: method and publication registry
//!
//! # Example
//!
//! ```ignore
//! use livedata_server::{Publish, Server, ServerConfig};
//!
//! let server = Server::new(Arc::new(MemoryStore::with_oplog(1024)), ServerConfig::default());
//! server.publish("open", |_, _| async {
//!     Ok(Publish::Cursors(vec![CursorDescription::new("docs", json!({"status": "open"}))]))
//! })?;
//!
//! let (session, mut outbound) = server.connect();
//! session.handle_frame(r#"{"msg":"connect","version":"1"}"#).await;
//! session.handle_frame(r#"{"msg":"sub","id":"1","name":"open"}"#).await;
//! while let Some(msg) = outbound.recv().await {
//!     transport.send(msg.to_frame()?).await?;
//! }
//! ```

mod config;
mod method;
pub mod observe;
mod publication;
mod server;
mod session;
mod session_view;
mod subscription;

pub use config::ServerConfig;
pub use method::MethodInvocation;
pub use observe::{ObserveHandle, ObserveRegistry};
pub use publication::SubscriptionView;
pub use server::{MethodHandler, Publish, PublishHandler, Server};
pub use session::Session;
pub use subscription::PublishContext;
