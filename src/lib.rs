//! Rust client SDK for the NimbusDB realtime document database.
//!
//! The crate keeps one persistent websocket per database handle and turns
//! high-level operations (subscribe, fetch, mutate, merge, delete,
//! optimistic execute, authorize) into correlated request/response
//! exchanges that survive disconnects. Subscriptions maintain an ordered
//! in-memory dataset, fold server deltas in incrementally, and persist
//! their last-known value to an obfuscated on-disk cache for offline reads.
//!
//! ```no_run
//! use nimbusdb_rs_sdk::{Filter, NimbusDb, Ordering};
//!
//! # async fn demo() -> nimbusdb_rs_sdk::NimbusResult<()> {
//! let db = NimbusDb::with_api_key("ZGIuZXhhbXBsZS5jb20=")?;
//! db.authorize("auth-token").await?;
//!
//! let messages = db
//!     .collection("messages")?
//!     .filter(Filter::eq("channel", "general"))?
//!     .order(Ordering::desc("$modified"))?
//!     .take(50)?;
//!
//! let _registration = messages
//!     .subscribe(|update| {
//!         if let Ok(update) = update {
//!             println!("{} documents", update.documents.len());
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod error;
pub mod local;
pub mod logger;
pub mod model;
pub mod protocol;
pub mod query;
pub mod remote;
pub mod util;

pub use api::{CollectionRef, DbOptions, DocumentRef, ExecutionOutcome, NimbusDb};
pub use error::{NimbusError, NimbusErrorCode, NimbusResult};
pub use model::Document;
pub use query::{Direction, Filter, Ordering, Paging, Query};
pub use remote::CollectionUpdate;
