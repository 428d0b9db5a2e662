pub mod collection;
pub mod database;
pub mod document;

pub use collection::CollectionRef;
pub use database::{DbOptions, NimbusDb};
pub use document::{DocumentRef, ExecutionOutcome};
