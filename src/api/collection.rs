//! Collection reference: an immutable query builder plus the subscribe and
//! fetch entry points.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{NimbusError, NimbusResult};
use crate::model::Document;
use crate::query::{Filter, Ordering, Query};
use crate::remote::subscription::CollectionUpdate;
use crate::util::ids::generate_id;
use crate::util::subscribe::Unsubscribe;
use crate::util::validate::validate_identifier;

use super::database::NimbusDb;
use super::document::DocumentRef;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, AtomicOrdering::SeqCst)
}

/// Immutable builder over one collection. Every refinement returns a new
/// reference; the original stays usable.
#[derive(Clone)]
pub struct CollectionRef {
    db: NimbusDb,
    query: Query,
}

impl std::fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionRef").field("query", &self.query).finish()
    }
}

impl CollectionRef {
    pub(crate) fn new(db: NimbusDb, query: Query) -> Self {
        Self { db, query }
    }

    pub fn collection_id(&self) -> &str {
        &self.query.collection_id
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    /// Adds a filter; composing onto an existing one ANDs them together.
    pub fn filter(&self, filter: Filter) -> NimbusResult<Self> {
        filter.validate()?;
        let mut next = self.clone();
        next.query.filter = Some(match next.query.filter.take() {
            None => filter,
            Some(Filter::And(mut operands)) => {
                operands.push(filter);
                Filter::And(operands)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        });
        Ok(next)
    }

    /// Appends an ordering descriptor; the first one added stays primary.
    pub fn order(&self, ordering: Ordering) -> NimbusResult<Self> {
        ordering.validate()?;
        let mut next = self.clone();
        next.query.ordering.push(ordering);
        Ok(next)
    }

    pub fn skip(&self, skip: u64) -> Self {
        let mut next = self.clone();
        let mut paging = next.query.paging.unwrap_or_default();
        paging.skip = Some(skip);
        next.query.paging = Some(paging);
        next
    }

    pub fn take(&self, take: u32) -> NimbusResult<Self> {
        let mut next = self.clone();
        let mut paging = next.query.paging.unwrap_or_default();
        paging.take = Some(take);
        paging.validate()?;
        next.query.paging = Some(paging);
        Ok(next)
    }

    /// Registers a standing query. The callback receives every dataset
    /// delivery (or terminal error); the returned closure detaches the
    /// listener, unsubscribing server-side once no listener remains for the
    /// same query hash.
    pub async fn subscribe<F>(&self, callback: F) -> NimbusResult<Unsubscribe>
    where
        F: Fn(Result<CollectionUpdate, NimbusError>) + Send + Sync + 'static,
    {
        let listener_id = next_listener_id();
        self.db
            .session()
            .subscribe(self.query.clone(), listener_id, Arc::new(callback))
            .await?;
        let session = self.db.session().clone();
        Ok(Box::new(move || {
            session.unsubscribe_detached(listener_id);
        }))
    }

    /// One-shot read of the query's current result set.
    pub async fn fetch(&self) -> NimbusResult<Vec<Document>> {
        self.db.session().fetch(self.query.clone()).await
    }

    pub fn document(&self, document_id: &str) -> NimbusResult<DocumentRef> {
        validate_identifier(document_id)?;
        Ok(DocumentRef::new(
            self.db.clone(),
            self.query.collection_id.clone(),
            document_id.to_owned(),
        ))
    }

    /// A reference to a not-yet-existing document with a generated id.
    pub fn new_document(&self) -> DocumentRef {
        DocumentRef::new(
            self.db.clone(),
            self.query.collection_id.clone(),
            generate_id(),
        )
    }
}
