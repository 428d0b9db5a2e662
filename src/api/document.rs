//! Document reference: single-document reads, writes, standing queries and
//! the optimistic execution loop.

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{
    execution_failed, invalid_data, ExecutionFailure, InvalidDataReason, NimbusError,
    NimbusResult,
};
use crate::model::Document;
use crate::protocol::{ClientFrame, WritePayload};
use crate::query::{Filter, Paging, Query};
use crate::util::subscribe::Unsubscribe;
use crate::util::validate::KEY_PATH_ID;

use super::database::NimbusDb;

/// Verdict returned by an optimistic-execution block.
pub enum ExecutionOutcome {
    /// Replace the document body with this value.
    Write(JsonValue),
    /// Delete the document.
    Delete,
    /// Give up; the execution fails with `executionFailed(aborted)`.
    Abort,
}

/// Reference to one document within a collection.
#[derive(Clone)]
pub struct DocumentRef {
    db: NimbusDb,
    collection_id: String,
    document_id: String,
}

impl DocumentRef {
    pub(crate) fn new(db: NimbusDb, collection_id: String, document_id: String) -> Self {
        Self {
            db,
            collection_id,
            document_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.document_id
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Writes the full document body, replacing whatever the server holds.
    pub async fn mutate(&self, value: JsonValue) -> NimbusResult<()> {
        self.mutate_with_etag(value, None).await
    }

    /// Merges the given fields into the existing document body.
    pub async fn merge(&self, value: JsonValue) -> NimbusResult<()> {
        let body = into_body(value)?;
        self.db
            .session()
            .request(
                ClientFrame::Merge {
                    collection_id: self.collection_id.clone(),
                    payload: WritePayload {
                        id: self.document_id.clone(),
                        etag: None,
                        body,
                    },
                },
                false,
            )
            .await
    }

    pub async fn delete(&self) -> NimbusResult<()> {
        self.delete_with_etag(None).await
    }

    pub(crate) async fn mutate_with_etag(
        &self,
        value: JsonValue,
        etag: Option<String>,
    ) -> NimbusResult<()> {
        let body = into_body(value)?;
        self.db
            .session()
            .request(
                ClientFrame::Mutate {
                    collection_id: self.collection_id.clone(),
                    payload: WritePayload {
                        id: self.document_id.clone(),
                        etag,
                        body,
                    },
                },
                false,
            )
            .await
    }

    pub(crate) async fn delete_with_etag(&self, etag: Option<String>) -> NimbusResult<()> {
        self.db
            .session()
            .request(
                ClientFrame::Delete {
                    collection_id: self.collection_id.clone(),
                    document_id: self.document_id.clone(),
                    etag,
                },
                false,
            )
            .await
    }

    /// One-shot read; `None` when the document does not exist.
    pub async fn fetch(&self) -> NimbusResult<Option<Document>> {
        let documents = self.db.session().fetch(self.single_document_query()).await?;
        Ok(documents.into_iter().next())
    }

    /// Standing query over just this document. The callback receives the
    /// current state (or `None` once deleted) on every change.
    pub async fn subscribe<F>(&self, callback: F) -> NimbusResult<Unsubscribe>
    where
        F: Fn(Result<Option<Document>, NimbusError>) + Send + Sync + 'static,
    {
        let listener_id = super::collection::next_listener_id();
        self.db
            .session()
            .subscribe(
                self.single_document_query(),
                listener_id,
                std::sync::Arc::new(move |result| {
                    callback(result.map(|update| update.documents.into_iter().next()));
                }),
            )
            .await?;
        let session = self.db.session().clone();
        Ok(Box::new(move || {
            session.unsubscribe_detached(listener_id);
        }))
    }

    /// Optimistic concurrency loop: fetch the document, let `block` decide,
    /// then write or delete against the fetched etag. A write conflict
    /// restarts the cycle; there is no retry cap.
    pub async fn execute<F>(&self, mut block: F) -> NimbusResult<()>
    where
        F: FnMut(Option<&Document>) -> ExecutionOutcome + Send,
    {
        loop {
            let current = self.fetch().await?;
            let etag = current.as_ref().and_then(|document| document.etag.clone());
            let outcome = block(current.as_ref());
            let result = match outcome {
                ExecutionOutcome::Abort => {
                    return Err(execution_failed(
                        ExecutionFailure::Aborted,
                        "execution aborted by the caller",
                    ))
                }
                ExecutionOutcome::Write(value) => self.mutate_with_etag(value, etag).await,
                ExecutionOutcome::Delete => self.delete_with_etag(etag).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_write_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn single_document_query(&self) -> Query {
        let mut query = Query::new(self.collection_id.clone());
        query.filter = Some(Filter::eq(KEY_PATH_ID, self.document_id.clone()));
        query.paging = Some(Paging {
            skip: None,
            take: Some(1),
        });
        query
    }
}

fn into_body(value: JsonValue) -> NimbusResult<JsonMap<String, JsonValue>> {
    match value {
        JsonValue::Object(body) => Ok(body),
        other => Err(invalid_data(
            InvalidDataReason::InvalidDocument,
            format!("document body must be a JSON object, got {other}"),
        )),
    }
}
