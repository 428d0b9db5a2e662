//! Subscription handler: one server-side registration fanned out to all
//! listeners sharing a query hash, plus the incremental diff engine that
//! folds server batches into an ordered local dataset.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

use crate::error::NimbusError;
use crate::model::Document;
use crate::protocol::SubscriptionBatch;
use crate::query::{Direction, Ordering, Query};
use crate::util::subscribe::SubscriptionCallback;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Unsubscribed,
    Registering,
    Subscribed,
    Unsubscribing,
}

/// One delivery to subscription listeners: the full ordered dataset plus the
/// documents that entered, changed, or left it since the last delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionUpdate {
    pub documents: Vec<Document>,
    pub inserted: Vec<Document>,
    pub updated: Vec<Document>,
    pub removed: Vec<Document>,
}

impl CollectionUpdate {
    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeOp {
    Add,
    Update,
    Remove,
    NoChange,
}

/// Collision reconciliation when several deltas touch the same document
/// within one batch. `None` drops the entry entirely (a document added and
/// removed in the same batch never surfaces).
fn merge_ops(previous: Option<ChangeOp>, next: ChangeOp) -> Option<ChangeOp> {
    use ChangeOp::*;
    match (previous, next) {
        (None, op) | (Some(NoChange), op) => Some(op),
        (Some(Add), Remove) => None,
        (Some(Add), _) => Some(Add),
        (Some(Update), Remove) => Some(Remove),
        (Some(Update), _) => Some(Update),
        (Some(Remove), Add) | (Some(Remove), Update) => Some(Update),
        (Some(Remove), _) => Some(Remove),
    }
}

fn directed(cmp: CmpOrdering, direction: Direction) -> CmpOrdering {
    match direction {
        Direction::Ascending => cmp,
        Direction::Descending => cmp.reverse(),
    }
}

/// Compares two documents under the active ordering: sort keys are matched
/// index-wise with each key's direction; a full tie falls back to the
/// server-issued sort value under the first direction (ascending when no
/// ordering is active).
fn compare_documents(a: &Document, b: &Document, orderings: &[Ordering]) -> CmpOrdering {
    for (index, ordering) in orderings.iter().enumerate() {
        let left = a.sort_keys.get(index).map(String::as_str).unwrap_or("");
        let right = b.sort_keys.get(index).map(String::as_str).unwrap_or("");
        let cmp = left.cmp(right);
        if cmp != CmpOrdering::Equal {
            return directed(cmp, ordering.direction);
        }
    }
    let left = a.sort_value.as_deref().unwrap_or("");
    let right = b.sort_value.as_deref().unwrap_or("");
    let direction = orderings
        .first()
        .map(|ordering| ordering.direction)
        .unwrap_or(Direction::Ascending);
    directed(left.cmp(right), direction)
}

/// Binary partition for the insertion index of `doc` in the sorted `arr`.
/// When a probe ties on every sort key and the sort value, the probe index
/// itself is returned; which tied neighbour ends up first is
/// implementation-defined.
pub(crate) fn find_insert_index(
    doc: &Document,
    arr: &[Document],
    orderings: &[Ordering],
) -> usize {
    let mut low = 0;
    let mut high = arr.len();
    while low < high {
        let middle = (low + high) / 2;
        match compare_documents(doc, &arr[middle], orderings) {
            CmpOrdering::Less => high = middle,
            CmpOrdering::Greater => low = middle + 1,
            CmpOrdering::Equal => return middle,
        }
    }
    low
}

/// Folds one document into the dataset and classifies the change. With
/// `mutate` false the array is only probed, never modified.
fn incorporate(
    doc: &Document,
    arr: &mut Vec<Document>,
    mutate: bool,
    orderings: &[Ordering],
) -> ChangeOp {
    let existing = arr.iter().position(|candidate| candidate.id == doc.id);

    if doc.is_tombstone() {
        return match existing {
            Some(position) => {
                if mutate {
                    arr.remove(position);
                }
                ChangeOp::Remove
            }
            None => ChangeOp::NoChange,
        };
    }

    if let Some(position) = existing {
        if arr[position].etag.is_some() && arr[position].etag == doc.etag {
            return ChangeOp::NoChange;
        }
        if mutate {
            arr.remove(position);
            let index = find_insert_index(doc, arr, orderings);
            arr.insert(index, doc.clone());
        }
        ChangeOp::Update
    } else {
        if mutate {
            let index = find_insert_index(doc, arr, orderings);
            arr.insert(index, doc.clone());
        }
        ChangeOp::Add
    }
}

/// Applies one merged server batch on top of the previously delivered
/// dataset, producing the new dataset and the classified change sets.
pub(crate) fn apply_batch(
    old: Option<&Vec<Document>>,
    batch: &SubscriptionBatch,
    orderings: &[Ordering],
    take: Option<u32>,
) -> CollectionUpdate {
    let mut ops: HashMap<String, ChangeOp> = HashMap::new();
    let mut documents: Vec<Document>;

    match (&batch.collection, old) {
        (Some(snapshot), Some(old_docs)) => {
            documents = snapshot
                .iter()
                .filter(|doc| !doc.is_tombstone())
                .cloned()
                .collect();
            // Everything previously known is tentatively gone; each document
            // present in the snapshot overrides that below.
            for doc in old_docs {
                ops.insert(doc.id.clone(), ChangeOp::Remove);
            }
            let mut probe = old_docs.clone();
            for doc in &documents {
                let op = incorporate(doc, &mut probe, false, orderings);
                ops.insert(doc.id.clone(), op);
            }
        }
        (None, Some(old_docs)) => {
            documents = old_docs.clone();
        }
        (Some(snapshot), None) => {
            documents = snapshot
                .iter()
                .filter(|doc| !doc.is_tombstone())
                .cloned()
                .collect();
            for doc in &documents {
                ops.insert(doc.id.clone(), ChangeOp::Add);
            }
        }
        (None, None) => {
            documents = Vec::new();
        }
    }

    for delta in &batch.updates {
        let op = incorporate(delta, &mut documents, true, orderings);
        match merge_ops(ops.get(&delta.id).copied(), op) {
            Some(merged) => {
                ops.insert(delta.id.clone(), merged);
            }
            None => {
                ops.remove(&delta.id);
            }
        }
    }

    if let Some(take) = take {
        while documents.len() > take as usize {
            if let Some(doc) = documents.pop() {
                match merge_ops(ops.get(&doc.id).copied(), ChangeOp::Remove) {
                    Some(merged) => {
                        ops.insert(doc.id.clone(), merged);
                    }
                    None => {
                        ops.remove(&doc.id);
                    }
                }
            }
        }
    }

    let inserted = documents
        .iter()
        .filter(|doc| ops.get(&doc.id) == Some(&ChangeOp::Add))
        .cloned()
        .collect();
    let updated = documents
        .iter()
        .filter(|doc| ops.get(&doc.id) == Some(&ChangeOp::Update))
        .cloned()
        .collect();
    let removed = old
        .map(|old_docs| {
            old_docs
                .iter()
                .filter(|doc| ops.get(&doc.id) == Some(&ChangeOp::Remove))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    CollectionUpdate {
        documents,
        inserted,
        updated,
        removed,
    }
}

/// State and fan-out for one deduplicated subscription.
pub(crate) struct SubscriptionHandler {
    pub subscription_id: String,
    pub hash: String,
    pub query: Query,
    pub state: HandlerState,
    listeners: Vec<(u64, SubscriptionCallback<CollectionUpdate>)>,
    last_dataset: Option<Vec<Document>>,
    delivered_first: bool,
    received_server_value: bool,
}

impl SubscriptionHandler {
    pub fn new(subscription_id: String, query: Query) -> Self {
        let hash = query.subscription_hash();
        Self {
            subscription_id,
            hash,
            query,
            state: HandlerState::Registering,
            listeners: Vec::new(),
            last_dataset: None,
            delivered_first: false,
            received_server_value: false,
        }
    }

    fn take(&self) -> Option<u32> {
        self.query.paging.and_then(|paging| paging.take)
    }

    /// Attaches a listener; one joining an established subscription receives
    /// the last known dataset right away.
    pub fn add_listener(&mut self, id: u64, callback: SubscriptionCallback<CollectionUpdate>) {
        if let Some(documents) = &self.last_dataset {
            callback(Ok(CollectionUpdate {
                documents: documents.clone(),
                inserted: documents.clone(),
                updated: Vec::new(),
                removed: Vec::new(),
            }));
        }
        self.listeners.push((id, callback));
    }

    /// Detaches a listener; returns true when none remain.
    pub fn remove_listener(&mut self, id: u64) -> bool {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.is_empty()
    }

    pub fn owns_listener(&self, id: u64) -> bool {
        self.listeners.iter().any(|(listener_id, _)| *listener_id == id)
    }

    /// Ingests one merged server batch. Returns the freshly delivered
    /// dataset when listeners were notified, so the caller can persist it.
    pub fn receive_batch(&mut self, batch: &SubscriptionBatch) -> Option<Vec<Document>> {
        let outcome = apply_batch(
            self.last_dataset.as_ref(),
            batch,
            &self.query.ordering,
            self.take(),
        );
        self.received_server_value = true;
        let first = !self.delivered_first;
        self.last_dataset = Some(outcome.documents.clone());
        if !(outcome.has_changes() || first) {
            return None;
        }
        self.delivered_first = true;
        let documents = outcome.documents.clone();
        for (_, callback) in &self.listeners {
            callback(Ok(outcome.clone()));
        }
        Some(documents)
    }

    /// Seeds the handler with the cache's last-known dataset, unless a
    /// server value has already arrived.
    pub fn receive_cached(&mut self, documents: Vec<Document>) {
        if self.received_server_value || self.last_dataset.is_some() {
            return;
        }
        let batch = SubscriptionBatch {
            subscription_id: self.subscription_id.clone(),
            collection_id: self.query.collection_id.clone(),
            collection: Some(documents),
            updates: Vec::new(),
            event_ids: Vec::new(),
        };
        let outcome = apply_batch(None, &batch, &self.query.ordering, self.take());
        self.last_dataset = Some(outcome.documents.clone());
        self.delivered_first = true;
        for (_, callback) in &self.listeners {
            callback(Ok(outcome.clone()));
        }
    }

    pub fn deliver_error(&self, error: &NimbusError) {
        for (_, callback) in &self.listeners {
            callback(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, etag: &str, sort_keys: &[&str]) -> Document {
        Document::from_wire(
            "messages",
            &json!({
                "id": id,
                "etag": etag,
                "crt": id,
                "skey": sort_keys,
                "body": {"id": id}
            }),
        )
        .unwrap()
    }

    fn tombstone(id: &str) -> Document {
        Document::from_wire("messages", &json!({"id": id})).unwrap()
    }

    fn snapshot_batch(docs: Vec<Document>) -> SubscriptionBatch {
        SubscriptionBatch {
            subscription_id: "s1".into(),
            collection_id: "messages".into(),
            collection: Some(docs),
            updates: Vec::new(),
            event_ids: Vec::new(),
        }
    }

    fn delta_batch(docs: Vec<Document>) -> SubscriptionBatch {
        SubscriptionBatch {
            subscription_id: "s1".into(),
            collection_id: "messages".into(),
            collection: None,
            updates: docs,
            event_ids: Vec::new(),
        }
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|doc| doc.id.as_str()).collect()
    }

    fn desc_ordering() -> Vec<Ordering> {
        vec![Ordering::desc("$modified")]
    }

    #[test]
    fn snapshot_then_delta_then_removal() {
        let orderings = desc_ordering();

        let first = apply_batch(
            None,
            &snapshot_batch(vec![doc("a", "e1", &["2"]), doc("b", "e1", &["1"])]),
            &orderings,
            None,
        );
        assert_eq!(ids(&first.documents), vec!["a", "b"]);
        assert_eq!(ids(&first.inserted), vec!["a", "b"]);
        assert!(first.updated.is_empty() && first.removed.is_empty());

        let second = apply_batch(
            Some(&first.documents),
            &delta_batch(vec![doc("c", "e1", &["3"])]),
            &orderings,
            None,
        );
        assert_eq!(ids(&second.documents), vec!["c", "a", "b"]);
        assert_eq!(ids(&second.inserted), vec!["c"]);
        assert!(second.updated.is_empty() && second.removed.is_empty());

        let third = apply_batch(
            Some(&second.documents),
            &delta_batch(vec![tombstone("a")]),
            &orderings,
            None,
        );
        assert_eq!(ids(&third.documents), vec!["c", "b"]);
        assert!(third.inserted.is_empty() && third.updated.is_empty());
        assert_eq!(ids(&third.removed), vec!["a"]);
    }

    #[test]
    fn snapshot_over_existing_state_classifies_removals() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["3"]), doc("b", "e1", &["2"]), doc("c", "e1", &["1"])];

        // b changed, c vanished, d is new.
        let outcome = apply_batch(
            Some(&old),
            &snapshot_batch(vec![
                doc("d", "e1", &["4"]),
                doc("a", "e1", &["3"]),
                doc("b", "e2", &["2"]),
            ]),
            &orderings,
            None,
        );
        assert_eq!(ids(&outcome.documents), vec!["d", "a", "b"]);
        assert_eq!(ids(&outcome.inserted), vec!["d"]);
        assert_eq!(ids(&outcome.updated), vec!["b"]);
        assert_eq!(ids(&outcome.removed), vec!["c"]);
    }

    #[test]
    fn equal_etags_are_no_changes() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["1"])];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![doc("a", "e1", &["1"])]),
            &orderings,
            None,
        );
        assert!(!outcome.has_changes());
        assert_eq!(ids(&outcome.documents), vec!["a"]);
    }

    #[test]
    fn tombstone_for_unknown_document_is_a_no_change() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["1"])];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![tombstone("ghost")]),
            &orderings,
            None,
        );
        assert!(!outcome.has_changes());
    }

    #[test]
    fn updated_document_moves_to_its_new_position() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["3"]), doc("b", "e1", &["2"]), doc("c", "e1", &["1"])];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![doc("c", "e2", &["9"])]),
            &orderings,
            None,
        );
        assert_eq!(ids(&outcome.documents), vec!["c", "a", "b"]);
        assert_eq!(ids(&outcome.updated), vec!["c"]);
    }

    #[test]
    fn add_then_remove_within_a_batch_cancels_out() {
        let orderings = desc_ordering();
        let old: Vec<Document> = vec![];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![doc("x", "e1", &["5"]), tombstone("x")]),
            &orderings,
            None,
        );
        assert!(outcome.documents.is_empty());
        assert!(!outcome.has_changes());
    }

    #[test]
    fn remove_then_add_reports_an_update() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["1"])];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![tombstone("a"), doc("a", "e2", &["2"])]),
            &orderings,
            None,
        );
        assert_eq!(ids(&outcome.documents), vec!["a"]);
        assert_eq!(ids(&outcome.updated), vec!["a"]);
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn take_window_truncates_the_tail_as_removals() {
        let orderings = desc_ordering();
        let old = vec![doc("a", "e1", &["3"]), doc("b", "e1", &["2"])];
        let outcome = apply_batch(
            Some(&old),
            &delta_batch(vec![doc("c", "e1", &["4"])]),
            &orderings,
            Some(2),
        );
        assert_eq!(ids(&outcome.documents), vec!["c", "a"]);
        assert_eq!(ids(&outcome.inserted), vec!["c"]);
        assert_eq!(ids(&outcome.removed), vec!["b"]);
    }

    #[test]
    fn zero_take_keeps_the_dataset_empty() {
        let orderings = desc_ordering();
        let outcome = apply_batch(
            None,
            &snapshot_batch(vec![doc("a", "e1", &["1"])]),
            &orderings,
            Some(0),
        );
        assert!(outcome.documents.is_empty());
        assert!(outcome.inserted.is_empty());
    }

    #[test]
    fn insert_index_preserves_total_order() {
        let orderings = vec![Ordering::asc("stars"), Ordering::desc("name")];
        let mut dataset: Vec<Document> = Vec::new();
        let incoming = [
            ("m1", &["2", "b"]),
            ("m2", &["1", "a"]),
            ("m3", &["2", "a"]),
            ("m4", &["3", "z"]),
            ("m5", &["1", "z"]),
            ("m6", &["2", "c"]),
        ];
        for (id, keys) in incoming {
            let doc = doc(id, "e1", keys);
            let index = find_insert_index(&doc, &dataset, &orderings);
            dataset.insert(index, doc);
        }
        for pair in dataset.windows(2) {
            assert_ne!(
                compare_documents(&pair[0], &pair[1], &orderings),
                CmpOrdering::Greater,
                "dataset out of order: {:?}",
                ids(&dataset)
            );
        }
        assert_eq!(ids(&dataset), vec!["m5", "m2", "m6", "m1", "m3", "m4"]);
    }

    #[test]
    fn full_ties_fall_back_to_the_sort_value() {
        let orderings = desc_ordering();
        let mut a = doc("a", "e1", &["1"]);
        let mut b = doc("b", "e1", &["1"]);
        a.sort_value = Some("10".into());
        b.sort_value = Some("20".into());
        // Descending first ordering also flips the sort-value comparison.
        assert_eq!(
            compare_documents(&a, &b, &orderings),
            CmpOrdering::Greater
        );
        assert_eq!(
            compare_documents(&a, &b, &[Ordering::asc("x")]),
            CmpOrdering::Less
        );
    }

    #[test]
    fn listeners_joining_late_get_the_last_known_value() {
        let mut handler = SubscriptionHandler::new("s1".into(), Query::new("messages"));
        handler.query.ordering = desc_ordering();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let first_seen = seen.clone();
        handler.add_listener(
            1,
            std::sync::Arc::new(move |result| {
                first_seen.lock().unwrap().push(result.map(|u| ids_owned(&u.documents)));
            }),
        );

        handler.receive_batch(&snapshot_batch(vec![doc("a", "e1", &["1"])]));

        let late_seen = seen.clone();
        handler.add_listener(
            2,
            std::sync::Arc::new(move |result| {
                late_seen.lock().unwrap().push(result.map(|u| ids_owned(&u.documents)));
            }),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref().unwrap(), &vec!["a".to_string()]);
        assert_eq!(seen[1].as_ref().unwrap(), &vec!["a".to_string()]);
    }

    #[test]
    fn cached_dataset_is_ignored_once_a_server_value_arrived() {
        let mut handler = SubscriptionHandler::new("s1".into(), Query::new("messages"));
        let count = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let counted = count.clone();
        handler.add_listener(
            1,
            std::sync::Arc::new(move |_| {
                *counted.lock().unwrap() += 1;
            }),
        );

        handler.receive_batch(&snapshot_batch(vec![doc("a", "e1", &["1"])]));
        handler.receive_cached(vec![doc("stale", "e0", &["0"])]);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unchanged_batches_are_not_redelivered() {
        let mut handler = SubscriptionHandler::new("s1".into(), Query::new("messages"));
        let count = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let counted = count.clone();
        handler.add_listener(
            1,
            std::sync::Arc::new(move |_| {
                *counted.lock().unwrap() += 1;
            }),
        );

        let docs = vec![doc("a", "e1", &["1"])];
        assert!(handler.receive_batch(&snapshot_batch(docs.clone())).is_some());
        assert!(handler.receive_batch(&snapshot_batch(docs)).is_none());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    fn ids_owned(docs: &[Document]) -> Vec<String> {
        docs.iter().map(|doc| doc.id.clone()).collect()
    }
}
