//! Offline reads: subscription deliveries persist to the dataset cache and
//! seed the first delivery of a later handle before any server value.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use nimbusdb_rs_sdk::remote::InProcessTransport;
use nimbusdb_rs_sdk::{CollectionUpdate, DbOptions, NimbusDb, NimbusError, Ordering};

static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_tag() -> String {
    format!(
        "cache-{}-{}",
        std::process::id(),
        DB_COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
    )
}

fn open_db(api_key: &str, directory: PathBuf, transport: Arc<InProcessTransport>) -> NimbusDb {
    NimbusDb::with_options(
        api_key,
        DbOptions {
            enable_cache: true,
            cache_directory: Some(directory),
            transport: Some(transport),
            ..Default::default()
        },
    )
    .expect("create database handle")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn sub_frames(transport: &InProcessTransport) -> Vec<JsonValue> {
    transport
        .sent_frames()
        .iter()
        .filter_map(|text| {
            let value: JsonValue = serde_json::from_str(text).ok()?;
            value.get("sub").cloned()
        })
        .collect()
}

async fn ack_everything(transport: &InProcessTransport) {
    for text in transport.sent_frames() {
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        let (tag, payload) = value.as_object().unwrap().iter().next().unwrap();
        if tag != "ack" {
            let event_id = payload["evt-id"].as_str().unwrap();
            transport
                .push_message(json!({"ack": {"evt-id": event_id}}).to_string())
                .await;
        }
    }
}

fn wait_for_cache_files(directory: &PathBuf) {
    for _ in 0..200 {
        let populated = std::fs::read_dir(directory)
            .map(|entries| entries.count() >= 3)
            .unwrap_or(false);
        if populated {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("cache directory never populated");
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_datasets_seed_the_next_session() {
    let tag = unique_tag();
    let api_key = BASE64.encode(format!("{tag}.test.example.com"));
    let directory = std::env::temp_dir().join(format!("nimbusdb-offline-{tag}"));
    let _ = std::fs::remove_dir_all(&directory);

    // First life: receive a snapshot and let it land in the cache.
    let transport = InProcessTransport::new();
    let db = open_db(&api_key, directory.clone(), transport.clone());
    settle().await;
    ack_everything(&transport).await;

    let updates: Arc<Mutex<Vec<Result<CollectionUpdate, NimbusError>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let _registration = db
        .collection("msg")
        .unwrap()
        .order(Ordering::desc("$modified"))
        .unwrap()
        .subscribe(move |update| sink.lock().unwrap().push(update))
        .await
        .unwrap();
    settle().await;

    let subs = sub_frames(&transport);
    assert_eq!(subs.len(), 1);
    let sub_id = subs[0]["sub-id"].as_str().unwrap().to_owned();
    transport
        .push_message(
            json!({"val": {"evt-id": "srv-1", "sub-id": sub_id, "col-id": "msg", "docs": [
                {"id": "a", "etag": "e1", "skey": ["2"], "body": {"t": "hi"}},
                {"id": "b", "etag": "e1", "skey": ["1"], "body": {"t": "yo"}}
            ]}})
            .to_string(),
        )
        .await;
    settle().await;
    assert_eq!(updates.lock().unwrap().len(), 1);

    wait_for_cache_files(&directory);
    db.destroy().await.unwrap();

    // Second life: the server stays silent; the listener is seeded from the
    // cached dataset.
    let transport = InProcessTransport::new();
    let db = open_db(&api_key, directory.clone(), transport.clone());
    settle().await;
    ack_everything(&transport).await;

    let revived: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = revived.clone();
    let _registration = db
        .collection("msg")
        .unwrap()
        .order(Ordering::desc("$modified"))
        .unwrap()
        .subscribe(move |update| {
            if let Ok(update) = update {
                sink.lock()
                    .unwrap()
                    .push(update.documents.iter().map(|doc| doc.id.clone()).collect());
            }
        })
        .await
        .unwrap();

    for _ in 0..50 {
        settle().await;
        if !revived.lock().unwrap().is_empty() {
            break;
        }
    }
    {
        let revived = revived.lock().unwrap();
        assert_eq!(revived.as_slice(), &[vec!["a".to_string(), "b".to_string()]]);
    }

    // A real server value afterwards still flows through normally.
    let subs = sub_frames(&transport);
    assert_eq!(subs.len(), 1);
    let sub_id = subs[0]["sub-id"].as_str().unwrap().to_owned();
    transport
        .push_message(
            json!({"val": {"evt-id": "srv-2", "sub-id": sub_id, "col-id": "msg", "docs": [
                {"id": "c", "etag": "e1", "skey": ["3"], "body": {"t": "new"}}
            ]}})
            .to_string(),
        )
        .await;
    settle().await;
    settle().await;
    {
        let revived = revived.lock().unwrap();
        assert_eq!(revived.len(), 2);
        assert_eq!(revived[1], vec!["c".to_string()]);
    }

    db.destroy().await.unwrap();
    let _ = std::fs::remove_dir_all(&directory);
}
