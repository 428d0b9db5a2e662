//! Dataset cache: a dedicated single-threaded worker owning all disk I/O.
//!
//! Callers hold a cheap [`CacheHandle`] and interact through message passing;
//! replies arrive on oneshot channels, so completion resumes on the caller's
//! executor. Serializing every read and write through one worker removes the
//! need for any per-file locking.

pub mod store;

use futures::channel::oneshot;

use crate::error::{default_error, NimbusResult};
use crate::logger::Logger;
use crate::model::Document;

pub use store::{bucket_hash, unique_hash, CacheConfig, CacheStore, DEFAULT_MAX_SIZE_BYTES};

enum CacheCommand {
    Save {
        key: String,
        documents: Vec<Document>,
        secret: Option<String>,
        reply: Option<oneshot::Sender<NimbusResult<()>>>,
    },
    Load {
        key: String,
        secret: Option<String>,
        reply: oneshot::Sender<NimbusResult<Option<Vec<Document>>>>,
    },
    Remove {
        key: String,
        reply: Option<oneshot::Sender<NimbusResult<()>>>,
    },
    Clear {
        reply: oneshot::Sender<NimbusResult<()>>,
    },
}

#[derive(Clone)]
pub struct CacheHandle {
    sender: async_channel::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Opens the store (applying journal recovery and the pruning pass) and
    /// starts the worker thread. Fails if the directory cannot be prepared.
    pub fn open(config: CacheConfig) -> NimbusResult<Self> {
        let store = CacheStore::open(config)?;
        let (sender, receiver) = async_channel::unbounded();
        std::thread::Builder::new()
            .name("nimbusdb-cache".into())
            .spawn(move || run_worker(store, receiver))
            .map_err(|err| default_error(format!("failed to start cache worker: {err}")))?;
        Ok(Self { sender })
    }

    pub async fn save(
        &self,
        key: String,
        documents: Vec<Document>,
        secret: Option<String>,
    ) -> NimbusResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(CacheCommand::Save {
            key,
            documents,
            secret,
            reply: Some(reply),
        })
        .await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("cache worker stopped")))
    }

    /// Fire-and-forget save used on the subscription delivery path, where a
    /// cache failure must never stall or fail the delivery itself.
    pub fn save_detached(&self, key: String, documents: Vec<Document>, secret: Option<String>) {
        let _ = self.sender.try_send(CacheCommand::Save {
            key,
            documents,
            secret,
            reply: None,
        });
    }

    pub async fn load(
        &self,
        key: String,
        secret: Option<String>,
    ) -> NimbusResult<Option<Vec<Document>>> {
        let (reply, response) = oneshot::channel();
        self.send(CacheCommand::Load { key, secret, reply }).await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("cache worker stopped")))
    }

    pub async fn remove(&self, key: String) -> NimbusResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(CacheCommand::Remove {
            key,
            reply: Some(reply),
        })
        .await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("cache worker stopped")))
    }

    pub async fn clear(&self) -> NimbusResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(CacheCommand::Clear { reply }).await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("cache worker stopped")))
    }

    async fn send(&self, command: CacheCommand) -> NimbusResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| default_error("cache worker stopped"))
    }
}

fn run_worker(store: CacheStore, receiver: async_channel::Receiver<CacheCommand>) {
    let logger = Logger::new("nimbusdb/cache-worker");
    while let Ok(command) = receiver.recv_blocking() {
        match command {
            CacheCommand::Save {
                key,
                documents,
                secret,
                reply,
            } => {
                let result = store.save_dataset(&key, &documents, secret.as_deref());
                if let Err(err) = &result {
                    logger.warn(format!("failed to store dataset '{key}': {err}"));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CacheCommand::Load { key, secret, reply } => {
                let _ = reply.send(store.load_dataset(&key, secret.as_deref()));
            }
            CacheCommand::Remove { key, reply } => {
                let result = store.remove_dataset(&key);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CacheCommand::Clear { reply } => {
                let _ = reply.send(store.clear());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_handle() -> CacheHandle {
        let directory = std::env::temp_dir().join(format!(
            "nimbusdb-cache-handle-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_dir_all(&directory);
        CacheHandle::open(CacheConfig::new(directory)).unwrap()
    }

    fn document(id: &str) -> Document {
        Document::from_wire("messages", &json!({"id": id, "etag": "e1", "body": {"n": 1}}))
            .unwrap()
    }

    #[tokio::test]
    async fn handle_round_trips_through_the_worker() {
        let cache = temp_handle();
        let docs = vec![document("a"), document("b")];
        cache
            .save("ds".into(), docs.clone(), Some("tok".into()))
            .await
            .unwrap();
        let loaded = cache.load("ds".into(), Some("tok".into())).await.unwrap();
        assert_eq!(loaded, Some(docs));

        cache.remove("ds".into()).await.unwrap();
        assert_eq!(cache.load("ds".into(), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let cache = temp_handle();
        cache
            .save("ds".into(), vec![document("a")], None)
            .await
            .unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.load("ds".into(), None).await.unwrap(), None);
    }
}
