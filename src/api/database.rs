//! Database handle and the process-wide handle registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use url::Url;

use crate::error::{default_error, invalid_request, NimbusResult};
use crate::local::{unique_hash, CacheConfig, CacheHandle, DEFAULT_MAX_SIZE_BYTES};
use crate::protocol::ClientFrame;
use crate::query::Query;
use crate::remote::session::{SessionConfig, SessionHandle};
use crate::remote::transport::{MessageTransport, WebSocketTransport};
use crate::util::validate::validate_identifier;

use super::collection::CollectionRef;

/// Explicit handle registry: one live handle per api-key, torn down through
/// [`NimbusDb::destroy`] rather than drop timing.
static REGISTRY: Lazy<Mutex<HashMap<String, NimbusDb>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Construction options for a database handle. The defaults match the
/// zero-configuration path: persistent cache on, websocket transport, no
/// per-request timeout.
pub struct DbOptions {
    pub enable_cache: bool,
    pub cache_max_size_bytes: u64,
    pub cache_ttl: Option<Duration>,
    pub cache_directory: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub transport: Option<Arc<dyn MessageTransport>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            cache_ttl: None,
            cache_directory: None,
            timeout: None,
            transport: None,
        }
    }
}

/// Handle to one remote database, identified by its api-key. Cloning is
/// cheap; all clones share the same session and cache.
#[derive(Clone)]
pub struct NimbusDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    api_key: String,
    session: SessionHandle,
    cache: Option<CacheHandle>,
}

impl NimbusDb {
    /// Returns the handle for `api_key`, creating it on first use. Must be
    /// called from within a tokio runtime.
    pub fn with_api_key(api_key: &str) -> NimbusResult<Self> {
        Self::with_options(api_key, DbOptions::default())
    }

    /// As [`NimbusDb::with_api_key`]; options only apply when this call
    /// creates the handle; an existing registry entry is returned as-is.
    pub fn with_options(api_key: &str, options: DbOptions) -> NimbusResult<Self> {
        let mut registry = REGISTRY.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(existing) = registry.get(api_key) {
            return Ok(existing.clone());
        }

        let url = endpoint_url(api_key)?;
        let cache = if options.enable_cache {
            let directory = match options.cache_directory {
                Some(directory) => directory,
                None => default_cache_directory(api_key)?,
            };
            let mut config = CacheConfig::new(directory);
            config.max_size_bytes = options.cache_max_size_bytes;
            config.ttl = options.cache_ttl;
            Some(CacheHandle::open(config)?)
        } else {
            None
        };

        let transport = options
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let session = SessionHandle::spawn(SessionConfig {
            url,
            transport,
            cache: cache.clone(),
            timeout: options.timeout,
        });

        let handle = Self {
            inner: Arc::new(DbInner {
                api_key: api_key.to_owned(),
                session,
                cache,
            }),
        };
        registry.insert(api_key.to_owned(), handle.clone());
        Ok(handle)
    }

    pub fn api_key(&self) -> &str {
        &self.inner.api_key
    }

    pub(crate) fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    pub fn collection(&self, collection_id: &str) -> NimbusResult<CollectionRef> {
        validate_identifier(collection_id)?;
        Ok(CollectionRef::new(
            self.clone(),
            Query::new(collection_id),
        ))
    }

    /// Sends the auth token; it is committed once the server acknowledges.
    pub async fn authorize(&self, token: &str) -> NimbusResult<()> {
        self.inner
            .session
            .request(
                ClientFrame::Auth {
                    token: token.to_owned(),
                },
                true,
            )
            .await
    }

    pub async fn deauthorize(&self) -> NimbusResult<()> {
        self.inner.session.request(ClientFrame::Deauth, false).await
    }

    /// Per-request timeout applied to every subsequent request; `None`
    /// restores the default behaviour (only connection requests time out).
    pub async fn set_timeout(&self, timeout: Option<Duration>) -> NimbusResult<()> {
        self.inner.session.set_timeout(timeout).await
    }

    pub async fn go_offline(&self) -> NimbusResult<()> {
        self.inner.session.go_offline().await
    }

    pub async fn go_online(&self) -> NimbusResult<()> {
        self.inner.session.go_online().await
    }

    pub async fn clear_cache(&self) -> NimbusResult<()> {
        match &self.inner.cache {
            Some(cache) => cache.clear().await,
            None => Ok(()),
        }
    }

    /// Tears the session down and removes the handle from the registry. Any
    /// outstanding requests fail; existing clones become inert.
    pub async fn destroy(&self) -> NimbusResult<()> {
        {
            let mut registry = REGISTRY.lock().unwrap_or_else(|poison| poison.into_inner());
            registry.remove(&self.inner.api_key);
        }
        self.inner.session.destroy().await
    }
}

/// The api-key is the base64-encoded host of the database endpoint.
fn endpoint_url(api_key: &str) -> NimbusResult<Url> {
    let host_bytes = BASE64
        .decode(api_key)
        .map_err(|err| invalid_request(format!("api key is not valid base64: {err}")))?;
    let host = String::from_utf8(host_bytes)
        .map_err(|_| invalid_request("api key does not decode to a host string"))?;
    if host.trim().is_empty() {
        return Err(invalid_request("api key decodes to an empty host"));
    }
    Url::parse(&format!("ws://{host}"))
        .map_err(|err| invalid_request(format!("api key decodes to an invalid host: {err}")))
}

fn default_cache_directory(api_key: &str) -> NimbusResult<PathBuf> {
    let root = dirs::cache_dir()
        .ok_or_else(|| default_error("no platform cache directory available"))?;
    Ok(root.join("nimbusdb").join(unique_hash(api_key)))
}
