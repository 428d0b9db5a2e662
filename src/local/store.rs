//! On-disk dataset store.
//!
//! Layout inside the per-database cache directory:
//!
//! - `00.dat`: cache-info, bucket hash → { full key → last-modified millis }
//! - `01.dat`: refcount-info, unique group hash → { "group/object" → count }
//! - `00<hash>.dat`: per-bucket link table, full key → [[group, object], ..]
//! - `01<hash>.dat`: per-group object table, object id → base64 object bytes
//!
//! The bucket hash is deliberately coarse; collisions land in the same file
//! and are disambiguated by the full-key maps inside it. Every mutation is
//! staged into a single `commit.dat` journal (temp file + rename) before the
//! table files are touched, and a leftover journal is re-applied on open, so
//! the four tables can never be observed torn.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{default_error, NimbusResult};
use crate::logger::Logger;
use crate::model::Document;

pub const DEFAULT_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;

const CACHE_INFO_FILE: &str = "00.dat";
const REFCOUNT_INFO_FILE: &str = "01.dat";
const COMMIT_JOURNAL_FILE: &str = "commit.dat";
const PRUNE_CHUNK: usize = 5;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub max_size_bytes: u64,
    pub ttl: Option<Duration>,
}

impl CacheConfig {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            ttl: None,
        }
    }
}

type CacheInfo = HashMap<String, HashMap<String, i64>>;
type RefcountInfo = HashMap<String, HashMap<String, i64>>;
type LinkTable = HashMap<String, Vec<(String, String)>>;
type ObjectTable = HashMap<String, String>;

/// Staged view of one mutation: file name → new content, or `None` to
/// delete the file. Applied through the journal.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CommitRecord {
    files: HashMap<String, Option<String>>,
}

pub struct CacheStore {
    directory: PathBuf,
    max_size_bytes: u64,
    ttl: Option<Duration>,
    logger: Logger,
}

impl CacheStore {
    /// Opens (creating if needed) the store, re-applies a leftover commit
    /// journal, then runs the one-shot pruning pass.
    pub fn open(config: CacheConfig) -> NimbusResult<Self> {
        fs::create_dir_all(&config.directory)
            .map_err(|err| default_error(format!("failed to create cache directory: {err}")))?;
        let store = Self {
            directory: config.directory,
            max_size_bytes: config.max_size_bytes,
            ttl: config.ttl,
            logger: Logger::new("nimbusdb/cache"),
        };
        store.recover_journal()?;
        store.prune()?;
        Ok(store)
    }

    pub fn save_dataset(
        &self,
        key: &str,
        documents: &[Document],
        secret: Option<&str>,
    ) -> NimbusResult<()> {
        self.write_refs(key, documents, secret)
    }

    pub fn load_dataset(
        &self,
        key: &str,
        secret: Option<&str>,
    ) -> NimbusResult<Option<Vec<Document>>> {
        let bucket = bucket_hash(key);
        let cache_info: CacheInfo = self.read_table(CACHE_INFO_FILE)?;
        if cache_info
            .get(&bucket)
            .and_then(|entries| entries.get(key))
            .is_none()
        {
            return Ok(None);
        }

        let links: LinkTable = self.read_table(&link_table_file(&bucket))?;
        let Some(refs) = links.get(key) else {
            return Ok(None);
        };

        let mut tables: HashMap<String, ObjectTable> = HashMap::new();
        let mut documents = Vec::with_capacity(refs.len());
        for (group, object) in refs {
            let group_hash = unique_hash(group);
            if !tables.contains_key(&group_hash) {
                tables.insert(
                    group_hash.clone(),
                    self.read_table(&object_table_file(&group_hash))?,
                );
            }
            let Some(armored) = tables[&group_hash].get(object) else {
                // A missing object means a prune raced an older link table;
                // skip it rather than failing the whole dataset.
                self.logger
                    .debug(format!("cache object {group}/{object} missing; skipped"));
                continue;
            };
            match decode_object(armored, secret) {
                Ok(document) => documents.push(document),
                Err(err) => {
                    self.logger
                        .warn(format!("failed to decode cached object {group}/{object}: {err}"));
                }
            }
        }
        Ok(Some(documents))
    }

    pub fn remove_dataset(&self, key: &str) -> NimbusResult<()> {
        self.write_refs(key, &[], None)
    }

    /// Deletes every table file, returning the directory to its baseline.
    pub fn clear(&self) -> NimbusResult<()> {
        for entry in self.data_files()? {
            fs::remove_file(&entry)
                .map_err(|err| default_error(format!("failed to clear cache: {err}")))?;
        }
        Ok(())
    }

    /// The shared write path: reconciles refcounts between the previous and
    /// new reference lists for `key`, rewrites affected object tables, and
    /// commits all touched files through the journal. An empty `documents`
    /// slice removes the dataset.
    fn write_refs(
        &self,
        key: &str,
        documents: &[Document],
        secret: Option<&str>,
    ) -> NimbusResult<()> {
        let bucket = bucket_hash(key);
        let link_file = link_table_file(&bucket);

        let mut cache_info: CacheInfo = self.read_table(CACHE_INFO_FILE)?;
        let mut refcounts: RefcountInfo = self.read_table(REFCOUNT_INFO_FILE)?;
        let mut links: LinkTable = self.read_table(&link_file)?;

        let mut previous = links.get(key).cloned().unwrap_or_default();
        let new_refs: Vec<(String, String)> = documents
            .iter()
            .map(|document| (document.collection_id.clone(), document.id.clone()))
            .collect();

        // Survivors keep their count; everything else is a fresh reference.
        for reference in &new_refs {
            if let Some(position) = previous.iter().position(|existing| existing == reference) {
                previous.remove(position);
            } else {
                adjust_refcount(&mut refcounts, reference, 1);
            }
        }

        let mut orphans: Vec<(String, String)> = Vec::new();
        for reference in previous {
            if adjust_refcount(&mut refcounts, &reference, -1) < 1 {
                orphans.push(reference);
            }
        }

        let mut tables: HashMap<String, ObjectTable> = HashMap::new();
        let mut touched_groups: HashSet<String> = HashSet::new();
        for document in documents {
            let group_hash = unique_hash(&document.collection_id);
            if !tables.contains_key(&group_hash) {
                tables.insert(
                    group_hash.clone(),
                    self.read_table(&object_table_file(&group_hash))?,
                );
            }
            let armored = encode_object(document, secret)?;
            if let Some(table) = tables.get_mut(&group_hash) {
                table.insert(document.id.clone(), armored);
            }
            touched_groups.insert(group_hash);
        }
        for (group, object) in &orphans {
            let group_hash = unique_hash(group);
            if !tables.contains_key(&group_hash) {
                tables.insert(
                    group_hash.clone(),
                    self.read_table(&object_table_file(&group_hash))?,
                );
            }
            if let Some(table) = tables.get_mut(&group_hash) {
                table.remove(object);
            }
            touched_groups.insert(group_hash);
        }

        if new_refs.is_empty() {
            links.remove(key);
            if let Some(entries) = cache_info.get_mut(&bucket) {
                entries.remove(key);
            }
            if cache_info
                .get(&bucket)
                .map(HashMap::is_empty)
                .unwrap_or(false)
            {
                cache_info.remove(&bucket);
            }
        } else {
            links.insert(key.to_owned(), new_refs);
            cache_info
                .entry(bucket.clone())
                .or_default()
                .insert(key.to_owned(), chrono::Utc::now().timestamp_millis());
        }

        let mut record = CommitRecord::default();
        record
            .files
            .insert(CACHE_INFO_FILE.into(), serialize_table(&cache_info)?);
        record
            .files
            .insert(REFCOUNT_INFO_FILE.into(), serialize_table(&refcounts)?);
        record.files.insert(
            link_file.clone(),
            if links.is_empty() {
                None
            } else {
                serialize_table(&links)?
            },
        );
        for group_hash in touched_groups {
            let table = &tables[&group_hash];
            record.files.insert(
                object_table_file(&group_hash),
                if table.is_empty() {
                    None
                } else {
                    serialize_table(table)?
                },
            );
        }

        self.commit(record)
    }

    fn commit(&self, record: CommitRecord) -> NimbusResult<()> {
        let journal_path = self.directory.join(COMMIT_JOURNAL_FILE);
        let staged = serde_json::to_string(&record)
            .map_err(|err| default_error(format!("failed to encode commit journal: {err}")))?;
        write_atomic(&journal_path, &staged)?;
        self.apply_record(&record)?;
        fs::remove_file(&journal_path)
            .map_err(|err| default_error(format!("failed to retire commit journal: {err}")))?;
        Ok(())
    }

    fn apply_record(&self, record: &CommitRecord) -> NimbusResult<()> {
        for (name, content) in &record.files {
            let path = self.directory.join(name);
            match content {
                Some(content) => write_atomic(&path, content)?,
                None => {
                    if path.exists() {
                        fs::remove_file(&path).map_err(|err| {
                            default_error(format!("failed to remove cache file {name}: {err}"))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    fn recover_journal(&self) -> NimbusResult<()> {
        let journal_path = self.directory.join(COMMIT_JOURNAL_FILE);
        if !journal_path.exists() {
            return Ok(());
        }
        match fs::read_to_string(&journal_path)
            .ok()
            .and_then(|staged| serde_json::from_str::<CommitRecord>(&staged).ok())
        {
            Some(record) => {
                self.logger.info("re-applying interrupted cache commit");
                self.apply_record(&record)?;
            }
            // A torn journal write means the previous commit never started
            // touching the real files; dropping it is safe.
            None => self.logger.warn("discarding unreadable cache commit journal"),
        }
        fs::remove_file(&journal_path)
            .map_err(|err| default_error(format!("failed to retire commit journal: {err}")))?;
        Ok(())
    }

    /// The one-shot eviction pass: TTL sweep first, then delete oldest
    /// entries five at a time until the directory shrinks to half the cap.
    fn prune(&self) -> NimbusResult<()> {
        if let Some(ttl) = self.ttl {
            let cutoff = chrono::Utc::now().timestamp_millis() - ttl.as_millis() as i64;
            for (key, timestamp) in self.entries_by_age()? {
                if timestamp < cutoff {
                    self.remove_dataset(&key)?;
                }
            }
        }

        if self.disk_size()? <= self.max_size_bytes {
            return Ok(());
        }

        let mut entries = self.entries_by_age()?;
        let target = self.max_size_bytes / 2;
        'evict: while self.disk_size()? > target && !entries.is_empty() {
            let chunk: Vec<_> = entries.drain(..entries.len().min(PRUNE_CHUNK)).collect();
            for (key, _) in chunk {
                self.remove_dataset(&key)?;
                if self.disk_size()? <= target {
                    break 'evict;
                }
            }
        }
        Ok(())
    }

    fn entries_by_age(&self) -> NimbusResult<Vec<(String, i64)>> {
        let cache_info: CacheInfo = self.read_table(CACHE_INFO_FILE)?;
        let mut entries: Vec<(String, i64)> = cache_info
            .into_values()
            .flat_map(HashMap::into_iter)
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    fn disk_size(&self) -> NimbusResult<u64> {
        let mut total = 0;
        for path in self.data_files()? {
            total += fs::metadata(&path)
                .map_err(|err| default_error(format!("failed to stat cache file: {err}")))?
                .len();
        }
        Ok(total)
    }

    fn data_files(&self) -> NimbusResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.directory)
            .map_err(|err| default_error(format!("failed to list cache directory: {err}")))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| default_error(format!("failed to list cache directory: {err}")))?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "dat").unwrap_or(false) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn read_table<T: for<'de> Deserialize<'de> + Default>(&self, name: &str) -> NimbusResult<T> {
        let path = self.directory.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let text = fs::read_to_string(&path)
            .map_err(|err| default_error(format!("failed to read cache file {name}: {err}")))?;
        serde_json::from_str(&text)
            .map_err(|err| default_error(format!("failed to parse cache file {name}: {err}")))
    }
}

fn serialize_table<T: Serialize>(table: &T) -> NimbusResult<Option<String>> {
    serde_json::to_string(table)
        .map(Some)
        .map_err(|err| default_error(format!("failed to encode cache table: {err}")))
}

fn adjust_refcount(
    refcounts: &mut RefcountInfo,
    (group, object): &(String, String),
    delta: i64,
) -> i64 {
    let group_hash = unique_hash(group);
    let entries = refcounts.entry(group_hash.clone()).or_default();
    let slot = entries.entry(format!("{group}/{object}")).or_insert(0);
    *slot = (*slot + delta).max(0);
    let result = *slot;
    if result == 0 {
        entries.remove(&format!("{group}/{object}"));
        if entries.is_empty() {
            refcounts.remove(&group_hash);
        }
    }
    result
}

fn link_table_file(bucket: &str) -> String {
    format!("00{bucket}.dat")
}

fn object_table_file(group_hash: &str) -> String {
    format!("01{group_hash}.dat")
}

fn encode_object(document: &Document, secret: Option<&str>) -> NimbusResult<String> {
    let archived = json!({
        "col-id": document.collection_id,
        "doc": document.to_wire(),
    });
    let mut bytes = serde_json::to_vec(&archived)
        .map_err(|err| default_error(format!("failed to archive cached object: {err}")))?;
    if let Some(secret) = secret {
        xor_bytes(&mut bytes, secret);
    }
    Ok(BASE64.encode(bytes))
}

fn decode_object(armored: &str, secret: Option<&str>) -> NimbusResult<Document> {
    let mut bytes = BASE64
        .decode(armored)
        .map_err(|err| default_error(format!("cached object is not valid base64: {err}")))?;
    if let Some(secret) = secret {
        xor_bytes(&mut bytes, secret);
    }
    let archived: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|err| default_error(format!("cached object bytes are not valid JSON: {err}")))?;
    let collection_id = archived
        .get("col-id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| default_error("cached object is missing its collection id"))?;
    let raw = archived
        .get("doc")
        .ok_or_else(|| default_error("cached object is missing its document"))?;
    Document::from_wire(collection_id, raw)
}

/// Byte-wise XOR against the secret. Applying it twice restores the input;
/// this is obfuscation keyed on the auth token, not encryption.
pub fn xor_bytes(bytes: &mut [u8], secret: &str) {
    let secret = secret.as_bytes();
    if secret.is_empty() {
        return;
    }
    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte ^= secret[index % secret.len()];
    }
}

/// Coarse, collision-tolerant bucket id: lowercase the key, build
/// (char, frequency) pairs sorted ascending by (frequency, char), then fold
/// `sum((i+1) * 101 * freq * code) mod 2^31`.
pub fn bucket_hash(key: &str) -> String {
    let lower = key.to_lowercase();
    let mut frequencies: BTreeMap<char, u64> = BTreeMap::new();
    for ch in lower.chars() {
        *frequencies.entry(ch).or_insert(0) += 1;
    }
    let mut pairs: Vec<(char, u64)> = frequencies.into_iter().collect();
    pairs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut accumulator: u64 = 0;
    for (index, (ch, frequency)) in pairs.iter().enumerate() {
        accumulator = (accumulator + (index as u64 + 1) * 101 * frequency * (*ch as u64))
            % (1 << 31);
    }
    accumulator.to_string()
}

/// Injective hash over the identifier alphabet: the concatenation of each
/// character's decimal code. Used where buckets must never collide.
pub fn unique_hash(key: &str) -> String {
    let mut hash = String::with_capacity(key.len() * 3);
    for ch in key.chars() {
        hash.push_str(&(ch as u32).to_string());
    }
    hash
}

fn write_atomic(path: &Path, contents: &str) -> NimbusResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, contents)
        .map_err(|err| default_error(format!("failed to stage cache file: {err}")))?;
    fs::rename(&staging, path)
        .map_err(|err| default_error(format!("failed to commit cache file: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_store(max_size: u64, ttl: Option<Duration>) -> CacheStore {
        let directory = std::env::temp_dir().join(format!(
            "nimbusdb-cache-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = fs::remove_dir_all(&directory);
        let mut config = CacheConfig::new(directory);
        config.max_size_bytes = max_size;
        config.ttl = ttl;
        CacheStore::open(config).unwrap()
    }

    fn document(collection: &str, id: &str, payload: JsonValue) -> Document {
        Document::from_wire(
            collection,
            &json!({"id": id, "etag": format!("e-{id}"), "body": payload}),
        )
        .unwrap()
    }

    #[test]
    fn datasets_round_trip_without_a_secret() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        let docs = vec![
            document("messages", "a", json!({"t": "hi"})),
            document("messages", "b", json!({"t": "yo"})),
        ];
        store.save_dataset("hash-1", &docs, None).unwrap();
        let loaded = store.load_dataset("hash-1", None).unwrap().unwrap();
        assert_eq!(loaded, docs);
    }

    #[test]
    fn datasets_round_trip_with_a_secret() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        let docs = vec![document("messages", "a", json!({"t": "secret text"}))];
        store.save_dataset("hash-1", &docs, Some("tok-123")).unwrap();
        let loaded = store
            .load_dataset("hash-1", Some("tok-123"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, docs);

        // The wrong secret produces garbage bytes, which decode to nothing.
        let wrong = store.load_dataset("hash-1", Some("other")).unwrap().unwrap();
        assert!(wrong.is_empty());
    }

    #[test]
    fn missing_keys_load_as_none() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        assert!(store.load_dataset("absent", None).unwrap().is_none());
    }

    #[test]
    fn shared_objects_are_refcounted_across_datasets() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        let shared = document("messages", "shared", json!({"n": 1}));
        let only_a = document("messages", "only-a", json!({"n": 2}));

        store
            .save_dataset("ds-a", &[shared.clone(), only_a.clone()], None)
            .unwrap();
        store.save_dataset("ds-b", &[shared.clone()], None).unwrap();

        // Removing one dataset keeps the shared object alive for the other.
        store.remove_dataset("ds-a").unwrap();
        let loaded = store.load_dataset("ds-b", None).unwrap().unwrap();
        assert_eq!(loaded, vec![shared]);
        assert!(store.load_dataset("ds-a", None).unwrap().is_none());
    }

    #[test]
    fn writes_ending_in_removal_return_to_baseline() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        for round in 0..3 {
            let docs = vec![document("messages", &format!("d{round}"), json!({"n": round}))];
            store.save_dataset("ds", &docs, None).unwrap();
        }
        store.remove_dataset("ds").unwrap();

        let refcounts: RefcountInfo = store.read_table(REFCOUNT_INFO_FILE).unwrap();
        assert!(refcounts.is_empty());
        let cache_info: CacheInfo = store.read_table(CACHE_INFO_FILE).unwrap();
        assert!(cache_info.is_empty());
        for path in store.data_files().unwrap() {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(
                name == CACHE_INFO_FILE || name == REFCOUNT_INFO_FILE,
                "unexpected leftover cache file {name}"
            );
        }
    }

    #[test]
    fn clear_removes_every_table_file() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        store
            .save_dataset("ds", &[document("messages", "a", json!({}))], None)
            .unwrap();
        store.clear().unwrap();
        assert!(store.data_files().unwrap().is_empty());
    }

    #[test]
    fn reopening_prunes_oversized_caches_to_half_the_cap() {
        let max_size = 1024 * 1024;
        let store = temp_store(max_size as u64, None);
        let blob = "x".repeat(200 * 1024);
        for index in 0..10 {
            let docs = vec![document(
                "blobs",
                &format!("blob-{index}"),
                json!({"data": blob}),
            )];
            store.save_dataset(&format!("ds-{index}"), &docs, None).unwrap();
        }
        let directory = store.directory.clone();
        drop(store);

        let mut config = CacheConfig::new(directory);
        config.max_size_bytes = max_size as u64;
        let reopened = CacheStore::open(config).unwrap();
        assert!(reopened.disk_size().unwrap() <= max_size as u64 / 2);

        // Oldest entries go first; the newest dataset must survive.
        assert!(reopened.load_dataset("ds-9", None).unwrap().is_some());
        assert!(reopened.load_dataset("ds-0", None).unwrap().is_none());
        let refcounts: RefcountInfo = reopened.read_table(REFCOUNT_INFO_FILE).unwrap();
        let live: usize = refcounts.values().map(HashMap::len).sum();
        let linked: usize = reopened
            .entries_by_age()
            .unwrap()
            .iter()
            .map(|(key, _)| {
                reopened
                    .load_dataset(key, None)
                    .unwrap()
                    .map(|docs| docs.len())
                    .unwrap_or(0)
            })
            .sum();
        assert_eq!(live, linked, "refcount-info must not hold orphans");
    }

    #[test]
    fn expired_entries_are_swept_on_open() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        store
            .save_dataset("old", &[document("messages", "a", json!({}))], None)
            .unwrap();
        let directory = store.directory.clone();
        drop(store);

        // Backdate the entry far past any reasonable TTL.
        let path = directory.join(CACHE_INFO_FILE);
        let mut cache_info: CacheInfo =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        for entries in cache_info.values_mut() {
            for timestamp in entries.values_mut() {
                *timestamp = 0;
            }
        }
        fs::write(&path, serde_json::to_string(&cache_info).unwrap()).unwrap();

        let mut config = CacheConfig::new(directory);
        config.ttl = Some(Duration::from_secs(60));
        let reopened = CacheStore::open(config).unwrap();
        assert!(reopened.load_dataset("old", None).unwrap().is_none());
    }

    #[test]
    fn leftover_journals_are_applied_on_open() {
        let store = temp_store(DEFAULT_MAX_SIZE_BYTES, None);
        let directory = store.directory.clone();
        drop(store);

        let record = CommitRecord {
            files: HashMap::from([(
                "00.dat".to_string(),
                Some(r#"{"123": {"ds": 1}}"#.to_string()),
            )]),
        };
        fs::write(
            directory.join(COMMIT_JOURNAL_FILE),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let reopened = CacheStore::open(CacheConfig::new(directory.clone())).unwrap();
        let cache_info: CacheInfo = reopened.read_table(CACHE_INFO_FILE).unwrap();
        assert_eq!(cache_info["123"]["ds"], 1);
        assert!(!directory.join(COMMIT_JOURNAL_FILE).exists());
    }

    #[test]
    fn xor_is_an_involution() {
        let original = b"hello nimbus \x00\xff bytes".to_vec();
        for secret in ["t", "token-1", "a-much-longer-secret-value"] {
            let mut bytes = original.clone();
            xor_bytes(&mut bytes, secret);
            assert_ne!(bytes, original);
            xor_bytes(&mut bytes, secret);
            assert_eq!(bytes, original);
        }
    }

    #[test]
    fn bucket_hash_is_deterministic_and_case_insensitive() {
        assert_eq!(bucket_hash("MyKey"), bucket_hash("mykey"));
        assert_eq!(bucket_hash("col#messages"), bucket_hash("col#messages"));
        let value: u64 = bucket_hash("col#messages|f#|o#|p#").parse().unwrap();
        assert!(value < (1 << 31));
    }

    #[test]
    fn unique_hash_is_injective_over_identifiers() {
        let keys = ["a", "b", "ab", "ba", "a1", "1a", "messages", "message-s"];
        let mut seen = HashSet::new();
        for key in keys {
            assert!(seen.insert(unique_hash(key)), "collision for {key}");
        }
        assert_eq!(unique_hash("ab"), "9798");
    }
}
