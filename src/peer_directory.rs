// vidswarm - peer_directory.rs
//
// Shared registry of known peers, the catalog each of them advertised, and this process's own
// catalog. Discovery writes into it, search and the control server read from it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use itertools::Itertools;

use crate::control_server::CatalogSource;
use crate::metadata::{num_chunks, FileRecord, PeerIdentity, SearchResult};

/// Cheap to clone; every clone shares the same state.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<DirectoryInner>,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    peers: DashMap<String, PeerIdentity>,
    catalogs: DashMap<String, HashMap<String, FileRecord>>,
    local: RwLock<HashMap<String, FileRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `peer`. Returns true when the id was not known before.
    pub fn upsert_peer(&self, peer: PeerIdentity) -> bool {
        self.inner.peers.insert(peer.id.clone(), peer).is_none()
    }

    /// Forgets the peer together with its catalog snapshot.
    pub fn remove_peer(&self, peer_id: &str) {
        self.inner.peers.remove(peer_id);
        self.inner.catalogs.remove(peer_id);
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerIdentity> {
        self.inner.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.inner.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Replaces everything `peer_id` advertises with `records`. Chunk counts are rederived from
    /// the sizes.
    pub fn set_peer_catalog(&self, peer_id: &str, records: Vec<FileRecord>) {
        let snapshot = records
            .into_iter()
            .map(|mut record| {
                record.num_chunks = num_chunks(record.size_bytes);
                record.local_path = None;
                (record.content_hash.clone(), record)
            })
            .collect();
        self.inner.catalogs.insert(peer_id.to_string(), snapshot);
    }

    pub fn peer_catalog(&self, peer_id: &str) -> Vec<FileRecord> {
        self.inner
            .catalogs
            .get(peer_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_local_catalog(&self, records: Vec<FileRecord>) {
        let snapshot = records
            .into_iter()
            .map(|record| (record.content_hash.clone(), record))
            .collect();
        *self.local_write() = snapshot;
    }

    pub fn local_catalog(&self) -> Vec<FileRecord> {
        self.local_read().values().cloned().collect()
    }

    pub fn local_file_by_hash(&self, content_hash: &str) -> Option<FileRecord> {
        self.local_read().get(content_hash).cloned()
    }

    /// Known peers whose current snapshot lists `content_hash`.
    pub fn sources_for_hash(&self, content_hash: &str) -> Vec<PeerIdentity> {
        self.inner
            .catalogs
            .iter()
            .filter(|entry| entry.value().contains_key(content_hash))
            .filter_map(|entry| self.peer(entry.key()))
            .sorted_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)))
            .collect()
    }

    /// Case-insensitive substring search over every known name, remote and local.
    ///
    /// Entries sharing a content hash collapse into one result named after the shortest name seen.
    /// An empty query matches everything. Results are ordered by display name.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let query = query.trim().to_lowercase();
        let mut grouped: HashMap<String, SearchResult> = HashMap::new();

        for entry in self.inner.catalogs.iter() {
            let Some(peer) = self.peer(entry.key()) else {
                continue;
            };
            for record in entry.value().values().filter(|r| matches_query(r, &query)) {
                merge_into(&mut grouped, record).sources.push(peer.clone());
            }
        }

        for record in self.local_read().values().filter(|r| matches_query(r, &query)) {
            merge_into(&mut grouped, record);
        }

        grouped
            .into_values()
            .map(|mut result| {
                result.sources.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                result
            })
            .sorted_by(|a, b| {
                a.display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
                    .then_with(|| a.content_hash.cmp(&b.content_hash))
            })
            .collect()
    }

    fn local_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FileRecord>> {
        self.inner.local.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FileRecord>> {
        self.inner.local.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CatalogSource for PeerDirectory {
    fn files(&self) -> Vec<FileRecord> {
        self.local_catalog()
    }

    fn file_by_hash(&self, content_hash: &str) -> Option<FileRecord> {
        self.local_file_by_hash(content_hash)
    }
}

fn matches_query(record: &FileRecord, query: &str) -> bool {
    query.is_empty() || record.names.iter().any(|name| name.to_lowercase().contains(query))
}

fn merge_into<'a>(grouped: &'a mut HashMap<String, SearchResult>, record: &FileRecord) -> &'a mut SearchResult {
    let name = record.display_name();
    let result = grouped
        .entry(record.content_hash.clone())
        .or_insert_with(|| SearchResult {
            content_hash: record.content_hash.clone(),
            display_name: name.clone(),
            size_bytes: record.size_bytes,
            num_chunks: record.num_chunks,
            sources: Vec::new(),
        });
    let shorter = (name.len(), &name) < (result.display_name.len(), &result.display_name);
    if shorter {
        result.display_name = name;
    }
    result
}
