// vidswarm - metadata.rs

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed transfer unit. Every chunk except the last of a file is exactly this long.
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Number of chunks needed to hold `size_bytes`. Zero for an empty file, saturating at `u32::MAX`
/// for sizes no chunk index can address.
pub fn num_chunks(size_bytes: u64) -> u32 {
    let chunks = size_bytes / CHUNK_SIZE + u64::from(size_bytes % CHUNK_SIZE != 0);
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

/// Byte offset at which chunk `index` starts.
pub fn chunk_offset(index: u32) -> u64 {
    index as u64 * CHUNK_SIZE
}

/// True length of chunk `index` in a file of `size_bytes`, zero when the offset is past the end.
pub fn chunk_len(index: u32, size_bytes: u64) -> u64 {
    let offset = chunk_offset(index);
    if offset >= size_bytes {
        return 0;
    }
    CHUNK_SIZE.min(size_bytes - offset)
}

/// A file identified by the SHA-256 of its bytes, as advertised in a catalog.
///
/// The same content may be known under several names; they accumulate and are never removed.
/// `num_chunks` always follows from `size_bytes`: whatever count a peer sends is recomputed on
/// decode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "WireFileRecord")]
pub struct FileRecord {
    pub content_hash: String,
    pub size_bytes: u64,
    pub num_chunks: u32,
    #[serde(default)]
    pub names: Vec<String>,
    /// Only set for files held by this process. Never sent over the wire.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

/// Catalog entry as it arrives from a peer.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileRecord {
    content_hash: String,
    size_bytes: u64,
    #[serde(default)]
    names: Vec<String>,
}

impl From<WireFileRecord> for FileRecord {
    fn from(wire: WireFileRecord) -> Self {
        Self {
            num_chunks: num_chunks(wire.size_bytes),
            content_hash: wire.content_hash,
            size_bytes: wire.size_bytes,
            names: wire.names,
            local_path: None,
        }
    }
}

impl FileRecord {
    pub fn new(content_hash: impl Into<String>, size_bytes: u64, name: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash.into(),
            size_bytes,
            num_chunks: num_chunks(size_bytes),
            names: vec![name.into()],
            local_path: None,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Adds `name` unless it is already known.
    pub fn add_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    /// Shortest known name, or a hash prefix when the record carries no names.
    pub fn display_name(&self) -> String {
        self.names
            .iter()
            .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .cloned()
            .unwrap_or_else(|| self.content_hash.chars().take(12).collect())
    }
}

/// Another process on the network, as learned from its announcements.
///
/// Equality and hashing use the peer id only, so a refreshed identity replaces the old one.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub id: String,
    pub name: String,
    pub address: IpAddr,
    pub control_port: u16,
    pub last_seen: DateTime<Utc>,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: IpAddr, control_port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address,
            control_port,
            last_seen: Utc::now(),
        }
    }

    /// Where this peer's control server listens.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.control_port)
    }
}

/// One logical video as seen by a search: every catalog entry sharing a content hash, merged.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub content_hash: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub num_chunks: u32,
    /// Remote peers currently advertising the hash. Empty for a local-only file.
    pub sources: Vec<PeerIdentity>,
}

impl SearchResult {
    /// First ten characters of the hash.
    pub fn short_hash(&self) -> &str {
        match self.content_hash.char_indices().nth(10) {
            Some((end, _)) => &self.content_hash[..end],
            None => &self.content_hash,
        }
    }
}

impl std::fmt::Display for SearchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}  [{}]  (sources: {})",
            self.display_name,
            self.short_hash(),
            self.sources.len()
        )
    }
}
