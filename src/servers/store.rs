use crate::servers::{ServerEndpoint, ServerList};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub type Result<T> = std::result::Result<T, StoreError>;

const STORE_FORMAT_VERSION: &str = "1.0";

/// On-disk document. Endpoints are kept as `host:port` strings so the file
/// stays hand-editable.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedServerList {
    version: String,
    servers: Vec<String>,
    sat_servers: Vec<String>,
    received_at: DateTime<Utc>,
}

/// Durable "last known good" server pool with a round-robin cursor.
///
/// Load failures of any kind fall through to the baked-in defaults; save
/// failures leave the in-memory list authoritative for the running process.
/// The cursor is in-memory only and advances monotonically across updates.
#[derive(Debug)]
pub struct ServerListStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    list: ServerList,
    cursor: usize,
}

impl ServerListStore {
    /// Load the persisted list, falling back to defaults on a missing,
    /// unreadable or corrupt file. `shuffle` randomizes the initial ordering
    /// once so a fleet of clients does not pile onto the same first entry.
    pub async fn load(path: impl Into<PathBuf>, shuffle: bool) -> Self {
        let path = path.into();
        let mut list = match read_persisted(&path).await {
            Ok(list) => {
                tracing::info!(
                    path = %path.display(),
                    servers = list.servers.len(),
                    sat_servers = list.sat_servers.len(),
                    "loaded persisted server list"
                );
                list
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "server list unavailable; using built-in defaults"
                );
                ServerList::defaults()
            }
        };
        if shuffle {
            shuffle_endpoints(&mut list.servers);
            shuffle_endpoints(&mut list.sat_servers);
        }
        Self {
            path,
            inner: Mutex::new(StoreInner { list, cursor: 0 }),
        }
    }

    /// Swap in an authoritative update and persist it atomically. The new
    /// list is visible to the next `next()` call; a failed save is logged and
    /// the in-memory list stands.
    pub async fn replace(&self, list: ServerList) {
        let snapshot = {
            let mut inner = self.lock();
            inner.list = list;
            inner.list.clone()
        };
        if let Err(err) = persist(&self.path, &snapshot).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to persist server list; keeping in-memory copy"
            );
        }
    }

    /// Round-robin over the primary pool; the satellite pool is consulted
    /// only while the primary pool is empty.
    pub fn next(&self) -> Option<ServerEndpoint> {
        let mut inner = self.lock();
        let pool = if inner.list.servers.is_empty() {
            inner.list.sat_servers.clone()
        } else {
            inner.list.servers.clone()
        };
        if pool.is_empty() {
            return None;
        }
        let endpoint = pool[inner.cursor % pool.len()].clone();
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(endpoint)
    }

    /// Restart the rotation from the top of the pool.
    pub fn reset_cursor(&self) {
        self.lock().cursor = 0;
    }

    /// Snapshot of every known endpoint, primary first.
    pub fn all(&self) -> Vec<ServerEndpoint> {
        let inner = self.lock();
        inner.list.all().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn read_persisted(path: &Path) -> Result<ServerList> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| StoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    let doc: PersistedServerList =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let parse_all = |entries: &[String]| -> Vec<ServerEndpoint> {
        entries
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(ep) => Some(ep),
                Err(err) => {
                    tracing::warn!(entry = s.as_str(), error = %err, "skipping persisted entry");
                    None
                }
            })
            .collect()
    };
    let servers = parse_all(&doc.servers);
    let sat_servers = parse_all(&doc.sat_servers);
    if servers.is_empty() && sat_servers.is_empty() {
        return Err(StoreError::NoUsableServers {
            path: path.to_path_buf(),
        });
    }

    Ok(ServerList {
        servers,
        sat_servers,
        received_at: doc.received_at,
    })
}

async fn persist(path: &Path, list: &ServerList) -> Result<()> {
    let doc = PersistedServerList {
        version: STORE_FORMAT_VERSION.to_string(),
        servers: list.servers.iter().map(ToString::to_string).collect(),
        sat_servers: list.sat_servers.iter().map(ToString::to_string).collect(),
        received_at: list.received_at,
    };
    let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Serialize { source })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::EnsureDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|source| StoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

fn shuffle_endpoints(list: &mut [ServerEndpoint]) {
    if list.len() < 2 {
        return;
    }
    let mut seed = [0u8; 8];
    if getrandom::fill(&mut seed).is_err() {
        return;
    }
    // xorshift64 over an OS-seeded state; plenty for load spreading.
    let mut s = u64::from_le_bytes(seed) | 1;
    for i in (1..list.len()).rev() {
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        let j = (s % (i as u64 + 1)) as usize;
        list.swap(i, j);
    }
}

#[derive(Debug)]
pub enum StoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    NoUsableServers {
        path: PathBuf,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(f, "failed to ensure directory '{}': {source}", path.display())
            }
            Self::ReadFile { path, source } => {
                write!(f, "failed to read file '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write file '{}': {source}", path.display())
            }
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Serialize { source } => write!(f, "failed to serialize server list: {source}"),
            Self::Parse { path, source } => write!(
                f,
                "failed to parse server list '{}': {source}",
                path.display()
            ),
            Self::NoUsableServers { path } => write!(
                f,
                "server list '{}' contains no usable endpoints",
                path.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Rename { source, .. } => Some(source),
            Self::Serialize { source } | Self::Parse { source, .. } => Some(source),
            Self::NoUsableServers { .. } => None,
        }
    }
}
