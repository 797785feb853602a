//! Deployment catalog: master/worker socket addresses and the query log.
//!
//! Backed by a JSON document on disk, or held purely in memory for embedded
//! use and tests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strand_common::{QueryId, Result, StrandError, WorkerId};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Host and port of one process.
pub struct SocketInfo {
    pub host: String,
    pub port: u16,
}

impl SocketInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for SocketInfo {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| StrandError::Catalog(format!("socket '{s}' is not host:port")))?;
        let port = port
            .parse()
            .map_err(|e| StrandError::Catalog(format!("socket '{s}' has a bad port: {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// One submitted query as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: QueryId,
    pub raw_query: String,
    pub logical_ra: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogDocument {
    masters: Vec<SocketInfo>,
    workers: BTreeMap<u32, SocketInfo>,
    #[serde(default)]
    queries: Vec<QueryRecord>,
}

#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    doc: CatalogDocument,
    closed: bool,
}

impl Catalog {
    pub fn in_memory(
        master: SocketInfo,
        workers: impl IntoIterator<Item = (WorkerId, SocketInfo)>,
    ) -> Self {
        Self {
            path: None,
            doc: CatalogDocument {
                masters: vec![master],
                workers: workers.into_iter().map(|(w, s)| (w.0, s)).collect(),
                queries: Vec::new(),
            },
            closed: false,
        }
    }

    /// Load a catalog file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = std::fs::read_to_string(path).map_err(|e| {
            StrandError::Catalog(format!("failed to read catalog '{}': {e}", path.display()))
        })?;
        let doc: CatalogDocument = serde_json::from_str(&payload).map_err(|e| {
            StrandError::Catalog(format!("failed to parse catalog '{}': {e}", path.display()))
        })?;
        info!(
            path = %path.display(),
            workers = doc.workers.len(),
            queries = doc.queries.len(),
            "catalog loaded"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            doc,
            closed: false,
        })
    }

    /// Write an in-memory catalog to `path`; later changes persist there.
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.path = Some(path.as_ref().to_path_buf());
        self.persist()
    }

    /// The single master. Zero or several masters is a catalog error.
    pub fn master(&self) -> Result<&SocketInfo> {
        match self.doc.masters.as_slice() {
            [master] => Ok(master),
            masters => Err(StrandError::Catalog(format!(
                "catalog must list exactly one master, found {}",
                masters.len()
            ))),
        }
    }

    pub fn workers(&self) -> HashMap<WorkerId, SocketInfo> {
        self.doc
            .workers
            .iter()
            .map(|(id, socket)| (WorkerId(*id), socket.clone()))
            .collect()
    }

    pub fn queries(&self) -> &[QueryRecord] {
        &self.doc.queries
    }

    /// Record a new query and return its freshly assigned id.
    pub fn new_query(&mut self, raw_query: &str, logical_ra: &str) -> Result<QueryId> {
        if self.closed {
            return Err(StrandError::Catalog("catalog is closed".to_string()));
        }
        let next = self
            .doc
            .queries
            .iter()
            .map(|q| q.query_id.0)
            .max()
            .unwrap_or(0)
            + 1;
        let query_id = QueryId(next);
        self.doc.queries.push(QueryRecord {
            query_id,
            raw_query: raw_query.to_string(),
            logical_ra: logical_ra.to_string(),
        });
        self.persist()?;
        Ok(query_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush and close. Further calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.persist()?;
        self.closed = true;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let payload = serde_json::to_string_pretty(&self.doc)
            .map_err(|e| StrandError::Catalog(format!("failed to encode catalog: {e}")))?;
        std::fs::write(path, payload).map_err(|e| {
            StrandError::Catalog(format!("failed to write catalog '{}': {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}.json"))
    }

    #[test]
    fn socket_parsing() {
        let s: SocketInfo = "localhost:8001".parse().expect("socket");
        assert_eq!(s, SocketInfo::new("localhost", 8001));
        assert_eq!(s.to_string(), "localhost:8001");
        assert!("localhost".parse::<SocketInfo>().is_err());
        assert!("localhost:port".parse::<SocketInfo>().is_err());
    }

    #[test]
    fn query_ids_increase_and_persist() {
        let path = unique_path("strand_catalog");
        let mut catalog = Catalog::in_memory(
            SocketInfo::new("master", 8001),
            [(WorkerId(1), SocketInfo::new("w1", 9001))],
        );
        catalog.save_as(&path).expect("save");
        assert_eq!(catalog.new_query("q1", "ra1").expect("q1"), QueryId(1));
        assert_eq!(catalog.new_query("q2", "ra2").expect("q2"), QueryId(2));
        catalog.close().expect("close");
        assert!(catalog.new_query("q3", "ra3").is_err());

        let reloaded = Catalog::load(&path).expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(reloaded.queries().len(), 2);
        assert_eq!(reloaded.workers()[&WorkerId(1)], SocketInfo::new("w1", 9001));
        assert_eq!(reloaded.master().expect("master").port, 8001);
    }

    #[test]
    fn master_count_is_validated() {
        let path = unique_path("strand_catalog_masters");
        std::fs::write(
            &path,
            r#"{"masters":[{"host":"a","port":1},{"host":"b","port":2}],"workers":{}}"#,
        )
        .expect("write");
        let catalog = Catalog::load(&path).expect("load");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(catalog.master(), Err(StrandError::Catalog(_))));
        assert!(matches!(
            Catalog::load(unique_path("strand_catalog_missing")),
            Err(StrandError::Catalog(_))
        ));
    }
}
