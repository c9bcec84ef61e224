//! Minimal interface to the hosted analysis platform.
//!
//! The gear only needs container lookups, project info, and BIDS downloads.
//! Everything else about the platform's data model is out of scope, so the
//! surface is a trait with an offline implementation for local runs and a
//! static in-memory implementation used by tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Failure from a platform call.
#[derive(Debug, Clone)]
pub enum PlatformError {
    /// Upstream API refused or failed the request.
    Api(String),
    /// The BIDS export itself failed (curation/mapping problems).
    Export(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Api(msg) => write!(f, "api error: {msg}"),
            PlatformError::Export(msg) => write!(f, "bids export error: {msg}"),
        }
    }
}

impl std::error::Error for PlatformError {}

/// Parent container ids of a container, absent levels left unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerParents {
    pub group: Option<String>,
    pub project: Option<String>,
    pub subject: Option<String>,
    pub session: Option<String>,
    pub acquisition: Option<String>,
}

/// One container as seen through the platform API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub container_type: String,
    pub label: String,
    #[serde(default)]
    pub parents: ContainerParents,
    /// Type of the immediate parent, when the container has one.
    #[serde(default)]
    pub parent_type: Option<String>,
}

/// Filters applied to a project-level BIDS download.
#[derive(Debug, Clone, Default)]
pub struct BidsFilter {
    pub src_data: bool,
    pub folders: Vec<String>,
    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub dry_run: bool,
}

/// The platform operations this gear depends on.
pub trait PlatformClient {
    fn get_container(&self, id: &str) -> Result<ContainerInfo, PlatformError>;

    /// Project `info` metadata value for the given key, if present.
    fn project_info_value(
        &self,
        project_id: &str,
        key: &str,
    ) -> Result<Option<String>, PlatformError>;

    /// Download project BIDS data into `dest`, narrowed by `filter`.
    /// Returns the path holding the downloaded tree.
    fn download_project_bids(
        &self,
        dest: &Path,
        filter: &BidsFilter,
    ) -> Result<PathBuf, PlatformError>;

    /// Download the BIDS data of a single acquisition into `dest`.
    fn download_acquisition_bids(
        &self,
        acquisition_id: &str,
        dest: &Path,
        filter: &BidsFilter,
    ) -> Result<(), PlatformError>;
}

/// Client used when no platform connection is available. Every call fails
/// with an API error, which the callers already treat as a soft condition.
#[derive(Debug, Default)]
pub struct OfflineClient;

impl PlatformClient for OfflineClient {
    fn get_container(&self, id: &str) -> Result<ContainerInfo, PlatformError> {
        Err(PlatformError::Api(format!(
            "offline: cannot look up container {id}"
        )))
    }

    fn project_info_value(
        &self,
        _project_id: &str,
        _key: &str,
    ) -> Result<Option<String>, PlatformError> {
        Err(PlatformError::Api("offline: no project info".to_string()))
    }

    fn download_project_bids(
        &self,
        _dest: &Path,
        _filter: &BidsFilter,
    ) -> Result<PathBuf, PlatformError> {
        Err(PlatformError::Api("offline: cannot download".to_string()))
    }

    fn download_acquisition_bids(
        &self,
        _acquisition_id: &str,
        _dest: &Path,
        _filter: &BidsFilter,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Api("offline: cannot download".to_string()))
    }
}

/// In-memory client seeded with containers and canned download content.
/// Used by tests and by local replays of recorded hierarchies.
#[derive(Debug, Default)]
pub struct StaticClient {
    containers: BTreeMap<String, ContainerInfo>,
    project_info: BTreeMap<String, BTreeMap<String, String>>,
    /// Relative file paths written under the destination on download.
    download_files: Vec<String>,
    fail_downloads_with: Option<PlatformError>,
    download_calls: std::cell::Cell<usize>,
}

impl StaticClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(mut self, container: ContainerInfo) -> Self {
        self.containers.insert(container.id.clone(), container);
        self
    }

    pub fn with_project_info(mut self, project_id: &str, key: &str, value: &str) -> Self {
        self.project_info
            .entry(project_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_download_files(mut self, files: &[&str]) -> Self {
        self.download_files = files.iter().map(|file| file.to_string()).collect();
        self
    }

    pub fn failing_downloads(mut self, error: PlatformError) -> Self {
        self.fail_downloads_with = Some(error);
        self
    }

    /// How many download calls reached this client.
    pub fn download_calls(&self) -> usize {
        self.download_calls.get()
    }

    fn materialize(&self, dest: &Path) -> Result<(), PlatformError> {
        for relative in &self.download_files {
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| PlatformError::Api(err.to_string()))?;
            }
            std::fs::write(&target, b"")
                .map_err(|err| PlatformError::Api(err.to_string()))?;
        }
        Ok(())
    }
}

impl PlatformClient for StaticClient {
    fn get_container(&self, id: &str) -> Result<ContainerInfo, PlatformError> {
        self.containers
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::Api(format!("no such container {id}")))
    }

    fn project_info_value(
        &self,
        project_id: &str,
        key: &str,
    ) -> Result<Option<String>, PlatformError> {
        Ok(self
            .project_info
            .get(project_id)
            .and_then(|info| info.get(key))
            .cloned())
    }

    fn download_project_bids(
        &self,
        dest: &Path,
        _filter: &BidsFilter,
    ) -> Result<PathBuf, PlatformError> {
        self.download_calls.set(self.download_calls.get() + 1);
        if let Some(error) = &self.fail_downloads_with {
            return Err(error.clone());
        }
        self.materialize(dest)?;
        Ok(dest.to_path_buf())
    }

    fn download_acquisition_bids(
        &self,
        _acquisition_id: &str,
        dest: &Path,
        _filter: &BidsFilter,
    ) -> Result<(), PlatformError> {
        self.download_calls.set(self.download_calls.get() + 1);
        if let Some(error) = &self.fail_downloads_with {
            return Err(error.clone());
        }
        self.materialize(dest)
    }
}
