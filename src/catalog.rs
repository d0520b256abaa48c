//! Image-stream catalog and candidate repository resolution.
//!
//! An image stream is a named list of tags, each carrying a newest-first
//! history of image references that were pushed or imported under it. The
//! candidate resolver turns that history into a ranked list of remote
//! repositories that may hold a blob.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use relay_oci::{Credentials, ImageReference, Keyring};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Stream annotation marking every registry it references as insecure.
pub const INSECURE_REPOSITORY_ANNOTATION: &str = "relay.registry/insecure-repository";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One historical location of a tag, newest first within [`TagHistory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEvent {
    pub docker_image_reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagHistory {
    pub tag: String,
    #[serde(default)]
    pub items: Vec<TagEvent>,
}

/// Declared import policy for one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    #[serde(default)]
    pub import_insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStream {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Where this stream is served from locally, e.g.
    /// `registry.local:5000/ns/app`. Its registry host is never a candidate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_image_repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_docker_image_repository: String,
    #[serde(default)]
    pub tags: Vec<TagHistory>,
    #[serde(default)]
    pub spec_tags: Vec<TagSpec>,
}

impl ImageStream {
    pub fn reference(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Registry hosts this stream is served from.
    pub fn local_registries(&self) -> Vec<String> {
        [&self.docker_image_repository, &self.public_docker_image_repository]
            .into_iter()
            .filter(|r| !r.is_empty())
            .filter_map(|r| match ImageReference::parse(r) {
                Ok(parsed) => Some(parsed.registry),
                Err(e) => {
                    debug!(stream = %self.reference(), repository = %r, error = %e, "unparsable local repository");
                    None
                }
            })
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// A candidate source repository plus its trust posture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullthroughSpec {
    pub reference: ImageReference,
    pub insecure: bool,
}

/// Ranked candidate repositories, keyed by `as_repository().exact()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    pub repositories: Vec<String>,
    pub specs: HashMap<String, PullthroughSpec>,
}

impl CandidateSet {
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn contains(&self, repository: &str) -> bool {
        self.specs.contains_key(repository)
    }

    pub fn get(&self, repository: &str) -> Option<&PullthroughSpec> {
        self.specs.get(repository)
    }

    /// Candidates in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PullthroughSpec)> {
        self.repositories
            .iter()
            .filter_map(|r| self.specs.get(r).map(|s| (r.as_str(), s)))
    }

    /// This set with every repository of `other` removed. Order is kept.
    pub fn without(mut self, other: &CandidateSet) -> CandidateSet {
        self.repositories.retain(|r| !other.contains(r));
        self.specs.retain(|r, _| !other.contains(r));
        self
    }
}

// ---------------------------------------------------------------------------
// Candidate resolution
// ---------------------------------------------------------------------------

/// Rank the remote repositories an image stream's tag history points at.
///
/// With `primary`, only the newest entry of each tag is considered;
/// otherwise only the older ones. Entries that fail to parse or live on one
/// of `local_registries` are skipped. Secure repositories sort before
/// insecure ones, then by repository name, then by exact reference.
pub fn identify_candidate_repositories(
    stream: &ImageStream,
    local_registries: &[String],
    primary: bool,
) -> CandidateSet {
    let insecure_by_default = stream
        .annotations
        .get(INSECURE_REPOSITORY_ANNOTATION)
        .is_some_and(|v| v == "true");

    let mut insecure_registries: HashMap<String, bool> = HashMap::new();
    let mut search: HashMap<String, ImageReference> = HashMap::new();

    for history in &stream.tags {
        let candidates = match (primary, history.items.as_slice()) {
            (true, [first, ..]) => std::slice::from_ref(first),
            (false, [_, older @ ..]) => older,
            _ => continue,
        };

        let tag_insecure = insecure_by_default
            || stream
                .spec_tags
                .iter()
                .find(|t| t.name == history.tag)
                .is_some_and(|t| t.import_insecure);

        for event in candidates {
            let reference = match ImageReference::parse(&event.docker_image_reference) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if local_registries.iter().any(|l| *l == reference.registry) {
                continue;
            }
            let reference = reference.client_defaults();

            if tag_insecure {
                insecure_registries.insert(reference.registry.clone(), true);
            }
            search.insert(reference.as_repository().exact(), reference);
        }
    }

    let mut ranked: Vec<(String, PullthroughSpec)> = search
        .into_iter()
        .map(|(repo, reference)| {
            let insecure = insecure_registries
                .get(&reference.registry)
                .copied()
                .unwrap_or(false);
            (repo, PullthroughSpec { reference, insecure })
        })
        .collect();
    ranked.sort_by(|(ra, sa), (rb, sb)| match (sa.insecure, sb.insecure) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => ra
            .cmp(rb)
            .then_with(|| sa.reference.exact().cmp(&sb.reference.exact())),
    });

    let repositories = ranked.iter().map(|(r, _)| r.clone()).collect();
    CandidateSet {
        repositories,
        specs: ranked.into_iter().collect(),
    }
}

// ---------------------------------------------------------------------------
// Catalog collaborator
// ---------------------------------------------------------------------------

/// Closed error kinds returned by catalog lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("image stream {0} not found")]
    NotFound(String),

    #[error("access to image stream {0} forbidden")]
    Forbidden(String),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Catalog view of a single image stream.
#[async_trait]
pub trait ImageStreamCatalog: Send + Sync {
    /// `Ok(false)` when the stream does not exist.
    async fn exists(&self) -> std::result::Result<bool, CatalogError>;

    async fn identify_candidate_repositories(
        &self,
        primary: bool,
    ) -> std::result::Result<CandidateSet, CatalogError>;

    /// Registry credentials usable while pulling through for this stream.
    async fn secrets(&self) -> std::result::Result<Keyring, CatalogError>;
}

/// Registry-wide catalog handing out per-stream views.
pub trait Catalog: Send + Sync {
    fn image_stream(&self, namespace: &str, name: &str) -> Arc<dyn ImageStreamCatalog>;
}

/// Registry credentials entry in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySecret {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// On-disk catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub streams: Vec<ImageStream>,
    #[serde(default)]
    pub secrets: Vec<RegistrySecret>,
}

/// Catalog loaded once from a YAML/JSON file.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    streams: Arc<HashMap<String, ImageStream>>,
    keyring: Keyring,
    local_registries: Arc<Vec<String>>,
}

impl StaticCatalog {
    pub fn new(file: CatalogFile, local_registries: Vec<String>) -> Self {
        let mut keyring = Keyring::new();
        for s in &file.secrets {
            keyring.insert(s.registry.clone(), Credentials::new(&s.username, &s.password));
        }
        let streams = file
            .streams
            .into_iter()
            .map(|s| (s.reference(), s))
            .collect();
        Self {
            streams: Arc::new(streams),
            keyring,
            local_registries: Arc::new(local_registries),
        }
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path, local_registries: Vec<String>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::CatalogUnavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: CatalogFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        debug!(path = %path.display(), streams = file.streams.len(), "loaded catalog");
        Ok(Self::new(file, local_registries))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn image_stream(&self, namespace: &str, name: &str) -> Arc<dyn ImageStreamCatalog> {
        Arc::new(StaticImageStream {
            reference: format!("{}/{}", namespace, name),
            catalog: self.clone(),
        })
    }
}

struct StaticImageStream {
    reference: String,
    catalog: StaticCatalog,
}

impl StaticImageStream {
    fn stream(&self) -> std::result::Result<&ImageStream, CatalogError> {
        self.catalog
            .streams
            .get(&self.reference)
            .ok_or_else(|| CatalogError::NotFound(self.reference.clone()))
    }
}

#[async_trait]
impl ImageStreamCatalog for StaticImageStream {
    async fn exists(&self) -> std::result::Result<bool, CatalogError> {
        Ok(self.catalog.streams.contains_key(&self.reference))
    }

    async fn identify_candidate_repositories(
        &self,
        primary: bool,
    ) -> std::result::Result<CandidateSet, CatalogError> {
        let stream = self.stream()?;
        let mut local = stream.local_registries();
        local.extend(self.catalog.local_registries.iter().cloned());
        Ok(identify_candidate_repositories(stream, &local, primary))
    }

    async fn secrets(&self) -> std::result::Result<Keyring, CatalogError> {
        Ok(self.catalog.keyring.clone())
    }
}

/// Catalog document path relative to a config file, if not absolute.
pub fn resolve_catalog_path(config_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}
