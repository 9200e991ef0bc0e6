//! Resource pool: the unit of exchange between pipeline stages.
//!
//! A pool holds named, typed binary entries keyed by (module, path). Entries
//! are never mutated in place; a stage that wants to change content builds a
//! replacement entry and adds it to its output pool. Stages receive a frozen
//! input pool and fill a fresh output pool, so no mutable collection ever
//! crosses a stage boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::error::LinkError;

/// Content classification of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Regular module content.
    Content,
    /// Directory marker.
    Directory,
    /// Symbolic or hard link descriptor.
    Link,
    /// Textual configuration resource.
    Config,
    /// Native execution-engine library.
    NativeLib,
    /// Image launcher binary.
    Launcher,
    /// Anything else.
    Other,
}

impl ResourceKind {
    /// Stable tag byte, used by [`ResourcePool::fingerprint`].
    fn tag(self) -> u8 {
        match self {
            ResourceKind::Content => 0,
            ResourceKind::Directory => 1,
            ResourceKind::Link => 2,
            ResourceKind::Config => 3,
            ResourceKind::NativeLib => 4,
            ResourceKind::Launcher => 5,
            ResourceKind::Other => 6,
        }
    }
}

/// One named binary item inside a pool, scoped to a module and path.
///
/// Identity is (module, path); content bytes are immutable and cheap to
/// share between the input and output pools of a stage.
#[derive(Debug, Clone)]
pub struct Resource {
    module: String,
    path: String,
    kind: ResourceKind,
    bytes: Arc<[u8]>,
}

impl Resource {
    /// Create an entry. The path must begin with `/`.
    pub fn new(
        module: impl Into<String>,
        path: impl Into<String>,
        kind: ResourceKind,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<Self, LinkError> {
        let module = module.into();
        let path = path.into();
        if !path.starts_with('/') {
            return Err(LinkError::Validation(format!(
                "resource path '{path}' must begin with '/'"
            )));
        }
        Ok(Self {
            module,
            path,
            kind,
            bytes: bytes.into().into(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Declared length of the content in bytes.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    /// Name of the immediate parent directory, if the entry is nested.
    pub fn parent_dir_name(&self) -> Option<&str> {
        let dir = &self.path[..self.path.rfind('/')?];
        match dir.rsplit('/').next() {
            Some("") | None => None,
            Some(name) => Some(name),
        }
    }

    /// Replacement entry with the same identity and kind but new content.
    pub fn with_bytes(&self, bytes: impl Into<Vec<u8>>) -> Resource {
        Resource {
            module: self.module.clone(),
            path: self.path.clone(),
            kind: self.kind,
            bytes: bytes.into().into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.path)
    }
}

/// Visitor over pool entries: return a replacement (or the entry itself) to
/// forward it, `None` to drop it.
///
/// Observation of diverted entries happens through accumulators captured by
/// the visitor; the pool offers no peek operation.
pub trait ResourceVisitor {
    fn visit(&mut self, resource: &Resource) -> Result<Option<Resource>>;
}

impl<F> ResourceVisitor for F
where
    F: FnMut(&Resource) -> Result<Option<Resource>>,
{
    fn visit(&mut self, resource: &Resource) -> Result<Option<Resource>> {
        self(resource)
    }
}

/// Insertion-ordered collection of [`Resource`] entries with O(1) identity
/// lookup. Mutable until frozen; the pipeline engine freezes every pool it
/// hands to a stage.
#[derive(Debug, Default)]
pub struct ResourcePool {
    entries: Vec<Resource>,
    index: HashMap<(String, String), usize>,
    frozen: bool,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Fails on duplicate identity or on a frozen pool.
    pub fn add(&mut self, resource: Resource) -> Result<(), LinkError> {
        if self.frozen {
            return Err(LinkError::Validation(format!(
                "cannot add '{resource}' to a frozen pool"
            )));
        }
        let key = (resource.module.clone(), resource.path.clone());
        if self.index.contains_key(&key) {
            return Err(LinkError::Validation(format!(
                "duplicate entry '{resource}'"
            )));
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(resource);
        Ok(())
    }

    /// Look up an entry by identity.
    pub fn get(&self, module: &str, path: &str) -> Option<&Resource> {
        let key = (module.to_string(), path.to_string());
        self.index.get(&key).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, module: &str, path: &str) -> bool {
        self.get(module, path).is_some()
    }

    /// Entries in insertion order. The iterator is restartable: call again
    /// for a fresh pass.
    pub fn contents(&self) -> impl Iterator<Item = &Resource> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the pool against further additions.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Apply `visitor` to every entry in insertion order, adding kept
    /// results to `output`. Runs to the first visitor failure; entries
    /// already forwarded remain in `output`.
    pub fn visit<V>(&self, visitor: &mut V, output: &mut ResourcePool) -> Result<()>
    where
        V: ResourceVisitor + ?Sized,
    {
        for resource in &self.entries {
            if let Some(kept) = visitor.visit(resource)? {
                output.add(kept)?;
            }
        }
        Ok(())
    }

    /// sha256 over identity, kind and content of every entry in insertion
    /// order. Two pools with identical contents produce identical digests,
    /// which is how the determinism tests compare runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for resource in &self.entries {
            hasher.update(resource.module.as_bytes());
            hasher.update([0u8]);
            hasher.update(resource.path.as_bytes());
            hasher.update([resource.kind.tag()]);
            hasher.update(resource.len().to_le_bytes());
            hasher.update(resource.bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}
