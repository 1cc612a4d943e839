/*
 * Analysis images on disk
 *
 * A finished analysis is persisted as one image file per input set:
 * the file name is the blake3 hash of the canonically serialized
 * inputs (facts, rules, limits), so a later run with unchanged inputs
 * finds its image by key and skips recomputation entirely. Payloads
 * are msgpack, written to a temp file and renamed so readers never see
 * a half-written image, and read back through a read-only memory map.
 */

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use taintflow_domains::DomainLimits;

use crate::diagnostics::AnalysisResult;
use crate::errors::{EngineError, Result};
use crate::facts::{Callable, FactStore};
use crate::fixpoint::FixpointStatus;
use crate::model::Model;
use crate::rules::TaintRule;

/// Bumped whenever the image layout changes; older images are rejected
/// rather than misread.
const IMAGE_VERSION: u32 = 1;

const IMAGE_EXTENSION: &str = "img";

/// Content key identifying one analysis input set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey(String);

impl ImageKey {
    /// Hash the inputs that determine an analysis outcome. Everything
    /// serialized here is backed by ordered maps, so equal inputs
    /// always produce equal bytes.
    pub fn of(facts: &FactStore, rules: &[TaintRule], limits: &DomainLimits) -> Result<Self> {
        let bytes = rmp_serde::to_vec(&(facts, rules, limits))?;
        Ok(ImageKey(blake3::hash(&bytes).to_hex().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable copy of a finished (or capped) analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisImage {
    pub version: u32,
    pub facts: FactStore,
    pub rules: Vec<TaintRule>,
    pub declared: BTreeMap<Callable, Model>,
    pub models: BTreeMap<Callable, Model>,
    pub results: BTreeMap<Callable, AnalysisResult>,
    pub iterations: usize,
    pub status: Option<FixpointStatus>,
}

impl AnalysisImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        facts: FactStore,
        rules: Vec<TaintRule>,
        declared: BTreeMap<Callable, Model>,
        models: BTreeMap<Callable, Model>,
        results: BTreeMap<Callable, AnalysisResult>,
        iterations: usize,
        status: Option<FixpointStatus>,
    ) -> Self {
        Self {
            version: IMAGE_VERSION,
            facts,
            rules,
            declared,
            models,
            results,
            iterations,
            status,
        }
    }
}

/// Directory of analysis images, one file per input key.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_path(&self, key: &ImageKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.as_str(), IMAGE_EXTENSION))
    }

    /// The stored image for `key`, if one exists.
    pub fn find(&self, key: &ImageKey) -> Option<PathBuf> {
        let path = self.image_path(key);
        path.is_file().then_some(path)
    }

    /// Persist `image` under `key`. Images are immutable per key: equal
    /// inputs converge to equal state, so an existing file is reused.
    pub fn save(&self, key: &ImageKey, image: &AnalysisImage) -> Result<PathBuf> {
        let path = self.image_path(key);
        if path.is_file() {
            debug!(key = %key, "image already on disk");
            return Ok(path);
        }

        let start = Instant::now();
        let payload = rmp_serde::to_vec(image)?;

        // Write-then-rename keeps concurrent readers off partial files.
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&payload)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        info!(
            key = %key,
            bytes = payload.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "analysis image saved"
        );
        Ok(path)
    }

    /// Load one image file. Rejects images written by a different
    /// layout version.
    pub fn load(&self, path: &Path) -> Result<AnalysisImage> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        let image: AnalysisImage = rmp_serde::from_slice(&map)?;
        if image.version != IMAGE_VERSION {
            return Err(EngineError::snapshot(format!(
                "image version {} does not match supported version {} ({})",
                image.version,
                IMAGE_VERSION,
                path.display()
            )));
        }
        debug!(path = %path.display(), bytes = map.len(), "analysis image loaded");
        Ok(image)
    }

    /// Every image in the store, in stable order.
    pub fn images(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(IMAGE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::CallableFacts;
    use tempfile::TempDir;

    fn sample_inputs(marker: &str) -> (FactStore, Vec<TaintRule>, DomainLimits) {
        let mut facts = FactStore::new();
        facts.insert(CallableFacts::new(format!("app.{}", marker), 1));
        let rules = vec![TaintRule::source("framework.source", "UserControlled")];
        (facts, rules, DomainLimits::default())
    }

    fn sample_image(marker: &str) -> (ImageKey, AnalysisImage) {
        let (facts, rules, limits) = sample_inputs(marker);
        let key = ImageKey::of(&facts, &rules, &limits).unwrap();
        let image = AnalysisImage::new(
            facts,
            rules,
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeMap::new(),
            2,
            Some(FixpointStatus::Converged),
        );
        (key, image)
    }

    #[test]
    fn test_save_find_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, image) = sample_image("main");

        let saved = store.save(&key, &image).unwrap();
        let found = store.find(&key).unwrap();
        assert_eq!(saved, found);

        let loaded = store.load(&found).unwrap();
        assert_eq!(loaded, image);
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, _) = sample_image("never-saved");

        assert!(store.find(&key).is_none());
    }

    #[test]
    fn test_equal_inputs_share_one_image() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, image) = sample_image("main");

        let first = store.save(&key, &image).unwrap();
        let second = store.save(&key, &image).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.images().unwrap().len(), 1);
    }

    #[test]
    fn test_different_inputs_get_distinct_images() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key_a, image_a) = sample_image("alpha");
        let (key_b, image_b) = sample_image("beta");

        assert_ne!(key_a, key_b);
        let path_a = store.save(&key_a, &image_a).unwrap();
        let path_b = store.save(&key_b, &image_b).unwrap();
        assert_ne!(path_a, path_b);
        assert_eq!(store.images().unwrap().len(), 2);
    }

    #[test]
    fn test_limits_are_part_of_the_key() {
        let (facts, rules, limits) = sample_inputs("main");
        let tight = limits.with_max_tree_depth(2);

        let loose_key = ImageKey::of(&facts, &rules, &DomainLimits::default()).unwrap();
        let tight_key = ImageKey::of(&facts, &rules, &tight).unwrap();
        assert_ne!(loose_key, tight_key);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, image) = sample_image("main");
        store.save(&key, &image).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.unwrap().path().extension().map(|e| e.to_os_string()))
            .filter(|ext| ext == "tmp")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, mut image) = sample_image("main");
        image.version = 99;

        let path = store.save(&key, &image).unwrap();
        let error = store.load(&path).unwrap_err();
        assert!(matches!(error, EngineError::Snapshot(message) if message.contains("version 99")));
    }

    #[test]
    fn test_truncated_image_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (key, image) = sample_image("main");
        let path = store.save(&key, &image).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(store.load(&path).is_err());
    }
}
