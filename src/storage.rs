use crate::annotation::{Aid, AnnotationSet};
use crate::cache::EmbeddingCache;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub aid: Aid,
    /// [`crate::Annotation::input_key`] of the annotation that was embedded.
    pub input_key: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbeddingStore {
    model_tag: String,
    records: Vec<EmbeddingRecord>,
}

/// Platform cache directory, falling back to `./.miewid` when the home
/// directory cannot be resolved.
pub fn default_store_dir() -> PathBuf {
    ProjectDirs::from("org", "wildme", "miewid")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".miewid"))
}

fn store_file(dir: &Path) -> PathBuf {
    dir.join("embeddings.bin")
}

/// Records saved under `model_tag`; a store written by another model is
/// ignored.
pub fn load_records(dir: &Path, model_tag: &str) -> Result<Vec<EmbeddingRecord>> {
    let file = store_file(dir);

    if !file.exists() {
        return Ok(vec![]);
    }

    let data = std::fs::read(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let store: EmbeddingStore = postcard::from_bytes(&data)?;
    if store.model_tag != model_tag {
        warn!(
            "embedding store {} was written by model {}, ignoring it",
            file.display(),
            store.model_tag
        );
        return Ok(vec![]);
    }
    Ok(store.records)
}

pub fn save_records(dir: &Path, model_tag: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = store_file(dir);
    let store = EmbeddingStore {
        model_tag: model_tag.to_string(),
        records,
    };
    let data = postcard::to_allocvec(&store)?;
    std::fs::write(&file, data).with_context(|| format!("writing {}", file.display()))?;
    Ok(())
}

/// Fills `cache` with stored embeddings of `annotations`. A record counts
/// only if its aid still points at the same pixels; aids are reused across
/// annotation files. Returns how many records were loaded.
pub fn restore_cache(dir: &Path, cache: &mut EmbeddingCache, annotations: &AnnotationSet) -> Result<usize> {
    let records = load_records(dir, cache.model_tag())?;
    let mut n = 0;
    let mut stale = 0;
    for record in records {
        match annotations.get(record.aid) {
            Some(annot) if annot.input_key() == record.input_key => {
                cache.insert(record.aid, record.embedding.into());
                n += 1;
            }
            Some(_) => stale += 1,
            None => debug!("stored aid {} is not in the annotation set", record.aid),
        }
    }
    if stale > 0 {
        warn!("skipped {stale} stored embeddings whose annotation changed");
    }
    if n > 0 {
        info!("restored {n} embeddings from {}", dir.display());
    }
    Ok(n)
}

/// Writes every cached embedding of `annotations`, replacing the store.
pub fn persist_cache(dir: &Path, cache: &EmbeddingCache, annotations: &AnnotationSet) -> Result<()> {
    let mut records: Vec<EmbeddingRecord> = cache
        .iter()
        .filter_map(|(aid, emb)| {
            annotations.get(aid).map(|annot| EmbeddingRecord {
                aid,
                input_key: annot.input_key(),
                embedding: emb.to_vec(),
            })
        })
        .collect();
    records.sort_by_key(|r| r.aid);
    save_records(dir, cache.model_tag(), records)
}

pub fn purge(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::tests::annotation;
    use ndarray::array;

    fn set() -> AnnotationSet {
        AnnotationSet::new(vec![annotation(1, Some("a")), annotation(2, Some("b"))]).unwrap()
    }

    #[test]
    fn test_persist_and_restore() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = dir.path().join("store");
        let mut cache = EmbeddingCache::new("abc");
        cache.insert(2, array![0.5, -0.5]);
        cache.insert(1, array![1.0, 0.0]);
        persist_cache(&store, &cache, &set())?;

        let records = load_records(&store, "abc")?;
        assert_eq!(records.iter().map(|r| r.aid).collect::<Vec<_>>(), vec![1, 2]);

        let mut restored = EmbeddingCache::new("abc");
        assert_eq!(restore_cache(&store, &mut restored, &set())?, 2);
        assert_eq!(restored.get(2), Some(&array![0.5, -0.5]));

        let mut other = EmbeddingCache::new("def");
        assert_eq!(restore_cache(&store, &mut other, &set())?, 0);

        purge(&store)?;
        assert!(load_records(&store, "abc")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_skips_reused_aids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cache = EmbeddingCache::new("abc");
        cache.insert(1, array![1.0, 0.0]);
        cache.insert(2, array![0.0, 1.0]);
        cache.insert(7, array![0.6, 0.8]);
        persist_cache(dir.path(), &cache, &set())?;
        // aid 7 has no annotation to key it by
        assert_eq!(load_records(dir.path(), "abc")?.len(), 2);

        let mut moved = annotation(1, Some("a"));
        moved.image_path = "elsewhere/img1.png".into();
        let other_file = AnnotationSet::new(vec![moved, annotation(2, Some("b"))])?;
        let mut restored = EmbeddingCache::new("abc");
        assert_eq!(restore_cache(dir.path(), &mut restored, &other_file)?, 1);
        assert!(!restored.contains(1));
        assert!(restored.contains(2));
        Ok(())
    }
}
