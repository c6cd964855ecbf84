//! Read-only annotation snapshots and the identity labels derived from them.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use miewid_vision::ImageInput;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;
use uuid::Uuid;

/// Annotation identifier.
pub type Aid = u64;

/// Prefix marking labels synthesised for annotations without a name.
pub const UNKNOWN: &str = "____";

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub aid: Aid,
    pub image_path: PathBuf,
    /// x, y, w, h
    pub bbox: [f32; 4],
    pub viewpoint: Option<String>,
    pub name: Option<String>,
    pub semantic_uuid: Uuid,
}

impl Annotation {
    /// Identity label used for matching. Unnamed annotations get a label of
    /// their own so they never share an identity with anything else.
    pub fn db_label(&self) -> String {
        match &self.name {
            Some(name) if name != UNKNOWN => name.clone(),
            _ => format!("{UNKNOWN}{}", self.semantic_uuid),
        }
    }

    /// blake3 digest of the pixels' location: image path, bbox and viewpoint.
    pub fn input_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.image_path.to_string_lossy().as_bytes());
        for v in self.bbox {
            hasher.update(&v.to_le_bytes());
        }
        if let Some(view) = &self.viewpoint {
            hasher.update(view.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn image_input(&self) -> ImageInput {
        ImageInput {
            path: self.image_path.clone(),
            bbox: self.bbox,
            viewpoint: self.viewpoint.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CocoFile {
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Deserialize)]
struct CocoImage {
    id: u64,
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct CocoAnnotation {
    id: Aid,
    image_id: u64,
    bbox: [f32; 4],
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    viewpoint: Option<String>,
    #[serde(default)]
    uuid: Option<Uuid>,
}

/// Annotations in insertion order, addressable by aid.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSet {
    annotations: Vec<Annotation>,
    index: HashMap<Aid, usize>,
}

impl AnnotationSet {
    pub fn new(annotations: Vec<Annotation>) -> Result<Self> {
        let mut index = HashMap::with_capacity(annotations.len());
        for (i, annot) in annotations.iter().enumerate() {
            if index.insert(annot.aid, i).is_some() {
                anyhow::bail!("duplicate annotation id {}", annot.aid);
            }
        }
        Ok(Self { annotations, index })
    }

    /// Reads a COCO-style file; image paths resolve against `images_dir`.
    pub fn load_coco(path: &Path, images_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let coco: CocoFile =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let files: HashMap<u64, &str> = coco
            .images
            .iter()
            .map(|img| (img.id, img.file_name.as_str()))
            .collect();

        let annotations = coco
            .annotations
            .into_iter()
            .map(|a| {
                let file = files
                    .get(&a.image_id)
                    .with_context(|| format!("annotation {} references unknown image {}", a.id, a.image_id))?;
                Ok(Annotation {
                    aid: a.id,
                    image_path: images_dir.join(file),
                    bbox: a.bbox,
                    viewpoint: a.viewpoint,
                    name: a.name,
                    semantic_uuid: a.uuid.unwrap_or_else(Uuid::new_v4),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!("loaded {} annotations from {}", annotations.len(), path.display());
        Self::new(annotations)
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter()
    }

    pub fn aids(&self) -> Vec<Aid> {
        self.annotations.iter().map(|a| a.aid).collect()
    }

    pub fn get(&self, aid: Aid) -> Option<&Annotation> {
        self.index.get(&aid).map(|&i| &self.annotations[i])
    }

    pub fn lookup(&self, aids: &[Aid]) -> Result<Vec<&Annotation>> {
        aids.iter()
            .map(|&aid| self.get(aid).with_context(|| format!("unknown annotation {aid}")))
            .collect()
    }

    /// Database labels for `aids`, in order.
    pub fn db_labels(&self, aids: &[Aid]) -> Result<Vec<String>> {
        Ok(self.lookup(aids)?.into_iter().map(Annotation::db_label).collect())
    }

    /// Keeps annotations whose viewpoint is in `viewpoints`.
    pub fn filter_viewpoints(&self, viewpoints: &[String]) -> Result<Self> {
        Self::new(
            self.annotations
                .iter()
                .filter(|a| a.viewpoint.as_ref().is_some_and(|v| viewpoints.contains(v)))
                .cloned()
                .collect(),
        )
    }

    /// Dense class ids `0..n` over the distinct identity labels, in label order.
    pub fn name_to_class(&self) -> BTreeMap<String, usize> {
        let mut names: Vec<String> = self.annotations.iter().map(Annotation::db_label).collect();
        names.sort();
        names.dedup();
        names.into_iter().enumerate().map(|(i, n)| (n, i)).collect()
    }

    fn by_label(&self, aids: &[Aid]) -> Result<BTreeMap<String, Vec<Aid>>> {
        let mut groups: BTreeMap<String, Vec<Aid>> = BTreeMap::new();
        for annot in self.lookup(aids)? {
            groups.entry(annot.db_label()).or_default().push(annot.aid);
        }
        Ok(groups)
    }
}

/// Annotations whose identity is seen at least `n` times in `aids`.
pub fn subset_with_resights(set: &AnnotationSet, aids: &[Aid], n: usize) -> Result<Vec<Aid>> {
    let labels = set.db_labels(aids)?;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in &labels {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    Ok(aids
        .iter()
        .zip(&labels)
        .filter(|(_, label)| counts[label.as_str()] >= n)
        .map(|(&aid, _)| aid)
        .collect())
}

/// Identities with fewer than `min_sights` annotations are dropped; those
/// with more than `max_sights` are randomly subsampled down to it.
pub fn subset_with_resights_range(
    set: &AnnotationSet,
    aids: &[Aid],
    min_sights: usize,
    max_sights: usize,
    seed: u64,
) -> Result<Vec<Aid>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::new();
    for (_, group) in set.by_label(aids)? {
        if group.len() < min_sights {
            continue;
        }
        if group.len() <= max_sights {
            out.extend(group);
        } else {
            let mut picked: Vec<Aid> = group.choose_multiple(&mut rng, max_sights).copied().collect();
            picked.sort_unstable();
            out.extend(picked);
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn annotation(aid: Aid, name: Option<&str>) -> Annotation {
        Annotation {
            aid,
            image_path: PathBuf::from(format!("img{aid}.png")),
            bbox: [0.0, 0.0, 10.0, 10.0],
            viewpoint: Some(if aid % 2 == 0 { "left" } else { "right" }.to_string()),
            name: name.map(str::to_string),
            semantic_uuid: Uuid::from_u128(aid as u128),
        }
    }

    fn sample() -> AnnotationSet {
        AnnotationSet::new(vec![
            annotation(1, Some("a")),
            annotation(2, Some("a")),
            annotation(3, Some("a")),
            annotation(4, Some("b")),
            annotation(5, None),
            annotation(6, Some("b")),
        ])
        .unwrap()
    }

    #[test]
    fn test_unknown_names_get_unique_labels() -> Result<()> {
        let set = sample();
        let labels = set.db_labels(&[1, 5, 4])?;
        assert_eq!(labels[0], "a");
        assert!(labels[1].starts_with(UNKNOWN));
        assert_eq!(labels[2], "b");
        let mut named_unknown = annotation(9, Some(UNKNOWN));
        named_unknown.semantic_uuid = Uuid::from_u128(9);
        assert_ne!(named_unknown.db_label(), annotation(10, None).db_label());
        Ok(())
    }

    #[test]
    fn test_input_key_follows_pixels() {
        let a = annotation(1, Some("a"));
        assert_eq!(a.input_key(), annotation(1, Some("b")).input_key());
        let mut moved = a.clone();
        moved.bbox[0] = 1.0;
        assert_ne!(a.input_key(), moved.input_key());
        let mut elsewhere = a.clone();
        elsewhere.image_path = PathBuf::from("other/img1.png");
        assert_ne!(a.input_key(), elsewhere.input_key());
    }

    #[test]
    fn test_duplicate_aids_rejected() {
        assert!(AnnotationSet::new(vec![annotation(1, None), annotation(1, None)]).is_err());
    }

    #[test]
    fn test_resight_subsets() -> Result<()> {
        let set = sample();
        let aids = set.aids();
        assert_eq!(subset_with_resights(&set, &aids, 3)?, vec![1, 2, 3]);
        assert_eq!(subset_with_resights(&set, &aids, 2)?, vec![1, 2, 3, 4, 6]);

        let ranged = subset_with_resights_range(&set, &aids, 2, 2, 7)?;
        assert_eq!(ranged.len(), 4);
        assert!(ranged.contains(&4) && ranged.contains(&6));
        assert!(!ranged.contains(&5));
        Ok(())
    }

    #[test]
    fn test_filters_and_classes() -> Result<()> {
        let set = sample();
        let left = set.filter_viewpoints(&["left".to_string()])?;
        assert_eq!(left.aids(), vec![2, 4, 6]);
        let classes = set.name_to_class();
        assert_eq!(classes.len(), 3);
        assert!(classes["a"] < classes["b"]);
        Ok(())
    }

    #[test]
    fn test_load_coco() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("instances_test.json");
        std::fs::write(
            &path,
            r#"{
  "images": [{"id": 10, "file_name": "a.jpg"}, {"id": 11, "file_name": "b.jpg"}],
  "annotations": [
    {"id": 1, "image_id": 10, "bbox": [1, 2, 3, 4], "name": "luna", "viewpoint": "left"},
    {"id": 2, "image_id": 11, "bbox": [0, 0, 5, 5]}
  ]
}"#,
        )?;
        let set = AnnotationSet::load_coco(&path, Path::new("/data/images"))?;
        assert_eq!(set.len(), 2);
        let first = set.get(1).unwrap();
        assert_eq!(first.image_path, PathBuf::from("/data/images/a.jpg"));
        assert_eq!(first.bbox, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(first.db_label(), "luna");
        assert!(set.get(2).unwrap().name.is_none());
        Ok(())
    }
}
