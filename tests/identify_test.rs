use std::path::{Path, PathBuf};

use anyhow::Result;
use image::{Rgb, RgbImage};
use miewid::config::Config;
use miewid::{AnnotationSet, Checkpoint, Identifier};

const IDENTITIES: [(&str, [u8; 3]); 2] = [("zebra", [230, 40, 30]), ("giraffe", [30, 60, 220])];
const OTHER_IDENTITIES: [(&str, [u8; 3]); 2] = [("lion", [200, 170, 40]), ("seal", [70, 80, 90])];

fn write_dataset(dir: &Path) -> Result<PathBuf> {
    write_identities(dir, &IDENTITIES)
}

/// Three identical sightings per identity, plus the COCO file describing them.
/// Ids start at 1 in every file.
fn write_identities(dir: &Path, identities: &[(&str, [u8; 3])]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut images = Vec::new();
    let mut annotations = Vec::new();
    for (k, (name, color)) in identities.iter().enumerate() {
        for j in 0..3u64 {
            let id = k as u64 * 3 + j + 1;
            let file = format!("{name}_{j}.png");
            RgbImage::from_fn(40, 30, |x, y| {
                if (x * (k as u32 + 2) + y) % 5 == 0 {
                    Rgb([255, 255, 255])
                } else {
                    Rgb(*color)
                }
            })
            .save(dir.join(&file))?;
            images.push(serde_json::json!({ "id": id, "file_name": file }));
            annotations.push(serde_json::json!({
                "id": id,
                "image_id": id,
                "bbox": [2.0, 2.0, 36.0, 26.0],
                "name": name,
                "viewpoint": "left",
            }));
        }
    }
    let path = dir.join("instances.json");
    std::fs::write(
        &path,
        serde_json::to_string(&serde_json::json!({ "images": images, "annotations": annotations }))?,
    )?;
    Ok(path)
}

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.data.image_size = [24, 24];
    cfg.model_params.stem_channels = vec![8, 16];
    cfg.model_params.backbone_features = 16;
    cfg.model_params.n_classes = 2;
    cfg.test.batch_size = 2;
    cfg
}

#[test]
fn test_identifier_end_to_end() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let coco = write_dataset(dir.path())?;
    let cfg = config();
    cfg.validate()?;

    let set = AnnotationSet::load_coco(&coco, dir.path())?;
    let aids = set.aids();
    assert_eq!(aids.len(), 6);
    let mut identifier = Identifier::from_config(&cfg, set, None)?;

    let embeddings = identifier.embeddings(&aids)?;
    assert_eq!(embeddings.dim(), (6, 16));
    assert!(embeddings.iter().all(|v| v.is_finite()));
    assert_eq!(identifier.cache().len(), 6);

    let report = identifier.evaluate_distmat(&aids, &[1, 5])?.unwrap();
    assert_eq!(report.num_valid, 6);
    assert_eq!(report.rank(1), 1.0);
    assert!((report.map - 1.0).abs() < 1e-6);

    let scores = identifier.score_pairs(&[1, 1, 1], &[1, 2, 4], false)?;
    assert_eq!(scores[0].score, 0.0);
    assert!(scores[1].score > scores[2].score);

    let loss = identifier.training_loss(&aids)?;
    assert!(loss.is_finite() && loss > 0.0);
    Ok(())
}

#[test]
fn test_checkpoint_reload_and_store() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let coco = write_dataset(dir.path())?;
    let cfg = config();

    let mut fresh = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    let before = fresh.embeddings(&[1, 4])?;
    let fresh_tag = fresh.embedder().fingerprint()?;
    assert_eq!(fresh.cache().model_tag(), fresh_tag);

    let ckpt_path = dir.path().join("model.bin");
    fresh.embedder().net.checkpoint()?.save(&ckpt_path)?;

    // a different seed is a different untrained model
    let mut reseeded_cfg = config();
    reseeded_cfg.engine.seed += 1;
    let mut reseeded = Identifier::from_config(&reseeded_cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    reseeded.embeddings(&[1])?;
    assert_ne!(reseeded.cache().model_tag(), fresh_tag);

    // swapping weights drops everything computed with the old ones
    reseeded.reload_checkpoint(&Checkpoint::load(&ckpt_path)?)?;
    assert!(reseeded.cache().is_empty());
    assert_eq!(reseeded.cache().model_tag(), fresh_tag);
    let swapped = reseeded.embeddings(&[1, 4])?;
    assert!((&before - &swapped).iter().all(|d| d.abs() < 1e-5));

    let mut loaded = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco, dir.path())?, Some(&ckpt_path))?;
    let after = loaded.embeddings(&[1, 4])?;
    assert!((&before - &after).iter().all(|d| d.abs() < 1e-5));

    let store = dir.path().join("store");
    loaded.persist_store(&store)?;
    let mut restored = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco, dir.path())?, Some(&ckpt_path))?;
    assert_eq!(restored.restore_store(&store)?, 2);
    assert!(restored.cache().contains(4));

    let mut untrained = Identifier::from_config(&reseeded_cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    assert_eq!(untrained.restore_store(&store)?, 0);
    Ok(())
}

#[test]
fn test_store_is_not_shared_across_annotation_files() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let coco_a = write_identities(&first, &IDENTITIES)?;
    let coco_b = write_identities(&second, &OTHER_IDENTITIES)?;
    let cfg = config();
    let store = dir.path().join("store");

    let mut a = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco_a, &first)?, None)?;
    let emb_a = a.embeddings(&[1])?;
    a.persist_store(&store)?;

    let set_b = AnnotationSet::load_coco(&coco_b, &second)?;
    assert_eq!(set_b.aids(), vec![1, 2, 3, 4, 5, 6]);
    let mut b = Identifier::from_config(&cfg, set_b, None)?;
    assert_eq!(b.restore_store(&store)?, 0);
    assert!(b.cache().is_empty());
    let emb_b = b.embeddings(&[1])?;
    assert!((&emb_a - &emb_b).iter().any(|d| d.abs() > 1e-3));

    // the same file under another image directory is also a different source
    std::fs::create_dir_all(dir.path().join("copy"))?;
    for entry in std::fs::read_dir(&first)? {
        let entry = entry?;
        std::fs::copy(entry.path(), dir.path().join("copy").join(entry.file_name()))?;
    }
    let mut moved = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco_a, &dir.path().join("copy"))?, None)?;
    assert_eq!(moved.restore_store(&store)?, 0);

    let mut same = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco_a, &first)?, None)?;
    assert_eq!(same.restore_store(&store)?, 1);
    Ok(())
}

#[test]
fn test_failed_reload_keeps_weights_and_cache() -> Result<()> {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir()?;
    let coco = write_dataset(dir.path())?;
    let cfg = config();

    let mut reference = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    let expected = reference.embeddings(&[1, 2, 4])?;

    let mut identifier = Identifier::from_config(&cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    identifier.embeddings(&[1])?;
    let tag = identifier.cache().model_tag().to_string();

    let mut other_cfg = config();
    other_cfg.engine.seed += 1;
    let other = Identifier::from_config(&other_cfg, AnnotationSet::load_coco(&coco, dir.path())?, None)?;
    let mut tensors = other.embedder().net.state_dict();
    tensors.remove("final.weight");
    let broken = Checkpoint::from_state_dict(tensors)?;

    let err = identifier.reload_checkpoint(&broken).unwrap_err();
    assert!(err.to_string().contains("final.weight"));
    assert_eq!(identifier.cache().model_tag(), tag);
    assert_eq!(identifier.cache().len(), 1);
    assert_eq!(identifier.embedder().fingerprint()?, tag);

    let got = identifier.embeddings(&[1, 2, 4])?;
    assert!((&expected - &got).iter().all(|d| d.abs() < 1e-6));
    Ok(())
}
