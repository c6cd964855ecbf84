//! The embedding network and its checkpoint round trip.

use anyhow::Result;
use log::{debug, warn};
use ndarray::{Array2, Array4};
use rand::{rngs::StdRng, SeedableRng};

use crate::backbone::Backbone;
use crate::checkpoint::{Checkpoint, StateDict};
use crate::error::ModelError;
use crate::gem::Gem;
use crate::heads::{check_labels, cross_entropy, Head, LossModule, MarginParams};
use crate::layers::{BatchNorm1d, Dropout, LayerKind, Linear};

/// Head and projection settings of [`MiewIdNet`].
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub n_classes: usize,
    pub use_fc: bool,
    pub fc_dim: usize,
    pub dropout: f32,
    pub loss_module: LossModule,
    pub margin: MarginParams,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Debug, Clone)]
pub enum Output {
    Embeddings(Array2<f32>),
    Logits(Array2<f32>),
}

impl Output {
    pub fn into_inner(self) -> Array2<f32> {
        match self {
            Output::Embeddings(x) | Output::Logits(x) => x,
        }
    }
}

struct Projection {
    dropout: Dropout,
    fc: Linear,
    bn: BatchNorm1d,
}

/// Backbone → GeM → BatchNorm (→ dropout → fc → BatchNorm) → embedding,
/// with a classification head used only in training mode.
pub struct MiewIdNet {
    backbone: Box<dyn Backbone>,
    pooling: Gem,
    bn: BatchNorm1d,
    projection: Option<Projection>,
    head: Head,
    loss_module: LossModule,
    margin: MarginParams,
    mode: Mode,
    rng: StdRng,
}

impl MiewIdNet {
    pub fn new(backbone: Box<dyn Backbone>, cfg: &NetConfig) -> Result<Self> {
        if cfg.n_classes == 0 {
            anyhow::bail!("n_classes must be positive");
        }
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let features = backbone.out_features();
        let projection = if cfg.use_fc {
            Some(Projection {
                dropout: Dropout { p: cfg.dropout },
                fc: Linear::new(features, cfg.fc_dim, false, LayerKind::Linear, &mut rng),
                bn: BatchNorm1d::new(cfg.fc_dim),
            })
        } else {
            None
        };
        let embedding_dim = projection.as_ref().map_or(features, |p| p.fc.out_features());
        let head = Head::build(cfg.loss_module, embedding_dim, cfg.n_classes, &cfg.margin, &mut rng);
        debug!(
            "built network: {features} backbone features, {embedding_dim}-d embedding, {} head, {} classes",
            cfg.loss_module.as_str(),
            cfg.n_classes
        );
        Ok(Self {
            backbone,
            pooling: Gem::default(),
            bn: BatchNorm1d::new(features),
            projection,
            head,
            loss_module: cfg.loss_module,
            margin: cfg.margin,
            mode: Mode::Train,
            rng,
        })
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn embedding_dim(&self) -> usize {
        self.head.in_features()
    }

    pub fn n_classes(&self) -> usize {
        self.head.n_classes()
    }

    pub fn pooling(&self) -> &Gem {
        &self.pooling
    }

    /// Embeddings for a normalised NCHW batch, before any head.
    pub fn extract_feat(&mut self, images: &Array4<f32>) -> Result<Array2<f32>> {
        let training = self.mode == Mode::Train;
        let features = self.backbone.forward(images)?;
        let pooled = self.pooling.forward(&features)?;
        let x = self.bn.forward(&pooled, training);
        match self.projection.as_mut() {
            Some(p) => {
                let x = p.dropout.forward(&x, training, &mut self.rng);
                let x = p.fc.forward(&x);
                Ok(p.bn.forward(&x, training))
            }
            None => Ok(x),
        }
    }

    /// Eval mode returns embeddings. Train mode needs one label per image and
    /// returns class logits.
    pub fn forward(&mut self, images: &Array4<f32>, labels: Option<&[usize]>) -> Result<Output> {
        if self.mode == Mode::Eval {
            return Ok(Output::Embeddings(self.extract_feat(images)?));
        }
        let labels = labels.ok_or(ModelError::MissingLabels)?;
        check_labels(labels, images.dim().0, self.n_classes())?;
        let feature = self.extract_feat(images)?;
        Ok(Output::Logits(self.head.forward(&feature, labels, &mut self.rng)))
    }

    /// Training-mode cross-entropy of a labelled batch.
    pub fn loss(&mut self, images: &Array4<f32>, labels: &[usize]) -> Result<f32> {
        let mode = self.mode;
        self.train();
        let logits = self.forward(images, Some(labels));
        self.mode = mode;
        cross_entropy(&logits?.into_inner(), labels)
    }

    pub fn state_dict(&self) -> StateDict {
        let mut sd = StateDict::new();
        self.backbone.state_dict("backbone", &mut sd);
        self.pooling.state_dict("pooling", &mut sd);
        self.bn.state_dict("bn", &mut sd);
        if let Some(p) = &self.projection {
            p.fc.state_dict("fc", &mut sd);
            p.bn.state_dict("bn2", &mut sd);
        }
        self.head.state_dict("final", &mut sd);
        sd
    }

    /// Loads every parameter the architecture expects. A head trained on a
    /// different number of classes is rebuilt to the checkpoint's size since
    /// inference discards it anyway. Nothing is modified unless the whole
    /// dict passes [`Self::check_state_dict`].
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        let stored_classes = self.check_state_dict(sd)?;
        // the only value check left; runs before any other group is touched
        self.pooling.load_state_dict("pooling", sd)?;
        self.backbone.load_state_dict("backbone", sd)?;
        self.bn.load_state_dict("bn", sd)?;
        if let Some(p) = self.projection.as_mut() {
            p.fc.load_state_dict("fc", sd)?;
            p.bn.load_state_dict("bn2", sd)?;
        }

        if let Some(stored) = stored_classes {
            if stored != self.n_classes() {
                warn!(
                    "checkpoint head has {stored} classes, model was configured with {}; using checkpoint value",
                    self.n_classes()
                );
                self.head = Head::build(
                    self.loss_module,
                    self.embedding_dim(),
                    stored,
                    &self.margin,
                    &mut self.rng,
                );
            }
        }
        self.head.load_state_dict("final", sd)?;
        Ok(())
    }

    /// Checks that `sd` holds every expected tensor with the expected shape.
    /// Head tensors may carry a different class count. Returns that count.
    pub fn check_state_dict(&self, sd: &StateDict) -> Result<Option<usize>> {
        let stored_classes = sd.get("final.weight").and_then(|w| w.shape().first().copied());
        let expected = self.state_dict();
        for (name, tensor) in &expected {
            let mut shape = tensor.shape().to_vec();
            if let Some(stored) = stored_classes.filter(|_| name.starts_with("final.")) {
                shape[0] = stored;
            }
            let got = sd
                .get(name)
                .ok_or_else(|| ModelError::MissingParameter(name.clone()))?;
            if got.shape() != shape.as_slice() {
                return Err(ModelError::ShapeMismatch {
                    name: name.clone(),
                    expected: shape,
                    got: got.shape().to_vec(),
                }
                .into());
            }
        }
        for key in sd.keys().filter(|k| !expected.contains_key(*k)) {
            warn!("ignoring unexpected checkpoint tensor {key}");
        }
        Ok(stored_classes)
    }

    /// blake3 digest of every weight plus the external backbone's identity.
    /// Two nets with the same fingerprint produce the same embeddings.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.checkpoint()?.fingerprint.as_bytes());
        if let Some(backbone) = self.backbone.fingerprint() {
            hasher.update(backbone.as_bytes());
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    pub fn load_checkpoint(&mut self, ckpt: &Checkpoint) -> Result<()> {
        self.load_state_dict(&ckpt.tensors)
    }

    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Checkpoint::from_state_dict(self.state_dict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::ConvStem;

    fn config(loss_module: LossModule, use_fc: bool) -> NetConfig {
        NetConfig {
            n_classes: 3,
            use_fc,
            fc_dim: 5,
            dropout: 0.0,
            loss_module,
            margin: MarginParams::default(),
            seed: 42,
        }
    }

    fn net(loss_module: LossModule, use_fc: bool) -> Result<MiewIdNet> {
        let stem = ConvStem::new(3, &[4, 6], &mut StdRng::seed_from_u64(1))?;
        MiewIdNet::new(Box::new(stem), &config(loss_module, use_fc))
    }

    fn images() -> Array4<f32> {
        Array4::from_shape_fn((2, 3, 8, 8), |(n, c, i, j)| ((n + c + i * j) % 5) as f32 / 5.0)
    }

    #[test]
    fn test_train_forward_requires_labels() -> Result<()> {
        let mut model = net(LossModule::Arcface, false)?;
        model.train();
        let err = model.forward(&images(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::MissingLabels)
        ));
        let err = model.forward(&images(), Some(&[0, 3])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::LabelOutOfRange { label: 3, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_modes_produce_expected_shapes() -> Result<()> {
        for loss in [LossModule::Arcface, LossModule::ElasticArcface, LossModule::Softmax] {
            let mut model = net(loss, true)?;
            let logits = model.forward(&images(), Some(&[0, 2]))?;
            assert!(matches!(&logits, Output::Logits(l) if l.dim() == (2, 3)));
            model.eval();
            let emb = model.forward(&images(), None)?;
            assert!(matches!(&emb, Output::Embeddings(e) if e.dim() == (2, 5)));
        }
        let mut plain = net(LossModule::Softmax, false)?;
        plain.eval();
        assert_eq!(plain.extract_feat(&images())?.dim(), (2, 6));
        Ok(())
    }

    #[test]
    fn test_loss_restores_mode() -> Result<()> {
        let mut model = net(LossModule::Softmax, false)?;
        model.eval();
        let loss = model.loss(&images(), &[1, 1])?;
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(model.mode(), Mode::Eval);
        Ok(())
    }

    #[test]
    fn test_state_dict_reload_reproduces_embeddings() -> Result<()> {
        let mut trained = net(LossModule::Arcface, true)?;
        // one training pass moves the running statistics away from the defaults
        trained.forward(&images(), Some(&[0, 1]))?;
        trained.eval();
        let expected = trained.extract_feat(&images())?;

        let stem = ConvStem::new(3, &[4, 6], &mut StdRng::seed_from_u64(99))?;
        let mut cfg = config(LossModule::Arcface, true);
        cfg.n_classes = 7;
        let mut fresh = MiewIdNet::new(Box::new(stem), &cfg)?;
        fresh.load_checkpoint(&trained.checkpoint()?)?;
        fresh.eval();
        assert_eq!(fresh.n_classes(), 3);
        let got = fresh.extract_feat(&images())?;
        assert!((got - expected).iter().all(|d| d.abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn test_missing_parameter_is_an_error() -> Result<()> {
        let with_fc = net(LossModule::Arcface, true)?;
        let mut sd = with_fc.state_dict();
        sd.remove("bn2.running_var");
        let mut other = net(LossModule::Arcface, true)?;
        assert!(other.load_state_dict(&sd).is_err());
        Ok(())
    }

    #[test]
    fn test_failed_load_leaves_weights_untouched() -> Result<()> {
        let donor = {
            let stem = ConvStem::new(3, &[4, 6], &mut StdRng::seed_from_u64(7))?;
            let mut cfg = config(LossModule::Arcface, true);
            cfg.seed = 7;
            MiewIdNet::new(Box::new(stem), &cfg)?
        };
        let mut sd = donor.state_dict();
        sd.remove("final.weight");

        let mut model = net(LossModule::Arcface, true)?;
        model.eval();
        let before = model.extract_feat(&images())?;
        let tag = model.fingerprint()?;
        let err = model.load_state_dict(&sd).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::MissingParameter(name)) if name == "final.weight"
        ));
        assert_eq!(model.fingerprint()?, tag);
        assert_eq!(model.extract_feat(&images())?, before);

        let mut sd = donor.state_dict();
        sd.insert("pooling.p".into(), ndarray::ArrayD::from_elem(ndarray::IxDyn(&[1]), -1.0));
        assert!(model.load_state_dict(&sd).is_err());
        assert_eq!(model.fingerprint()?, tag);
        Ok(())
    }

    #[test]
    fn test_fingerprint_tracks_weights() -> Result<()> {
        let a = net(LossModule::Arcface, true)?;
        let b = net(LossModule::Arcface, true)?;
        assert_eq!(a.fingerprint()?, b.fingerprint()?);

        let stem = ConvStem::new(3, &[4, 6], &mut StdRng::seed_from_u64(1))?;
        let mut cfg = config(LossModule::Arcface, true);
        cfg.seed = 43;
        let reseeded = MiewIdNet::new(Box::new(stem), &cfg)?;
        assert_ne!(a.fingerprint()?, reseeded.fingerprint()?);
        Ok(())
    }
}
