use anyhow::{Context, Result};
use log::{info, warn};
use miewid_vision::{LossModule, LrSchedule, MarginParams, NetConfig, Preprocess};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("MIEWID_CONFIG_PATH").unwrap_or("/usr/local/etc/miewid/config.toml"))
});

/// Name of the native convolutional backbone; any other name refers to an
/// ONNX export given by `backbone_path`.
pub const CONV_STEM: &str = "conv_stem";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub exp_name: String,
    pub project_name: String,
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub comment: String,
    /// Weights used for inference.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    pub data: Data,
    pub engine: Engine,
    pub scheduler_params: LrSchedule,
    pub model_params: ModelParams,
    #[serde(default)]
    pub test: TestParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub images_dir: PathBuf,
    pub train_anno_path: PathBuf,
    pub val_anno_path: PathBuf,
    /// (height, width)
    pub image_size: [u32; 2],
    #[serde(default)]
    pub viewpoint_list: Option<Vec<String>>,
    #[serde(default)]
    pub train_n_filter_min: Option<usize>,
    #[serde(default = "default_val_n_filter_min")]
    pub val_n_filter_min: Option<usize>,
    #[serde(default)]
    pub train_n_subsample_max: Option<usize>,
    #[serde(default)]
    pub val_n_subsample_max: Option<usize>,
    #[serde(default = "default_name_keys")]
    pub name_keys: Vec<String>,
}

fn default_val_n_filter_min() -> Option<usize> {
    Some(2)
}

fn default_name_keys() -> Vec<String> {
    vec!["name".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub train_batch_size: usize,
    pub valid_batch_size: usize,
    pub epochs: u32,
    pub seed: u64,
    pub device: String,
    pub loss_module: LossModule,
    #[serde(default)]
    pub num_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model_name: String,
    #[serde(default)]
    pub backbone_path: Option<PathBuf>,
    /// Channel width of the backbone's final feature map.
    pub backbone_features: usize,
    #[serde(default)]
    pub stem_channels: Vec<usize>,
    pub use_fc: bool,
    pub fc_dim: usize,
    pub dropout: f32,
    pub loss_module: LossModule,
    pub s: f32,
    pub margin: f32,
    pub ls_eps: f32,
    /// Initial angle of adaptive-scale heads; carried for checkpoint
    /// compatibility.
    pub theta_zero: f32,
    pub n_classes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    #[serde(default = "default_test_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub fliplr: bool,
    #[serde(default)]
    pub fliplr_view: Vec<String>,
    #[serde(default)]
    pub multithread: bool,
}

fn default_test_batch_size() -> usize {
    4
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            batch_size: default_test_batch_size(),
            fliplr: false,
            fliplr_view: vec![],
            multithread: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exp_name: "miewid".to_string(),
            project_name: "reid".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            comment: String::new(),
            checkpoint_path: None,
            data: Data {
                images_dir: PathBuf::from("images"),
                train_anno_path: PathBuf::from("annotations/instances_train.json"),
                val_anno_path: PathBuf::from("annotations/instances_val.json"),
                image_size: [440, 440],
                viewpoint_list: None,
                train_n_filter_min: None,
                val_n_filter_min: default_val_n_filter_min(),
                train_n_subsample_max: None,
                val_n_subsample_max: None,
                name_keys: default_name_keys(),
            },
            engine: Engine {
                train_batch_size: 32,
                valid_batch_size: 32,
                epochs: 30,
                seed: 0,
                device: "cpu".to_string(),
                loss_module: LossModule::Arcface,
                num_workers: 0,
            },
            scheduler_params: LrSchedule::default(),
            model_params: ModelParams {
                model_name: CONV_STEM.to_string(),
                backbone_path: None,
                backbone_features: 64,
                stem_channels: vec![16, 32, 64],
                use_fc: false,
                fc_dim: 512,
                dropout: 0.0,
                loss_module: LossModule::Arcface,
                s: 30.0,
                margin: 0.5,
                ls_eps: 0.0,
                theta_zero: 0.785,
                n_classes: 1000,
            },
            test: TestParams::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let [h, w] = self.data.image_size;
        if h == 0 || w == 0 {
            anyhow::bail!("data.image_size must be positive, got {h}x{w}");
        }
        if self.engine.train_batch_size == 0
            || self.engine.valid_batch_size == 0
            || self.test.batch_size == 0
        {
            anyhow::bail!("batch sizes must be positive");
        }
        self.model_params.validate()?;
        if self.engine.loss_module != self.model_params.loss_module {
            warn!(
                "engine.loss_module ({}) differs from model_params.loss_module ({}); the model uses the latter",
                self.engine.loss_module.as_str(),
                self.model_params.loss_module.as_str()
            );
        }
        Ok(())
    }

    pub fn preprocess(&self) -> Preprocess {
        let [h, w] = self.data.image_size;
        Preprocess {
            image_size: (h, w),
            fliplr: self.test.fliplr,
            fliplr_view: self.test.fliplr_view.clone(),
        }
    }

    /// Directory the training run writes checkpoints to.
    pub fn run_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .join(&self.project_name)
            .join(&self.exp_name)
            .join(format!(
                "{}-{}-{}",
                self.model_params.model_name,
                self.data.image_size[0],
                self.engine.loss_module.as_str()
            ))
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_classes == 0 {
            anyhow::bail!("model_params.n_classes must be positive");
        }
        if !(self.s > 0.0) {
            anyhow::bail!("model_params.s must be positive, got {}", self.s);
        }
        if !(0.0..std::f32::consts::PI).contains(&self.margin) {
            anyhow::bail!("model_params.margin must be in [0, pi), got {}", self.margin);
        }
        if !(0.0..1.0).contains(&self.ls_eps) {
            anyhow::bail!("model_params.ls_eps must be in [0, 1), got {}", self.ls_eps);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("model_params.dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.use_fc && self.fc_dim == 0 {
            anyhow::bail!("model_params.fc_dim must be positive when use_fc is set");
        }
        if self.model_name == CONV_STEM {
            if self.stem_channels.last() != Some(&self.backbone_features) {
                anyhow::bail!(
                    "conv_stem channels {:?} must end with backbone_features {}",
                    self.stem_channels,
                    self.backbone_features
                );
            }
        } else if self.backbone_path.is_none() {
            anyhow::bail!("backbone {} needs model_params.backbone_path", self.model_name);
        }
        Ok(())
    }

    /// Overrides `n_classes` with the class count actually observed in the
    /// training annotations.
    pub fn reconcile_classes(&mut self, observed: usize) {
        if observed != self.n_classes {
            warn!(
                "overriding n_classes in config ({}) with the observed training class count ({observed}); update the config so the checkpoint loads with the right head",
                self.n_classes
            );
            self.n_classes = observed;
        }
    }

    pub fn net_config(&self, seed: u64) -> NetConfig {
        NetConfig {
            n_classes: self.n_classes,
            use_fc: self.use_fc,
            fc_dim: self.fc_dim,
            dropout: self.dropout,
            loss_module: self.loss_module,
            margin: MarginParams {
                s: self.s,
                margin: self.margin,
                ls_eps: self.ls_eps,
                ..MarginParams::default()
            },
            seed,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    info!("loading config from {}", path.display());
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
