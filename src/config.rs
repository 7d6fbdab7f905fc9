use crate::common::*;

const ID_PREFIX: &str = "PoseTransfer_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: String,
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(
        serialize_with = "serialize_device",
        deserialize_with = "deserialize_device",
        default = "default_device"
    )]
    pub device: Device,
    #[serde(default)]
    pub seed: u64,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub test: TestConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_json5(&text)
    }

    pub fn from_json5(text: &str) -> Fallible<Self> {
        let mut config: Self = json5::from_str(text)?;
        if !config.id.starts_with(ID_PREFIX) {
            config.id = format!("{}{}", ID_PREFIX, config.id);
        }
        config.validate()?;
        Ok(config)
    }

    /// Directory holding checkpoints, visualizations and logs of this run.
    pub fn run_dir(&self) -> PathBuf {
        self.checkpoints_dir.join(&self.id)
    }

    /// Directory of the scalar time series of this run.
    pub fn scalar_dir(&self) -> PathBuf {
        self.log_dir.join(&self.id)
    }

    pub fn batch_size(&self) -> usize {
        match &self.dataset {
            DatasetConfig::PosePair(dataset) => dataset.batch_size.get(),
        }
    }

    fn validate(&self) -> Fallible<()> {
        let TrainConfig {
            display_freq,
            test_epoch_freq,
            save_epoch_freq,
            vis_epoch_freq,
            ..
        } = self.train;
        ensure!(display_freq > 0, "display_freq must be positive");
        ensure!(test_epoch_freq > 0, "test_epoch_freq must be positive");
        ensure!(save_epoch_freq > 0, "save_epoch_freq must be positive");
        ensure!(vis_epoch_freq > 0, "vis_epoch_freq must be positive");
        ensure!(
            self.train.lr_decay > 0,
            "lr_decay must be positive for the step policy"
        );
        Ok(())
    }
}

/// Dataset registry. The tag selects the implementation once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DatasetConfig {
    #[serde(rename = "pose_pair")]
    PosePair(PosePairDatasetConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePairDatasetConfig {
    pub data_root: PathBuf,
    pub fn_split: PathBuf,
    pub img_dir: PathBuf,
    pub fn_pose: PathBuf,
    /// Image height and width.
    pub image_size: [usize; 2],
    pub batch_size: NonZeroUsize,
    #[serde(default = "default_joint_nc")]
    pub joint_nc: usize,
    #[serde(default)]
    pub joint_mode: JointMode,
    #[serde(default = "default_joint_radius")]
    pub joint_radius: f32,
    /// Validate on the `test_small` split instead of `test`.
    #[serde(default = "default_true")]
    pub small_val_set: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointMode {
    Binary,
    Gaussian,
}

impl Default for JointMode {
    fn default() -> Self {
        Self::Binary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    None,
    Batch,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GanType {
    Dcgan,
    Lsgan,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ModelConfig {
    #[derivative(Default(value = "32"))]
    pub g_nf: i64,
    #[derivative(Default(value = "128"))]
    pub g_max_nf: i64,
    #[derivative(Default(value = "7"))]
    pub g_n_scale: i64,
    #[derivative(Default(value = "NormKind::Batch"))]
    pub g_norm: NormKind,
    #[derivative(Default(value = "ActivationKind::Relu"))]
    pub g_activation: ActivationKind,
    pub g_pix_warp: bool,
    #[derivative(Default(value = "true"))]
    pub g_pix_warp_detach: bool,
    #[derivative(Default(value = "64"))]
    pub d_nf: i64,
    #[derivative(Default(value = "3"))]
    pub d_n_layers: i64,
    #[derivative(Default(value = "GanType::Dcgan"))]
    pub gan_type: GanType,
    #[derivative(Default(value = "1.0"))]
    pub loss_weight_l1: f64,
    #[derivative(Default(value = "0.01"))]
    pub loss_weight_gan: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    Step,
    Lambda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMetricConfig {
    pub name: String,
    pub comparison: Comparison,
}

impl Default for BestMetricConfig {
    fn default() -> Self {
        Self {
            name: "SSIM".into(),
            comparison: Comparison::Max,
        }
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TrainConfig {
    #[derivative(Default(value = "30"))]
    pub n_epoch: usize,
    pub n_epoch_decay: usize,
    #[derivative(Default(value = "6"))]
    pub epoch_add_gan: usize,
    #[derivative(Default(value = "100"))]
    pub display_freq: usize,
    #[derivative(Default(value = "1"))]
    pub test_epoch_freq: usize,
    #[derivative(Default(value = "1"))]
    pub save_epoch_freq: usize,
    #[derivative(Default(value = "1"))]
    pub vis_epoch_freq: usize,
    /// Gradient norms are checked every this many steps, 0 disables the check.
    #[derivative(Default(value = "100"))]
    pub check_grad_freq: usize,
    #[derivative(Default(value = "64"))]
    pub n_vis: usize,
    /// Resume from the checkpoint written at the end of this epoch.
    pub resume: Option<usize>,
    pub debug: bool,
    #[derivative(Default(value = "2e-4"))]
    pub lr: f64,
    #[derivative(Default(value = "0.5"))]
    pub beta1: f64,
    #[derivative(Default(value = "0.999"))]
    pub beta2: f64,
    pub weight_decay: f64,
    #[derivative(Default(value = "2e-5"))]
    pub lr_d: f64,
    #[derivative(Default(value = "4e-4"))]
    pub weight_decay_d: f64,
    #[derivative(Default(value = "LrPolicy::Step"))]
    pub lr_policy: LrPolicy,
    #[derivative(Default(value = "100"))]
    pub lr_decay: usize,
    #[derivative(Default(value = "0.1"))]
    pub lr_gamma: f64,
    pub best_metric: BestMetricConfig,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TestConfig {
    #[derivative(Default(value = "\"best\".into()"))]
    pub which_epoch: String,
    /// Number of test batches, -1 for the whole split and 0 to skip testing.
    #[derivative(Default(value = "-1"))]
    pub n_test_batch: isize,
    #[derivative(Default(value = "64"))]
    pub n_vis: usize,
    pub save_output: bool,
    #[derivative(Default(value = "\"output\".into()"))]
    pub output_dir: PathBuf,
}

fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_joint_nc() -> usize {
    18
}

fn default_joint_radius() -> f32 {
    8.0
}

fn default_true() -> bool {
    true
}

fn default_device() -> Device {
    Device::cuda_if_available()
}

pub fn serialize_device<S>(device: &Device, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = match device {
        Device::Cpu => "cpu".into(),
        Device::Cuda(n) => format!("cuda({})", n),
    };
    text.serialize(serializer)
}

pub fn deserialize_device<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_device(&name).map_err(|err| D::Error::custom(format!("{:?}", err)))
}

/// Parses `cpu`, `cuda`, `auto` or `cuda(N)`.
pub fn parse_device(name: &str) -> Fallible<Device> {
    let device = match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda(0),
        "auto" => Device::cuda_if_available(),
        _ => {
            let prefix = "cuda(";
            let suffix = ")";
            if name.starts_with(prefix) && name.ends_with(suffix) {
                let number: usize = name[(prefix.len())..(name.len() - suffix.len())]
                    .parse()
                    .map_err(|_err| format_err!("invalid device name {}", name))?;
                Device::Cuda(number)
            } else {
                bail!("invalid device name {}", name);
            }
        }
    };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        id: "personHD_side",
        device: "cpu",
        dataset: {
            pose_pair: {
                data_root: "dataset/cropped_side",
                fn_split: "pairs.json",
                img_dir: "resize256/train",
                fn_pose: "pose_label_256.json",
                image_size: [256, 256],
                batch_size: 8,
            },
        },
        train: {
            n_epoch: 10,
            best_metric: { name: "loss_L1", comparison: "min" },
        },
    }"#;

    #[test]
    fn parse_config_with_defaults() {
        let config = Config::from_json5(EXAMPLE).unwrap();
        assert_eq!(config.id, "PoseTransfer_personHD_side");
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.batch_size(), 8);
        assert_eq!(config.run_dir(), Path::new("checkpoints/PoseTransfer_personHD_side"));

        assert_eq!(config.train.n_epoch, 10);
        assert_eq!(config.train.epoch_add_gan, 6);
        assert_eq!(config.train.lr_policy, LrPolicy::Step);
        assert_eq!(config.train.best_metric.comparison, Comparison::Min);
        assert!((config.model.loss_weight_gan - 0.01).abs() < 1e-12);
        assert_eq!(config.model.g_norm, NormKind::Batch);
        assert_eq!(config.test.which_epoch, "best");
        assert_eq!(config.test.n_test_batch, -1);

        let DatasetConfig::PosePair(dataset) = &config.dataset;
        assert_eq!(dataset.joint_nc, 18);
        assert_eq!(dataset.joint_mode, JointMode::Binary);
        assert!(dataset.small_val_set);
    }

    #[test]
    fn prefixed_id_is_kept() {
        let text = EXAMPLE.replace("personHD_side", "PoseTransfer_x");
        let config = Config::from_json5(&text).unwrap();
        assert_eq!(config.id, "PoseTransfer_x");
    }

    #[test]
    fn zero_frequency_is_rejected() {
        let text = EXAMPLE.replace("n_epoch: 10,", "n_epoch: 10, save_epoch_freq: 0,");
        assert!(Config::from_json5(&text).is_err());
    }

    #[test]
    fn device_names() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("cuda(3)").unwrap(), Device::Cuda(3));
        assert!(parse_device("cuda(x)").is_err());
        assert!(parse_device("tpu").is_err());
    }
}
