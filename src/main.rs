use posetrs::{
    checkpoint::{CheckpointStore, CheckpointTag},
    common::*,
    config::{parse_device, Config, DatasetConfig},
    data::{PosePairDataset, Split},
    evaluate::Evaluator,
    metrics::{
        activation::DEFAULT_BATCH_SIZE,
        compute_metrics,
        torch::{TorchFeatureExtractor, TorchPerceptualNet},
        ActivationStatistics, MaskMode, MetricsInputs, PerceptualDistance,
    },
    model::{GanPoseModel, PoseTransferModel},
    train::Trainer,
    visualizer::{ScalarWriter, Visualizer},
};

/// Pose-guided person image synthesis.
#[derive(FromArgs)]
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Train(TrainArgs),
    Test(TestArgs),
    Metrics(MetricsArgs),
}

/// Train a pose transfer model.
#[derive(FromArgs)]
#[argh(subcommand, name = "train")]
struct TrainArgs {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"config.json5\")")]
    config: PathBuf,
}

/// Test a trained pose transfer model.
#[derive(FromArgs)]
#[argh(subcommand, name = "test")]
struct TestArgs {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"config.json5\")")]
    config: PathBuf,
}

/// Compute FID and LPIPS of generated images.
#[derive(FromArgs)]
#[argh(subcommand, name = "metrics")]
struct MetricsArgs {
    /// directory or list file of ground truth images.
    #[argh(option)]
    gt_path: PathBuf,
    /// directory or list file of generated images.
    #[argh(option)]
    generated_path: PathBuf,
    /// real images for the FID reference statistics, defaults to gt-path.
    #[argh(option)]
    fid_real_path: Option<PathBuf>,
    /// segmentation maps for the masked LPIPS.
    #[argh(option)]
    seg_path: Option<PathBuf>,
    /// blanked segmentation label, body or face.
    #[argh(option, default = "MaskMode::Body")]
    mask_mode: MaskMode,
    /// JSON cache of the real image statistics.
    #[argh(option)]
    fid_stats_cache: Option<PathBuf>,
    /// torchScript inception feature extractor.
    #[argh(option)]
    inception_model: PathBuf,
    /// torchScript LPIPS network.
    #[argh(option)]
    lpips_model: PathBuf,
    /// batch size of both networks.
    #[argh(option, default = "DEFAULT_BATCH_SIZE")]
    batch_size: usize,
    /// device name, e.g. cpu or cuda(0).
    #[argh(option, default = "String::from(\"auto\")")]
    device: String,
}

fn main() -> Fallible<()> {
    pretty_env_logger::init();

    let args: Args = argh::from_env();
    match args.command {
        Command::Train(args) => train(args),
        Command::Test(args) => test(args),
        Command::Metrics(args) => metrics(args),
    }
}

fn train(args: TrainArgs) -> Fallible<()> {
    let config = Config::open(&args.config)?;
    tch::manual_seed(config.seed as i64);

    let store = CheckpointStore::new(config.run_dir())?;
    store.save_command_line(std::env::args())?;
    store.save_options("train", &config)?;

    let DatasetConfig::PosePair(dataset_config) = &config.dataset;
    let train_data = PosePairDataset::new(
        dataset_config,
        Split::Train,
        true,
        config.device,
        config.seed,
    )?;
    let val_split = if dataset_config.small_val_set {
        Split::TestSmall
    } else {
        Split::Test
    };
    let val_data =
        PosePairDataset::new(dataset_config, val_split, false, config.device, config.seed)?;

    let model = GanPoseModel::new(
        &config.model,
        Some(&config.train),
        dataset_config.joint_nc,
        store.clone(),
        config.device,
    )?;
    let sink = Visualizer::new(
        Some(store.dir().join("train_log.txt")),
        Some(ScalarWriter::create(config.scalar_dir())?),
    );

    let mut trainer = Trainer {
        id: config.id.clone(),
        config: config.train.clone(),
        gan_weight: config.model.loss_weight_gan,
        vis_dir: store.dir().join("vis"),
        model,
        train_data,
        val_data,
        sink,
    };
    let summary = trainer.run()?;
    match summary.best {
        Some((epoch, value)) => info!(
            "finished; best {} {:.4} at epoch {}",
            config.train.best_metric.name, value, epoch
        ),
        None => info!("finished without validation"),
    }
    Ok(())
}

fn test(args: TestArgs) -> Fallible<()> {
    let config = Config::open(&args.config)?;
    let tag: CheckpointTag = config.test.which_epoch.parse()?;

    let store = CheckpointStore::new(config.run_dir())?;
    store.save_options("test", &config)?;

    let DatasetConfig::PosePair(dataset_config) = &config.dataset;
    let data = PosePairDataset::new(
        dataset_config,
        Split::Test,
        false,
        config.device,
        config.seed,
    )?;
    let mut model = GanPoseModel::new(
        &config.model,
        None,
        dataset_config.joint_nc,
        store.clone(),
        config.device,
    )?;
    model.load(tag)?;

    let output_dir = config
        .test
        .save_output
        .then(|| store.dir().join(&config.test.output_dir));
    let mut sink = Visualizer::new(Some(store.dir().join("test_log.txt")), None);
    let mut evaluator = Evaluator {
        id: config.id.clone(),
        config: config.test.clone(),
        vis_dir: store.dir().join("vis"),
        output_dir,
        model,
        data,
    };
    evaluator.run(&mut sink)?;
    Ok(())
}

fn metrics(args: MetricsArgs) -> Fallible<()> {
    let MetricsArgs {
        gt_path,
        generated_path,
        fid_real_path,
        seg_path,
        mask_mode,
        fid_stats_cache,
        inception_model,
        lpips_model,
        batch_size,
        device,
    } = args;
    let device = parse_device(&device)?;

    let mut statistics =
        ActivationStatistics::new(TorchFeatureExtractor::load(inception_model, device)?, batch_size);
    let mut lpips =
        PerceptualDistance::new(TorchPerceptualNet::load(lpips_model, device)?, batch_size);

    let inputs = MetricsInputs {
        gt_path,
        generated_path,
        fid_real_path,
        seg_path,
        mask_mode,
        fid_stats_cache,
    };
    let report = compute_metrics(&inputs, &mut statistics, &mut lpips)?;
    println!("{}", report);
    Ok(())
}
