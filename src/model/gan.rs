use super::{
    measure::{psnr, ssim},
    networks::{PatchDiscriminator, PixelWarpNet, UnetGenerator},
    GeneratedImage, Mode, PoseTransferModel, VisualSet,
};
use crate::{
    checkpoint::{CheckpointStore, CheckpointTag},
    common::*,
    config::{GanType, ModelConfig, TrainConfig},
    convert::tensor_to_array4,
    data::PoseBatch,
    loss_buffer::LossRecord,
    schedule::LrScheduler,
    visualizer::array_to_image,
};

#[derive(Derivative)]
#[derivative(Debug)]
struct SubNetwork<N> {
    name: &'static str,
    #[derivative(Debug = "ignore")]
    vs: VarStore,
    net: N,
    #[derivative(Debug = "ignore")]
    optimizer: Option<nn::Optimizer>,
    scheduler: Option<LrScheduler>,
}

impl<N> SubNetwork<N> {
    fn new<F>(name: &'static str, device: Device, build: F) -> Fallible<Self>
    where
        F: FnOnce(nn::Path) -> Fallible<N>,
    {
        let vs = VarStore::new(device);
        let net = build(vs.root())?;
        Ok(Self {
            name,
            vs,
            net,
            optimizer: None,
            scheduler: None,
        })
    }

    fn with_optimizer(
        mut self,
        lr: f64,
        weight_decay: f64,
        train: &TrainConfig,
    ) -> Fallible<Self> {
        let optimizer = nn::Adam {
            beta1: train.beta1,
            beta2: train.beta2,
            wd: weight_decay,
            ..Default::default()
        }
        .build(&self.vs, lr)?;
        self.optimizer = Some(optimizer);
        self.scheduler = Some(LrScheduler::from_config(lr, train));
        Ok(self)
    }

    fn optimizer(&mut self) -> Fallible<&mut nn::Optimizer> {
        let name = self.name;
        self.optimizer
            .as_mut()
            .ok_or_else(|| format_err!("net_{} was created without an optimizer", name))
    }

    fn step_schedule(&mut self, epochs: Option<usize>) {
        if let (Some(scheduler), Some(optimizer)) = (&mut self.scheduler, &mut self.optimizer) {
            let lr = match epochs {
                Some(epochs) => {
                    scheduler.resume(epochs);
                    scheduler.lr()
                }
                None => scheduler.step(),
            };
            optimizer.set_lr(lr);
        }
    }

    fn save(&self, store: &CheckpointStore, tag: CheckpointTag) -> Fallible<()> {
        let path = store.network_path(tag, self.name);
        self.vs
            .save(&path)
            .with_context(|| format!("cannot save {}", path.display()))?;
        Ok(())
    }

    fn load(&mut self, store: &CheckpointStore, tag: CheckpointTag) -> Fallible<()> {
        let path = store.network_path(tag, self.name);
        self.vs
            .load(&path)
            .with_context(|| format!("cannot load {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug)]
struct Output {
    img_out: Tensor,
    img_out_g: Tensor,
    mask: Option<Tensor>,
}

/// Pose transfer GAN: a U-Net generator conditioned on the source image and the
/// target pose, a PatchGAN discriminator and an optional pixel-warp blender.
#[derive(Debug)]
pub struct GanPoseModel {
    config: ModelConfig,
    device: Device,
    store: CheckpointStore,
    mode: Mode,
    use_gan: bool,
    net_g: SubNetwork<UnetGenerator>,
    net_d: Option<SubNetwork<PatchDiscriminator>>,
    net_pw: Option<SubNetwork<PixelWarpNet>>,
    input: Option<PoseBatch>,
    output: Option<Output>,
    errors: LossRecord,
}

impl GanPoseModel {
    /// Builds the networks. Optimizers and the discriminator are created only when
    /// `train` is given.
    pub fn new(
        config: &ModelConfig,
        train: Option<&TrainConfig>,
        joint_nc: usize,
        store: CheckpointStore,
        device: Device,
    ) -> Fallible<Self> {
        let joint_nc = joint_nc as i64;
        let ModelConfig {
            g_nf,
            g_max_nf,
            g_n_scale,
            g_norm,
            g_activation,
            g_pix_warp,
            d_nf,
            d_n_layers,
            ..
        } = *config;

        let mut net_g = SubNetwork::new("G", device, |path| {
            UnetGenerator::new(
                path,
                3 + joint_nc,
                3,
                g_nf,
                g_max_nf,
                g_n_scale,
                g_norm,
                g_activation,
            )
        })?;
        let mut net_pw = if g_pix_warp {
            Some(SubNetwork::new("PW", device, |path| {
                Ok(PixelWarpNet::new(path, 6 + joint_nc, g_nf))
            })?)
        } else {
            None
        };

        let net_d = match train {
            Some(train) => {
                net_g = net_g.with_optimizer(train.lr, train.weight_decay, train)?;
                net_pw = net_pw
                    .map(|pw| pw.with_optimizer(train.lr, train.weight_decay, train))
                    .transpose()?;
                let net_d = SubNetwork::new("D", device, |path| {
                    Ok(PatchDiscriminator::new(path, 6 + joint_nc, d_nf, d_n_layers))
                })?
                .with_optimizer(train.lr_d, train.weight_decay_d, train)?;
                Some(net_d)
            }
            None => None,
        };

        info!(
            "model [GanPoseModel] was created (pixel warp: {}, discriminator: {})",
            g_pix_warp,
            net_d.is_some()
        );

        Ok(Self {
            config: config.clone(),
            device,
            store,
            mode: if train.is_some() { Mode::Train } else { Mode::Eval },
            use_gan: false,
            net_g,
            net_d,
            net_pw,
            input: None,
            output: None,
            errors: LossRecord::new(),
        })
    }

    fn input(&self) -> Fallible<&PoseBatch> {
        self.input
            .as_ref()
            .ok_or_else(|| format_err!("set_input() must be called first"))
    }

    fn forward(&self, batch: &PoseBatch) -> Output {
        let train = self.mode == Mode::Train;
        let input_g = Tensor::cat(&[&batch.img_1, &batch.joint_2], 1);
        let img_out_g = self.net_g.net.forward_t(&input_g, train);

        match &self.net_pw {
            Some(pw) => {
                let generated = if self.config.g_pix_warp_detach {
                    img_out_g.detach()
                } else {
                    img_out_g.shallow_clone()
                };
                let input_pw = Tensor::cat(&[&generated, &batch.img_1, &batch.joint_2], 1);
                let mask = pw.net.forward(&input_pw);
                let img_out = &generated * &mask + &batch.img_1 * (-&mask + 1.0);
                Output {
                    img_out,
                    img_out_g,
                    mask: Some(mask),
                }
            }
            None => Output {
                img_out: img_out_g.shallow_clone(),
                img_out_g,
                mask: None,
            },
        }
    }

    fn discriminate(&self, batch: &PoseBatch, img: &Tensor) -> Fallible<Tensor> {
        let net_d = self
            .net_d
            .as_ref()
            .ok_or_else(|| format_err!("the discriminator exists only in training"))?;
        let input_d = Tensor::cat(&[&batch.img_1, img, &batch.joint_2], 1);
        Ok(net_d.net.forward_t(&input_d, self.mode == Mode::Train))
    }

    fn record(&mut self, name: &str, value: &Tensor) {
        self.errors.insert(name.to_owned(), value.double_value(&[]));
    }
}

fn gan_loss(gan_type: GanType, logits: &Tensor, target_real: bool) -> Tensor {
    let target = if target_real {
        logits.ones_like()
    } else {
        logits.zeros_like()
    };
    match gan_type {
        GanType::Dcgan => logits.binary_cross_entropy_with_logits::<Tensor>(
            &target,
            None,
            None,
            Reduction::Mean,
        ),
        GanType::Lsgan => logits.mse_loss(&target, Reduction::Mean),
    }
}

fn grad_norm(loss: &Tensor, wrt: &Tensor) -> f64 {
    Tensor::run_backward(&[loss], &[wrt], true, false)
        .into_iter()
        .map(|grad| grad.square().sum(Kind::Float).double_value(&[]))
        .sum::<f64>()
        .sqrt()
}

/// Maps `[-1, 1]` images to `[0, 255]` arrays.
fn to_pixel_range(tensor: &Tensor) -> Fallible<Array4<f32>> {
    Ok(tensor_to_array4(tensor)?.mapv(|v| ((v + 1.0) * 127.5).clamp(0.0, 255.0)))
}

impl PoseTransferModel for GanPoseModel {
    type Batch = PoseBatch;
    type Visuals = VisualSet;

    fn set_input(&mut self, batch: PoseBatch) -> Fallible<()> {
        batch.validate()?;
        self.input = Some(batch.to_device(self.device));
        self.output = None;
        Ok(())
    }

    fn optimize_parameters(&mut self, check_grad: bool) -> Fallible<()> {
        let gan_type = self.config.gan_type;
        self.errors.clear();
        let batch = self.input()?;
        let output = self.forward(batch);

        // discriminator
        let loss_d = if self.use_gan {
            let real = self.discriminate(batch, &batch.img_2)?;
            let fake = self.discriminate(batch, &output.img_out.detach())?;
            (gan_loss(gan_type, &real, true) + gan_loss(gan_type, &fake, false)) * 0.5
        } else {
            Tensor::zeros(&[], (Kind::Float, self.device))
        };
        if self.use_gan {
            if let Some(net_d) = &mut self.net_d {
                net_d.optimizer()?.backward_step(&loss_d);
            }
        }

        // generator
        let batch = self.input()?;
        let loss_l1 = output.img_out.l1_loss(&batch.img_2, Reduction::Mean);
        let loss_l1_g = output
            .mask
            .as_ref()
            .map(|_| output.img_out_g.l1_loss(&batch.img_2, Reduction::Mean));
        let loss_gan = if self.use_gan {
            let fake = self.discriminate(batch, &output.img_out)?;
            gan_loss(gan_type, &fake, true)
        } else {
            Tensor::zeros(&[], (Kind::Float, self.device))
        };

        let grads = if check_grad {
            let grad_l1 = grad_norm(&loss_l1, &output.img_out);
            let grad_gan = if self.use_gan {
                grad_norm(&loss_gan, &output.img_out)
            } else {
                0.0
            };
            Some((grad_l1, grad_gan))
        } else {
            None
        };

        let weight_gan = if self.use_gan {
            self.config.loss_weight_gan
        } else {
            0.0
        };
        let mut loss_g = &loss_l1 * self.config.loss_weight_l1 + &loss_gan * weight_gan;
        if let Some(loss) = &loss_l1_g {
            loss_g = loss_g + loss * self.config.loss_weight_l1;
        }

        self.net_g.optimizer()?.zero_grad();
        if let Some(pw) = &mut self.net_pw {
            pw.optimizer()?.zero_grad();
        }
        loss_g.backward();
        self.net_g.optimizer()?.step();
        if let Some(pw) = &mut self.net_pw {
            pw.optimizer()?.step();
        }

        self.record("loss_L1", &loss_l1);
        if let Some(loss) = &loss_l1_g {
            self.record("loss_L1_G", loss);
        }
        self.record("loss_G_GAN", &loss_gan);
        self.record("loss_D", &loss_d);
        if let Some((grad_l1, grad_gan)) = grads {
            self.errors.insert("grad_G_L1".into(), grad_l1);
            self.errors.insert("grad_G_GAN".into(), grad_gan);
        }
        self.output = Some(output);
        Ok(())
    }

    fn test(&mut self, compute_loss: bool) -> Fallible<()> {
        self.errors.clear();
        let batch = self.input()?;
        let output = tch::no_grad(|| self.forward(batch));

        if compute_loss {
            let loss_l1 = output
                .img_out
                .l1_loss(&batch.img_2, Reduction::Mean)
                .double_value(&[]);
            let generated = to_pixel_range(&output.img_out)?;
            let target = to_pixel_range(&batch.img_2)?;
            let n_samples = generated.shape()[0].max(1) as f64;

            let (psnr_sum, ssim_sum) = generated
                .outer_iter()
                .zip(target.outer_iter())
                .fold((0.0, 0.0), |(p, s), (lhs, rhs)| {
                    (p + psnr(lhs, rhs), s + ssim(lhs, rhs))
                });

            self.errors.insert("loss_L1".into(), loss_l1);
            self.errors.insert("PSNR".into(), psnr_sum / n_samples);
            self.errors.insert("SSIM".into(), ssim_sum / n_samples);
        }

        self.output = Some(output);
        Ok(())
    }

    fn current_errors(&self) -> LossRecord {
        self.errors.clone()
    }

    fn current_visuals(&self) -> Fallible<VisualSet> {
        let batch = self.input()?;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| format_err!("no output, call test() or optimize_parameters() first"))?;
        let pose = |joints: &Tensor| joints.max_dim(1, true).0 * 2.0 - 1.0;

        let mut visuals = vec![
            ("img_1".to_string(), batch.img_1.shallow_clone()),
            ("joint_1".to_string(), pose(&batch.joint_1)),
            ("joint_2".to_string(), pose(&batch.joint_2)),
            ("img_2".to_string(), batch.img_2.shallow_clone()),
            ("img_out".to_string(), output.img_out.detach()),
        ];
        if let Some(mask) = &output.mask {
            visuals.push(("img_out_G".to_string(), output.img_out_g.detach()));
            visuals.push(("mask".to_string(), mask.detach() * 2.0 - 1.0));
        }
        Ok(VisualSet(visuals))
    }

    fn generated_images(&self) -> Fallible<Vec<GeneratedImage>> {
        let batch = self.input()?;
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| format_err!("no output, call test() first"))?;
        let images = tensor_to_array4(&output.img_out)?;

        let generated = batch
            .ids
            .iter()
            .zip(images.outer_iter())
            .map(|((id_1, id_2), image)| GeneratedImage {
                name: format!("{}__{}", id_1, id_2),
                image: array_to_image(image),
            })
            .collect();
        Ok(generated)
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn set_use_gan(&mut self, use_gan: bool) {
        self.use_gan = use_gan && self.net_d.is_some();
    }

    fn update_learning_rate(&mut self) {
        self.net_g.step_schedule(None);
        if let Some(net_d) = &mut self.net_d {
            net_d.step_schedule(None);
        }
        if let Some(pw) = &mut self.net_pw {
            pw.step_schedule(None);
        }
    }

    fn learning_rate(&self) -> f64 {
        self.net_g
            .scheduler
            .as_ref()
            .map(|scheduler| scheduler.lr())
            .unwrap_or(0.0)
    }

    fn advance_schedule(&mut self, epochs: usize) {
        self.net_g.step_schedule(Some(epochs));
        if let Some(net_d) = &mut self.net_d {
            net_d.step_schedule(Some(epochs));
        }
        if let Some(pw) = &mut self.net_pw {
            pw.step_schedule(Some(epochs));
        }
    }

    fn save(&self, tag: CheckpointTag) -> Fallible<()> {
        self.net_g.save(&self.store, tag)?;
        if let Some(net_d) = &self.net_d {
            net_d.save(&self.store, tag)?;
        }
        if let Some(pw) = &self.net_pw {
            pw.save(&self.store, tag)?;
        }
        Ok(())
    }

    /// Loads the generator and pixel-warp weights, plus the discriminator when training.
    fn load(&mut self, tag: CheckpointTag) -> Fallible<()> {
        let store = self.store.clone();
        self.net_g.load(&store, tag)?;
        if let Some(net_d) = &mut self.net_d {
            net_d.load(&store, tag)?;
        }
        if let Some(pw) = &mut self.net_pw {
            pw.load(&store, tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormKind;

    fn small_config(pix_warp: bool) -> ModelConfig {
        ModelConfig {
            g_nf: 4,
            g_max_nf: 8,
            g_n_scale: 2,
            g_norm: NormKind::Instance,
            g_pix_warp: pix_warp,
            d_nf: 4,
            d_n_layers: 1,
            ..Default::default()
        }
    }

    fn batch(n: usize) -> PoseBatch {
        let opts = (Kind::Float, Device::Cpu);
        PoseBatch {
            img_1: Tensor::rand(&[n as i64, 3, 8, 8], opts) * 2.0 - 1.0,
            img_2: Tensor::rand(&[n as i64, 3, 8, 8], opts) * 2.0 - 1.0,
            joint_1: Tensor::zeros(&[n as i64, 2, 8, 8], opts),
            joint_2: Tensor::ones(&[n as i64, 2, 8, 8], opts),
            ids: (0..n).map(|i| (format!("a{}", i), format!("b{}", i))).collect(),
        }
    }

    #[test]
    fn train_step_reports_losses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let train = TrainConfig::default();
        let mut model =
            GanPoseModel::new(&small_config(true), Some(&train), 2, store, Device::Cpu).unwrap();

        model.set_use_gan(true);
        model.set_input(batch(2)).unwrap();
        model.optimize_parameters(true).unwrap();

        let errors = model.current_errors();
        for key in ["loss_L1", "loss_L1_G", "loss_G_GAN", "loss_D", "grad_G_L1", "grad_G_GAN"] {
            assert!(errors[key].is_finite(), "{} is not finite", key);
        }
        assert!(errors["loss_D"] > 0.0);

        let visuals = model.current_visuals().unwrap();
        assert_eq!(
            visuals.names().collect::<Vec<_>>(),
            ["img_1", "joint_1", "joint_2", "img_2", "img_out", "img_out_G", "mask"]
        );
    }

    #[test]
    fn disabled_gan_skips_the_discriminator() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let train = TrainConfig::default();
        let mut model =
            GanPoseModel::new(&small_config(false), Some(&train), 2, store, Device::Cpu).unwrap();

        model.set_use_gan(false);
        model.set_input(batch(2)).unwrap();
        model.optimize_parameters(false).unwrap();
        let errors = model.current_errors();
        assert_eq!(errors["loss_G_GAN"], 0.0);
        assert_eq!(errors["loss_D"], 0.0);
        assert!(!errors.contains_key("grad_G_L1"));
    }

    #[test]
    fn test_pass_measures_and_names_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let mut model =
            GanPoseModel::new(&small_config(false), None, 2, store, Device::Cpu).unwrap();

        model.set_input(batch(3)).unwrap();
        model.test(true).unwrap();
        let errors = model.current_errors();
        assert_eq!(
            errors.keys().map(String::as_str).collect::<Vec<_>>(),
            ["PSNR", "SSIM", "loss_L1"]
        );

        let images = model.generated_images().unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(images[1].name, "a1__b1");
        assert_eq!(images[1].image.dimensions(), (8, 8));
    }

    #[test]
    fn checkpoints_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let train = TrainConfig::default();
        let model = GanPoseModel::new(&small_config(false), Some(&train), 2, store.clone(), Device::Cpu)
            .unwrap();
        model.save(CheckpointTag::Best).unwrap();
        assert!(store.network_path(CheckpointTag::Best, "G").is_file());
        assert!(store.network_path(CheckpointTag::Best, "D").is_file());

        let mut restored = GanPoseModel::new(&small_config(false), None, 2, store, Device::Cpu).unwrap();
        restored.load(CheckpointTag::Best).unwrap();
        assert!(restored.load(CheckpointTag::Epoch(9)).is_err());
    }

    #[test]
    fn malformed_batch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let mut model =
            GanPoseModel::new(&small_config(false), None, 2, store, Device::Cpu).unwrap();
        let mut bad = batch(2);
        bad.ids.pop();
        assert!(model.set_input(bad).is_err());
    }

    #[test]
    fn learning_rate_follows_the_schedule() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        let mut train = TrainConfig::default();
        train.lr = 1.0;
        train.lr_decay = 2;
        train.lr_gamma = 0.5;
        let mut model =
            GanPoseModel::new(&small_config(false), Some(&train), 2, store, Device::Cpu).unwrap();
        model.update_learning_rate();
        model.update_learning_rate();
        assert!((model.learning_rate() - 0.5).abs() < 1e-12);
        model.advance_schedule(4);
        assert!((model.learning_rate() - 0.25).abs() < 1e-12);
    }
}
