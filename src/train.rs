//! The epoch loop driving optimization, validation, visualization and checkpoints.

use crate::{
    checkpoint::CheckpointTag,
    common::*,
    config::{BestMetricConfig, Comparison, TrainConfig},
    data::DataSource,
    loss_buffer::{LossBuffer, LossRecord},
    model::{Mode, PoseTransferModel, Visuals},
    visualizer::{LogInfo, Sink},
};

/// Progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    pub current_epoch: usize,
    pub total_steps: usize,
    /// Latched: once enabled it stays enabled for the rest of the run.
    pub adversarial_loss_enabled: bool,
}

impl RunState {
    pub fn new(epoch_count: usize, total_steps: usize) -> Self {
        Self {
            current_epoch: epoch_count,
            total_steps,
            adversarial_loss_enabled: false,
        }
    }

    /// Enters `epoch` and returns whether the adversarial loss is enabled in it.
    pub fn begin_epoch(&mut self, epoch: usize, epoch_add_gan: usize, gan_weight: f64) -> bool {
        self.current_epoch = epoch;
        self.adversarial_loss_enabled =
            self.adversarial_loss_enabled || (gan_weight > 0.0 && epoch >= epoch_add_gan);
        self.adversarial_loss_enabled
    }
}

/// Tracks the best value of the validation metric seen so far.
#[derive(Debug, Clone, PartialEq)]
pub struct BestCheckpoint {
    pub metric: String,
    pub comparison: Comparison,
    best: Option<(usize, f64)>,
}

impl BestCheckpoint {
    pub fn new(config: &BestMetricConfig) -> Self {
        Self {
            metric: config.name.clone(),
            comparison: config.comparison,
            best: None,
        }
    }

    /// Best `(epoch, value)` so far.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.best
    }

    /// Returns true when `value` is the first one or strictly improves on the best.
    pub fn update(&mut self, epoch: usize, value: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some((_, best)) => match self.comparison {
                Comparison::Max => value > best,
                Comparison::Min => value < best,
            },
        };
        if improved {
            self.best = Some((epoch, value));
        }
        improved
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub state: RunState,
    pub best: Option<(usize, f64)>,
}

/// Drives a [PoseTransferModel] over a training and a validation source.
#[derive(Debug)]
pub struct Trainer<M, T, V, S> {
    pub id: String,
    pub config: TrainConfig,
    /// Weight of the adversarial loss; the loss is never enabled when it is zero.
    pub gan_weight: f64,
    pub vis_dir: PathBuf,
    pub model: M,
    pub train_data: T,
    pub val_data: V,
    pub sink: S,
}

impl<M, T, V, S> Trainer<M, T, V, S>
where
    M: PoseTransferModel,
    T: DataSource<Batch = M::Batch>,
    V: DataSource<Batch = M::Batch>,
    S: Sink<M::Visuals>,
{
    pub fn run(&mut self) -> Fallible<TrainSummary> {
        let config = self.config.clone();
        let display_freq = if config.debug { 2 } else { config.display_freq };

        let mut state = match config.resume {
            Some(last_epoch) => {
                info!("resume training from epoch {}", last_epoch);
                self.model.load(CheckpointTag::Latest)?;
                self.model.advance_schedule(last_epoch);
                RunState::new(last_epoch + 1, self.train_data.num_batches() * last_epoch)
            }
            None => RunState::new(1, 0),
        };
        let mut best = BestCheckpoint::new(&config.best_metric);

        let epoch_count = state.current_epoch;
        let last_epoch = config.n_epoch + config.n_epoch_decay;
        let epoch_bar = progress_bar(
            (last_epoch + 1).saturating_sub(epoch_count),
            "epoch",
        );

        for epoch in epoch_count..=last_epoch {
            let use_gan = state.begin_epoch(epoch, config.epoch_add_gan, self.gan_weight);
            self.train_epoch(&mut state, display_freq)?;

            // after the optimizer steps of this epoch, before evaluation
            self.model.update_learning_rate();

            if epoch % config.test_epoch_freq == 0 {
                let errors = self.evaluate_epoch()?;
                let info = LogInfo::new()
                    .with("id", &self.id)
                    .with("epoch", epoch)
                    .with("gan", use_gan);
                info!("{}", self.sink.log(&info, &errors)?);

                let value = *errors.get(&best.metric).ok_or_else(|| {
                    format_err!(
                        "best metric {} is not among the evaluation errors {:?}",
                        best.metric,
                        errors.keys().collect::<Vec<_>>()
                    )
                })?;
                if best.update(epoch, value) {
                    info!("save as best epoch!");
                    self.model.save(CheckpointTag::Best)?;
                }
                if let Some((best_epoch, best_value)) = best.best() {
                    info!(
                        "best {}: {:.6} at epoch {}",
                        best.metric, best_value, best_epoch
                    );
                }
            }

            if epoch % config.vis_epoch_freq == 0 {
                self.visualize_epoch(epoch)?;
            }

            if epoch % config.save_epoch_freq == 0 {
                self.model.save(CheckpointTag::Epoch(epoch))?;
            }
            self.model.save(CheckpointTag::Latest)?;
            epoch_bar.inc(1);
        }
        epoch_bar.finish_and_clear();

        Ok(TrainSummary {
            state,
            best: best.best(),
        })
    }

    fn train_epoch(&mut self, state: &mut RunState, display_freq: usize) -> Fallible<()> {
        let check_grad_freq = self.config.check_grad_freq;
        self.model.set_mode(Mode::Train);
        self.model.set_use_gan(state.adversarial_loss_enabled);

        let bar = progress_bar(self.train_data.num_batches(), "train");
        for batch in self.train_data.batches() {
            let batch = batch?;
            state.total_steps += 1;
            self.model.set_input(batch)?;
            let check_grad = check_grad_freq > 0 && state.total_steps % check_grad_freq == 0;
            self.model.optimize_parameters(check_grad)?;

            if state.total_steps % display_freq == 0 {
                let lr = self.model.learning_rate();
                let mut errors = self.model.current_errors();
                let info = LogInfo::new()
                    .with("id", &self.id)
                    .with("iter", state.total_steps)
                    .with("epoch", state.current_epoch)
                    .with("lr", format!("{:.3e}", lr));
                bar.println(self.sink.log(&info, &errors)?);

                errors.insert("lr".into(), lr);
                self.sink.add_scalars(state.total_steps, &errors)?;
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(())
    }

    fn evaluate_epoch(&mut self) -> Fallible<LossRecord> {
        self.model.set_mode(Mode::Eval);
        let mut buffer = LossBuffer::new();

        let bar = progress_bar(self.val_data.num_batches(), "test");
        for batch in self.val_data.batches() {
            self.model.set_input(batch?)?;
            self.model.test(true)?;
            buffer.add(&self.model.current_errors())?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(buffer.get_errors()?)
    }

    fn visualize_epoch(&mut self, epoch: usize) -> Fallible<()> {
        self.model.set_mode(Mode::Eval);
        let num_vis_batches = self.config.n_vis / self.train_data.batch_size().max(1);

        let train_visuals =
            collect_visuals(&mut self.model, &mut self.train_data, num_vis_batches, true)?;
        let val_visuals =
            collect_visuals(&mut self.model, &mut self.val_data, num_vis_batches, true)?;

        for (split, visuals) in [("train", train_visuals), ("test", val_visuals)] {
            match visuals {
                Some(visuals) => {
                    let path = self.vis_dir.join(format!("{}_epoch{}.jpg", split, epoch));
                    debug!("visualizing {} samples to {}", split, path.display());
                    self.sink.visualize(&visuals, &path)?;
                }
                None => warn!("no {} batch to visualize at epoch {}", split, epoch),
            }
        }
        Ok(())
    }
}

/// Runs inference on the first `num_batches` batches and folds their visuals in order.
pub fn collect_visuals<M, D>(
    model: &mut M,
    data: &mut D,
    num_batches: usize,
    compute_loss: bool,
) -> Fallible<Option<M::Visuals>>
where
    M: PoseTransferModel,
    D: DataSource<Batch = M::Batch>,
{
    data.batches()
        .take(num_batches)
        .try_fold(None, |merged: Option<M::Visuals>, batch| {
            model.set_input(batch?)?;
            model.test(compute_loss)?;
            let visuals = model.current_visuals()?;
            let merged = match merged {
                Some(merged) => merged.concat(visuals)?,
                None => visuals,
            };
            Fallible::Ok(Some(merged))
        })
}
