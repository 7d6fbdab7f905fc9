use crate::{
    common::*,
    config::TestConfig,
    data::DataSource,
    loss_buffer::{LossBuffer, LossRecord},
    model::{Mode, PoseTransferModel},
    train::collect_visuals,
    visualizer::{LogInfo, Sink},
};

/// Inference-only passes over a test split.
#[derive(Debug)]
pub struct Evaluator<M, D> {
    pub id: String,
    pub config: TestConfig,
    pub vis_dir: PathBuf,
    /// Generated images are written here when set.
    pub output_dir: Option<PathBuf>,
    pub model: M,
    pub data: D,
}

impl<M, D> Evaluator<M, D>
where
    M: PoseTransferModel,
    D: DataSource<Batch = M::Batch>,
{
    /// Visualizes the first samples, then tests. Returns the mean errors, or
    /// `None` when testing is disabled.
    pub fn run<S>(&mut self, sink: &mut S) -> Fallible<Option<LossRecord>>
    where
        S: Sink<M::Visuals>,
    {
        self.model.set_mode(Mode::Eval);
        if self.config.n_vis > 0 {
            self.visualize(sink)?;
        }
        if self.config.n_test_batch == 0 {
            return Ok(None);
        }
        let errors = self.test()?;

        let info = LogInfo::new()
            .with("model_id", &self.id)
            .with("epoch", &self.config.which_epoch);
        info!("{}", sink.log(&info, &errors)?);
        Ok(Some(errors))
    }

    fn visualize<S>(&mut self, sink: &mut S) -> Fallible<()>
    where
        S: Sink<M::Visuals>,
    {
        let batch_size = self.data.batch_size();
        let num_vis_batches =
            ((self.config.n_vis + batch_size - 1) / batch_size).min(self.data.num_batches());
        info!("visualizing first {} samples", self.config.n_vis);
        self.data.set_len(num_vis_batches * batch_size);

        match collect_visuals(&mut self.model, &mut self.data, num_vis_batches, false)? {
            Some(visuals) => {
                let path = self
                    .vis_dir
                    .join(format!("test_epoch{}.jpg", self.config.which_epoch));
                sink.visualize(&visuals, &path)?;
            }
            None => warn!("no test batch to visualize"),
        }
        Ok(())
    }

    fn test(&mut self) -> Fallible<LossRecord> {
        let batch_size = self.data.batch_size();
        let num_samples = match self.config.n_test_batch {
            n if n < 0 => usize::MAX,
            n => n as usize * batch_size,
        };
        self.data.set_len(num_samples);
        let num_batches = self.data.num_batches();

        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir)?;
        }

        let mut buffer = LossBuffer::new();
        let mut total_time = Duration::ZERO;
        let bar = progress_bar(num_batches, "test");

        for batch in self.data.batches() {
            let batch = batch?;
            let instant = Instant::now();
            self.model.set_input(batch)?;
            self.model.test(true)?;
            total_time += instant.elapsed();
            buffer.add(&self.model.current_errors())?;

            if let Some(dir) = &self.output_dir {
                for generated in self.model.generated_images()? {
                    let path = dir.join(format!("{}.jpg", generated.name));
                    generated
                        .image
                        .save(&path)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let mut errors = buffer.get_errors()?;
        errors.insert(
            "sec_per_image".into(),
            total_time.as_secs_f64() / (batch_size * num_batches).max(1) as f64,
        );
        Ok(errors)
    }
}
