use super::{joints::joint_maps, DataSource, PoseBatch};
use crate::{
    common::*,
    config::{JointMode, PosePairDatasetConfig},
    convert::array4_to_tensor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
    TestSmall,
}

impl Split {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
            Self::TestSmall => "test_small",
        }
    }
}

/// Pairs of images of the same person in two poses.
///
/// The split file maps split names to `[source_id, target_id]` pairs and the pose
/// file maps sample ids to joint coordinates in pixels of the configured image size.
#[derive(Debug)]
pub struct PosePairDataset {
    pairs: Vec<(String, String)>,
    poses: HashMap<String, Vec<[f32; 2]>>,
    img_dir: PathBuf,
    height: usize,
    width: usize,
    joint_nc: usize,
    joint_mode: JointMode,
    joint_radius: f32,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    len: usize,
    device: Device,
    rng: StdRng,
}

impl PosePairDataset {
    /// Training passes over the train split are shuffled; every pass drops the
    /// trailing incomplete batch when `is_train` is set.
    pub fn new(
        config: &PosePairDatasetConfig,
        split: Split,
        is_train: bool,
        device: Device,
        seed: u64,
    ) -> Fallible<Self> {
        let PosePairDatasetConfig {
            data_root,
            fn_split,
            img_dir,
            fn_pose,
            image_size: [height, width],
            batch_size,
            joint_nc,
            joint_mode,
            joint_radius,
            ..
        } = config;

        let split_path = data_root.join(fn_split);
        let mut splits: HashMap<String, Vec<(String, String)>> = read_json(&split_path)?;
        let pairs = splits.remove(split.key()).ok_or_else(|| {
            format_err!(
                "split {} does not exist in {}",
                split.key(),
                split_path.display()
            )
        })?;
        let poses: HashMap<String, Vec<[f32; 2]>> = read_json(&data_root.join(fn_pose))?;

        info!(
            "dataset [{}] was created (size: {})",
            split.key(),
            pairs.len()
        );

        Ok(Self {
            len: pairs.len(),
            pairs,
            poses,
            img_dir: data_root.join(img_dir),
            height: *height,
            width: *width,
            joint_nc: *joint_nc,
            joint_mode: *joint_mode,
            joint_radius: *joint_radius,
            batch_size: batch_size.get(),
            shuffle: split == Split::Train && is_train,
            drop_last: is_train,
            device,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Number of samples a pass draws from.
    pub fn len(&self) -> usize {
        self.len.min(self.pairs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_image(&self, id: &str) -> Fallible<Array3<f32>> {
        let path = ["jpg", "png"]
            .iter()
            .map(|ext| self.img_dir.join(format!("{}.{}", id, ext)))
            .find(|path| path.is_file())
            .ok_or_else(|| format_err!("image of {} not found in {}", id, self.img_dir.display()))?;

        let image = image::open(&path)
            .with_context(|| format!("cannot decode {}", path.display()))?;
        let (width, height) = (self.width as u32, self.height as u32);
        let image = if image.dimensions() == (width, height) {
            image.to_rgb8()
        } else {
            image.resize_exact(width, height, FilterType::Triangle).to_rgb8()
        };

        let array = Array3::from_shape_fn((3, self.height, self.width), |(c, y, x)| {
            image.get_pixel(x as u32, y as u32)[c] as f32 / 127.5 - 1.0
        });
        Ok(array)
    }

    fn load_joints(&self, id: &str) -> Fallible<Array3<f32>> {
        let joints = self
            .poses
            .get(id)
            .ok_or_else(|| format_err!("pose of {} is missing", id))?;
        Ok(joint_maps(
            joints,
            self.joint_nc,
            self.height,
            self.width,
            self.joint_mode,
            self.joint_radius,
        ))
    }

    fn load_batch(&self, indexes: &[usize]) -> Fallible<PoseBatch> {
        let ids: Vec<(String, String)> = indexes.iter().map(|&i| self.pairs[i].clone()).collect();

        let samples = ids
            .par_iter()
            .map(|(id_1, id_2)| {
                Ok((
                    self.load_image(id_1)?,
                    self.load_image(id_2)?,
                    self.load_joints(id_1)?,
                    self.load_joints(id_2)?,
                ))
            })
            .collect::<Fallible<Vec<_>>>()?;

        let stack = |select: fn(&(Array3<f32>, Array3<f32>, Array3<f32>, Array3<f32>)) -> &Array3<f32>| {
            let views: Vec<_> = samples.iter().map(|s| select(s).view()).collect();
            let array = ndarray::stack(Axis(0), &views)?;
            Fallible::Ok(array4_to_tensor(array.view(), self.device))
        };

        Ok(PoseBatch {
            img_1: stack(|s| &s.0)?,
            img_2: stack(|s| &s.1)?,
            joint_1: stack(|s| &s.2)?,
            joint_2: stack(|s| &s.3)?,
            ids,
        })
    }
}

impl DataSource for PosePairDataset {
    type Batch = PoseBatch;

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_batches(&self) -> usize {
        let len = self.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            (len + self.batch_size - 1) / self.batch_size
        }
    }

    fn set_len(&mut self, num_samples: usize) {
        self.len = num_samples;
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Fallible<PoseBatch>> + '_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;
        let chunks: Vec<Vec<usize>> = order
            .chunks(batch_size)
            .filter(|chunk| !drop_last || chunk.len() == batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let this = &*self;
        Box::new(chunks.into_iter().map(move |chunk| this.load_batch(&chunk)))
    }
}

fn read_json<T>(path: &Path) -> Fallible<T>
where
    T: serde::de::DeserializeOwned,
{
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    let value = serde_json::from_reader(reader)
        .with_context(|| format!("cannot parse {}", path.display()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_dataset(root: &Path, n_pairs: usize) -> PosePairDatasetConfig {
        fs::create_dir_all(root.join("img")).unwrap();
        let ids: Vec<String> = (0..=n_pairs).map(|i| format!("{}_view", i)).collect();
        for (i, id) in ids.iter().enumerate() {
            RgbImage::from_pixel(8, 8, Rgb([i as u8 * 10, 0, 255]))
                .save(root.join("img").join(format!("{}.png", id)))
                .unwrap();
        }
        let pairs: Vec<_> = (0..n_pairs).map(|i| [ids[i].clone(), ids[i + 1].clone()]).collect();
        let test_pairs = pairs[..2].to_vec();
        fs::write(
            root.join("split.json"),
            json!({ "train": pairs, "test": test_pairs }).to_string(),
        )
        .unwrap();
        let poses: HashMap<_, _> = ids.iter().map(|id| (id.clone(), vec![[2.0, 3.0], [-1.0, -1.0]])).collect();
        fs::write(root.join("pose.json"), serde_json::to_string(&poses).unwrap()).unwrap();

        PosePairDatasetConfig {
            data_root: root.to_owned(),
            fn_split: "split.json".into(),
            img_dir: "img".into(),
            fn_pose: "pose.json".into(),
            image_size: [8, 8],
            batch_size: NonZeroUsize::new(2).unwrap(),
            joint_nc: 2,
            joint_mode: JointMode::Binary,
            joint_radius: 1.0,
            small_val_set: false,
        }
    }

    #[test]
    fn train_pass_drops_incomplete_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let config = write_dataset(tmp.path(), 5);
        let mut dataset = PosePairDataset::new(&config, Split::Train, true, Device::Cpu, 0).unwrap();
        assert_eq!(dataset.num_batches(), 2);

        let batches: Vec<_> = dataset.batches().collect::<Fallible<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            batch.validate().unwrap();
            assert_eq!(batch.img_1.size(), vec![2, 3, 8, 8]);
            assert_eq!(batch.joint_2.size(), vec![2, 2, 8, 8]);
        }
    }

    #[test]
    fn test_pass_keeps_order_and_respects_len() {
        let tmp = tempfile::tempdir().unwrap();
        let config = write_dataset(tmp.path(), 5);
        let mut dataset = PosePairDataset::new(&config, Split::Train, false, Device::Cpu, 0).unwrap();
        assert_eq!(dataset.num_batches(), 3);

        dataset.set_len(3);
        assert_eq!(dataset.num_batches(), 2);
        let ids: Vec<_> = dataset
            .batches()
            .map(|batch| batch.unwrap().ids)
            .concat();
        assert_eq!(
            ids.iter().map(|(a, _)| a.as_str()).collect::<Vec<_>>(),
            ["0_view", "1_view", "2_view"]
        );
    }

    #[test]
    fn missing_split_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = write_dataset(tmp.path(), 3);
        assert!(PosePairDataset::new(&config, Split::TestSmall, false, Device::Cpu, 0).is_err());
    }
}
