//! Log lines, image grids and the scalar time series of a run.

use crate::{common::*, loss_buffer::LossRecord};

/// Ordered key-value header of a log line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogInfo(Vec<(String, String)>);

impl LogInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V>(mut self, key: &str, value: V) -> Self
    where
        V: Display,
    {
        self.0.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Formats `[k: v, ...] name: value name: value`.
pub fn format_log(info: &LogInfo, errors: &LossRecord) -> String {
    let header = info.iter().map(|(k, v)| format!("{}: {}", k, v)).join(", ");
    let body = errors
        .iter()
        .map(|(name, value)| format!("{}: {:.6}", name, value))
        .join("  ");
    if body.is_empty() {
        format!("[{}]", header)
    } else {
        format!("[{}] {}", header, body)
    }
}

/// Visual outputs that can be laid out as grid columns.
///
/// Each column is an `(N, C, H, W)` array in `[-1, 1]` with `C` equal to 1 or 3.
pub trait GridVisuals {
    fn grid_columns(&self) -> Fallible<Vec<(String, Array4<f32>)>>;
}

/// Destination of log lines, rendered visuals and scalar time series.
pub trait Sink<V> {
    fn log(&mut self, info: &LogInfo, errors: &LossRecord) -> Fallible<String>;

    fn visualize(&mut self, visuals: &V, path: &Path) -> Fallible<()>;

    fn add_scalars(&mut self, step: usize, scalars: &LossRecord) -> Fallible<()>;
}

#[derive(Debug)]
pub struct Visualizer {
    log_file: Option<PathBuf>,
    scalars: Option<ScalarWriter>,
}

impl Visualizer {
    pub fn new(log_file: Option<PathBuf>, scalars: Option<ScalarWriter>) -> Self {
        Self { log_file, scalars }
    }

    pub fn visualize_results<V>(&self, visuals: &V, path: &Path) -> Fallible<()>
    where
        V: GridVisuals,
    {
        let grid = compose_grid(&visuals.grid_columns()?)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        grid.save(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(())
    }
}

impl<V> Sink<V> for Visualizer
where
    V: GridVisuals,
{
    fn log(&mut self, info: &LogInfo, errors: &LossRecord) -> Fallible<String> {
        let line = format_log(info, errors);
        if let Some(path) = &self.log_file {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", line)?;
        }
        Ok(line)
    }

    fn visualize(&mut self, visuals: &V, path: &Path) -> Fallible<()> {
        self.visualize_results(visuals, path)
    }

    fn add_scalars(&mut self, step: usize, scalars: &LossRecord) -> Fallible<()> {
        if let Some(writer) = &mut self.scalars {
            scalars
                .iter()
                .try_for_each(|(tag, value)| writer.add_scalar(tag, *value, step))?;
            writer.flush()?;
        }
        Ok(())
    }
}

/// Appends `{"step", "tag", "value"}` JSON lines to a time-series file.
#[derive(Debug)]
pub struct ScalarWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Serialize)]
struct ScalarEntry<'a> {
    step: usize,
    tag: &'a str,
    value: f64,
}

impl ScalarWriter {
    pub fn create<P>(dir: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Fallible<()> {
        serde_json::to_writer(&mut self.writer, &ScalarEntry { step, tag, value })?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Fallible<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Lays out one row per sample and one column per visual.
pub fn compose_grid(columns: &[(String, Array4<f32>)]) -> Fallible<RgbImage> {
    ensure!(!columns.is_empty(), "no visuals to render");
    let n_samples = columns[0].1.shape()[0];

    let mut widths = vec![];
    let mut cell_height = 0;
    for (name, array) in columns {
        let (n, c, h, w) = array.dim();
        ensure!(
            n == n_samples,
            "visual {} has {} samples, expect {}",
            name,
            n,
            n_samples
        );
        ensure!(
            c == 1 || c == 3,
            "visual {} has {} channels, expect 1 or 3",
            name,
            c
        );
        widths.push(w as u32);
        cell_height = cell_height.max(h as u32);
    }

    let total_width: u32 = widths.iter().sum();
    let mut grid = RgbImage::new(total_width, cell_height * n_samples as u32);

    for sample in 0..n_samples {
        let mut x = 0;
        for ((_name, array), width) in columns.iter().zip(widths.iter()) {
            let tile = array_to_image(array.index_axis(Axis(0), sample));
            grid.copy_from(&tile, x, sample as u32 * cell_height)?;
            x += width;
        }
    }

    Ok(grid)
}

/// Converts a `(C, H, W)` array in `[-1, 1]` to an RGB image.
pub fn array_to_image(array: ArrayView3<f32>) -> RgbImage {
    let (c, h, w) = array.dim();
    let to_u8 = |v: f32| ((v + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8;
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let pixel = |ch: usize| to_u8(array[[ch.min(c - 1), y, x]]);
        Rgb([pixel(0), pixel(1), pixel(2)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn log_line_format() {
        let info = LogInfo::new()
            .with("id", "PoseTransfer_demo")
            .with("iter", 200)
            .with("epoch", 2);
        let errors = btreemap! {
            "loss_L1".to_string() => 0.5,
            "loss_G_GAN".to_string() => 0.25,
        };
        assert_eq!(
            format_log(&info, &errors),
            "[id: PoseTransfer_demo, iter: 200, epoch: 2] loss_G_GAN: 0.250000  loss_L1: 0.500000"
        );
        assert_eq!(format_log(&info, &LossRecord::new()), "[id: PoseTransfer_demo, iter: 200, epoch: 2]");
    }

    #[test]
    fn grid_has_one_row_per_sample() {
        let img = Array4::<f32>::from_elem((3, 3, 4, 5), 1.0);
        let mask = Array4::<f32>::from_elem((3, 1, 4, 2), -1.0);
        let grid = compose_grid(&[("img_out".into(), img), ("mask".into(), mask)]).unwrap();
        assert_eq!(grid.dimensions(), (7, 12));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(6, 11), &Rgb([0, 0, 0]));
    }

    #[test]
    fn grid_rejects_inconsistent_sample_counts() {
        let a = Array4::<f32>::zeros((2, 3, 4, 4));
        let b = Array4::<f32>::zeros((3, 3, 4, 4));
        assert!(compose_grid(&[("a".into(), a), ("b".into(), b)]).is_err());
    }

    struct Columns(Vec<(String, Array4<f32>)>);

    impl GridVisuals for Columns {
        fn grid_columns(&self) -> Fallible<Vec<(String, Array4<f32>)>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn sink_writes_log_file_scalars_and_grid() {
        let tmp = tempfile::tempdir().unwrap();
        let log_file = tmp.path().join("train_log.txt");
        let scalars = ScalarWriter::create(tmp.path().join("logs")).unwrap();
        let scalar_path = scalars.path().to_owned();
        let mut visualizer = Visualizer::new(Some(log_file.clone()), Some(scalars));

        let errors = btreemap! { "loss_L1".to_string() => 1.0 };
        let line = Sink::<Columns>::log(&mut visualizer, &LogInfo::new().with("epoch", 1), &errors)
            .unwrap();
        Sink::<Columns>::add_scalars(&mut visualizer, 100, &errors).unwrap();

        let columns = Columns(vec![("img".into(), Array4::zeros((2, 3, 8, 8)))]);
        let vis_path = tmp.path().join("vis/train_epoch1.jpg");
        visualizer.visualize(&columns, &vis_path).unwrap();

        assert_eq!(fs::read_to_string(&log_file).unwrap(), format!("{}\n", line));
        let scalar_text = fs::read_to_string(scalar_path).unwrap();
        assert_eq!(scalar_text.trim(), r#"{"step":100,"tag":"loss_L1","value":1.0}"#);
        assert!(vis_path.is_file());
    }
}
