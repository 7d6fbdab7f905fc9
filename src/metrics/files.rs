//! Image lists, pairing checks and image decoding for the metric tool.

use crate::{common::*, error::MetricError};

const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Lists images from a directory (`*.jpg` then `*.png`, sorted), a single image
/// file or a text file with one path per line.
pub fn image_list<P>(path: P) -> Fallible<Vec<PathBuf>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if path.is_dir() {
        let mut files = vec![];
        for ext in IMAGE_EXTENSIONS {
            let pattern = path.join(format!("*.{}", ext));
            let pattern = pattern
                .to_str()
                .ok_or_else(|| MetricError::InvalidPath(path.to_owned()))?;
            for entry in glob::glob(pattern)? {
                files.push(entry?);
            }
        }
        files.sort();
        return Ok(files);
    }

    if path.is_file() {
        if is_image(path) {
            return Ok(vec![path.to_owned()]);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read file list {}", path.display()))?;
        let files = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();
        return Ok(files);
    }

    Err(MetricError::InvalidPath(path.to_owned()).into())
}

/// Basename of a generated file with `___` tokens folded to `__`.
pub fn folded_basename(path: &Path) -> String {
    basename(path).replace("___", "__")
}

pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Checks that generated files and reference files pair up index by index.
///
/// Only the generated side is folded.
pub fn check_pairs(generated: &[PathBuf], reference: &[PathBuf]) -> Result<(), MetricError> {
    if generated.len() != reference.len() {
        return Err(MetricError::LengthMismatch {
            what: "paired file lists",
            left: generated.len(),
            right: reference.len(),
        });
    }

    generated
        .iter()
        .zip(reference)
        .enumerate()
        .try_for_each(|(index, (lhs, rhs))| {
            let left = folded_basename(lhs);
            let right = basename(rhs);
            if left == right {
                Ok(())
            } else {
                Err(MetricError::FileMismatch { index, left, right })
            }
        })
}

/// Decodes an RGB image into a `(3, H, W)` array with values in `[0, 255]`.
pub fn read_image(path: &Path) -> Fallible<Array3<f32>> {
    let image = image::open(path)
        .with_context(|| format!("cannot decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok(Array3::from_shape_fn(
        (3, height as usize, width as usize),
        |(c, y, x)| image.get_pixel(x as u32, y as u32)[c] as f32,
    ))
}

/// Decodes a label map. Colour label maps are read through their first channel.
pub fn read_label_map(path: &Path) -> Fallible<Array2<u8>> {
    let image = ImageReader::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?
        .decode()
        .with_context(|| format!("cannot decode {}", path.display()))?;
    let labels = match image {
        DynamicImage::ImageLuma8(gray) => gray,
        other => {
            let rgb = other.to_rgb8();
            ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                Luma([rgb.get_pixel(x, y)[0]])
            })
        }
    };
    let (width, height) = labels.dimensions();
    Ok(Array2::from_shape_fn(
        (height as usize, width as usize),
        |(y, x)| labels.get_pixel(x as u32, y as u32)[0],
    ))
}

/// Reads a contiguous range of images into a `(B, 3, H, W)` array.
pub fn read_batch<F>(files: &[PathBuf], transform: F) -> Fallible<Array4<f32>>
where
    F: Fn(f32) -> f32 + Sync,
{
    let images = files
        .par_iter()
        .map(|path| Ok(read_image(path)?.mapv(&transform)))
        .collect::<Fallible<Vec<_>>>()?;
    let views: Vec<_> = images.iter().map(|image| image.view()).collect();
    ndarray::stack(Axis(0), &views).with_context(|| {
        format!(
            "images in the batch starting at {} differ in size",
            files
                .first()
                .map(|path| path.display().to_string())
                .unwrap_or_default()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_images(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in names {
            RgbImage::from_pixel(4, 3, Rgb([255, 0, 51]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    #[test]
    fn directory_lists_are_sorted_images() {
        let tmp = tempfile::tempdir().unwrap();
        touch_images(tmp.path(), &["b.png", "c.jpg", "a.jpg"]);
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let names: Vec<_> = image_list(tmp.path())
            .unwrap()
            .iter()
            .map(|path| basename(path))
            .collect();
        assert_eq!(names, ["a.jpg", "b.png", "c.jpg"]);
    }

    #[test]
    fn single_image_and_text_lists() {
        let tmp = tempfile::tempdir().unwrap();
        touch_images(tmp.path(), &["a.png"]);
        let image = tmp.path().join("a.png");
        assert_eq!(image_list(&image).unwrap(), vec![image.clone()]);

        let list = tmp.path().join("list.txt");
        fs::write(&list, "x/1.jpg\n\n  x/2.jpg  \n").unwrap();
        assert_eq!(
            image_list(&list).unwrap(),
            vec![PathBuf::from("x/1.jpg"), PathBuf::from("x/2.jpg")]
        );
    }

    #[test]
    fn missing_path_is_invalid() {
        let err = image_list("/nonexistent/generated").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetricError>(),
            Some(MetricError::InvalidPath(_))
        ));
    }

    #[test]
    fn pairing_folds_generated_names() {
        let generated = vec![PathBuf::from("out/1_a___2_b.jpg")];
        let reference = vec![PathBuf::from("gt/1_a__2_b.jpg")];
        check_pairs(&generated, &reference).unwrap();

        // the reference side is never folded
        assert!(check_pairs(&reference, &generated).is_err());

        let err = check_pairs(&[PathBuf::from("a.jpg")], &[PathBuf::from("b.jpg")]).unwrap_err();
        match err {
            MetricError::FileMismatch { index, left, right } => {
                assert_eq!((index, left.as_str(), right.as_str()), (0, "a.jpg", "b.jpg"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(
            check_pairs(&generated, &[]),
            Err(MetricError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn images_and_label_maps() {
        let tmp = tempfile::tempdir().unwrap();
        touch_images(tmp.path(), &["a.png", "b.png"]);
        let files = image_list(tmp.path()).unwrap();

        let image = read_image(&files[0]).unwrap();
        assert_eq!(image.dim(), (3, 3, 4));
        assert_eq!(image[[0, 0, 0]], 255.0);

        let batch = read_batch(&files, |v| v / 127.5 - 1.0).unwrap();
        assert_eq!(batch.dim(), (2, 3, 3, 4));
        assert!((batch[[1, 2, 2, 3]] - (51.0 / 127.5 - 1.0)).abs() < 1e-6);

        let labels = read_label_map(&files[1]).unwrap();
        assert_eq!(labels.dim(), (3, 4));
        assert_eq!(labels[[0, 0]], 255);
    }
}
