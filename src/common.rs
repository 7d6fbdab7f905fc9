pub use anyhow::{bail, ensure, format_err, Context, Error};
pub use argh::FromArgs;
pub use derivative::Derivative;
pub use image::{
    imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImage,
    GenericImageView, ImageBuffer, Luma, Rgb, RgbImage,
};
pub use indicatif::{ProgressBar, ProgressStyle};
pub use itertools::Itertools;
pub use log::{debug, error, info, warn};
pub use ndarray::{
    s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip,
};
pub use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
pub use rayon::prelude::*;
pub use serde::{
    de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
    fs::{self, File, OpenOptions},
    io::{prelude::*, BufReader, BufWriter},
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, ConvConfig, ConvTransposeConfig, ModuleT, OptimizerConfig, VarStore},
    Device, Kind, Reduction, Tensor,
};

pub type Fallible<T> = anyhow::Result<T>;

/// Builds a progress bar for long-running loops.
///
/// The bar is hidden automatically when stderr is not attached to a terminal.
pub fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template("{msg}: {wide_bar} {pos}/{len} [{elapsed_precise}]")
    {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar
}
