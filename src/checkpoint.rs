use crate::common::*;

/// Identifies one persisted snapshot of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointTag {
    Latest,
    Best,
    Epoch(usize),
}

impl Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Best => write!(f, "best"),
            Self::Epoch(epoch) => write!(f, "{}", epoch),
        }
    }
}

impl std::str::FromStr for CheckpointTag {
    type Err = Error;

    fn from_str(text: &str) -> Fallible<Self> {
        let tag = match text {
            "latest" => Self::Latest,
            "best" => Self::Best,
            _ => Self::Epoch(
                text.parse()
                    .map_err(|_| format_err!("invalid checkpoint tag {:?}", text))?,
            ),
        };
        Ok(tag)
    }
}

/// On-disk layout of the checkpoints of a single run identifier.
///
/// A run directory is assumed to have a single writer.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P>(dir: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create run directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parameter file of one sub-network, e.g. `best_net_G.ot`.
    pub fn network_path(&self, tag: CheckpointTag, network: &str) -> PathBuf {
        self.dir.join(format!("{}_net_{}.ot", tag, network))
    }

    /// Records the invoking command line in `order_line.txt`.
    pub fn save_command_line<I, S>(&self, args: I) -> Fallible<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let line = args.into_iter().map(|arg| arg.as_ref().to_owned()).join(" ");
        let path = self.dir.join("order_line.txt");
        fs::write(&path, format!("{}\n", line))?;
        Ok(path)
    }

    /// Writes the resolved options of a phase (`train` or `test`) as JSON.
    pub fn save_options<T>(&self, phase: &str, options: &T) -> Fallible<PathBuf>
    where
        T: Serialize,
    {
        let path = self.dir.join(format!("{}_opt.json", phase));
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, options)?;
        Ok(path)
    }
}
