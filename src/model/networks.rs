use crate::{
    common::*,
    config::{ActivationKind, NormKind},
};

#[derive(Debug)]
pub enum Norm {
    None,
    Batch(nn::BatchNorm),
    Instance,
}

impl Norm {
    pub fn new<'p, P>(path: P, kind: NormKind, channels: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        match kind {
            NormKind::None => Self::None,
            NormKind::Batch => Self::Batch(nn::batch_norm2d(path, channels, Default::default())),
            NormKind::Instance => Self::Instance,
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Self::None => xs.shallow_clone(),
            Self::Batch(bn) => xs.apply_t(bn, train),
            Self::Instance => {
                let mean = xs.mean_dim(&[2, 3], true, Kind::Float);
                let centered = xs - &mean;
                let var = (&centered * &centered).mean_dim(&[2, 3], true, Kind::Float);
                centered / (var + 1e-5).sqrt()
            }
        }
    }
}

fn activate(xs: &Tensor, kind: ActivationKind) -> Tensor {
    match kind {
        ActivationKind::Relu => xs.relu(),
        ActivationKind::LeakyRelu => leaky_relu(xs, 0.2),
    }
}

fn leaky_relu(xs: &Tensor, slope: f64) -> Tensor {
    xs.max_other(&(xs * slope))
}

fn conv_config(kernel_size: i64, stride: i64) -> ConvConfig {
    ConvConfig {
        stride,
        padding: (kernel_size - 1) / 2,
        ..Default::default()
    }
}

fn down_config() -> ConvConfig {
    ConvConfig {
        stride: 2,
        padding: 1,
        ..Default::default()
    }
}

/// Encoder-decoder generator with skip connections between matching scales.
#[derive(Debug)]
pub struct UnetGenerator {
    head: (nn::Conv2D, Norm),
    down: Vec<(nn::Conv2D, Norm)>,
    up: Vec<(nn::ConvTranspose2D, Norm)>,
    tail: nn::Conv2D,
    activation: ActivationKind,
}

impl UnetGenerator {
    pub fn new<'p, P>(
        path: P,
        in_channels: i64,
        out_channels: i64,
        nf: i64,
        max_nf: i64,
        n_scale: i64,
        norm: NormKind,
        activation: ActivationKind,
    ) -> Fallible<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        ensure!(n_scale >= 2, "the generator needs at least 2 scales");
        let path = path.borrow();
        let channels: Vec<i64> = (0..n_scale).map(|i| (nf << i).min(max_nf)).collect();

        let head = (
            nn::conv2d(path / "head", in_channels, channels[0], 3, conv_config(3, 1)),
            Norm::new(path / "head_norm", norm, channels[0]),
        );

        let down = (1..n_scale as usize)
            .map(|i| {
                let conv = nn::conv2d(
                    path / format!("down_{}", i),
                    channels[i - 1],
                    channels[i],
                    4,
                    down_config(),
                );
                let norm = Norm::new(path / format!("down_norm_{}", i), norm, channels[i]);
                (conv, norm)
            })
            .collect();

        let deepest = n_scale as usize - 1;
        let up = (1..n_scale as usize)
            .rev()
            .map(|i| {
                let in_channels = if i == deepest {
                    channels[i]
                } else {
                    channels[i] * 2
                };
                let conv = nn::conv_transpose2d(
                    path / format!("up_{}", i),
                    in_channels,
                    channels[i - 1],
                    4,
                    ConvTransposeConfig {
                        stride: 2,
                        padding: 1,
                        ..Default::default()
                    },
                );
                let norm = Norm::new(path / format!("up_norm_{}", i), norm, channels[i - 1]);
                (conv, norm)
            })
            .collect();

        let tail = nn::conv2d(
            path / "tail",
            channels[0] * 2,
            out_channels,
            3,
            conv_config(3, 1),
        );

        Ok(Self {
            head,
            down,
            up,
            tail,
            activation,
        })
    }

    /// Spatial sizes must be divisible by `2^(n_scale - 1)`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let (conv, norm) = &self.head;
        let mut features = vec![activate(&norm.forward_t(&xs.apply(conv), train), self.activation)];

        for (conv, norm) in &self.down {
            let input = &features[features.len() - 1];
            let output = activate(&norm.forward_t(&input.apply(conv), train), self.activation);
            features.push(output);
        }

        let mut skips = features.into_iter().rev();
        let mut net = skips.next().unwrap_or_else(|| xs.shallow_clone());

        for ((conv, norm), skip) in self.up.iter().zip(skips) {
            let up = activate(&norm.forward_t(&net.apply(conv), train), self.activation);
            net = Tensor::cat(&[up, skip], 1);
        }

        net.apply(&self.tail).tanh()
    }
}

/// PatchGAN discriminator producing one logit per receptive field.
#[derive(Debug)]
pub struct PatchDiscriminator {
    layers: Vec<(nn::Conv2D, Norm)>,
    last: nn::Conv2D,
}

impl PatchDiscriminator {
    pub fn new<'p, P>(path: P, in_channels: i64, nf: i64, n_layers: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let mut layers = vec![(
            nn::conv2d(path / "conv_0", in_channels, nf, 4, down_config()),
            Norm::None,
        )];

        let mut mult = 1;
        for n in 1..=n_layers {
            let prev = mult;
            mult = (1 << n).min(8);
            let stride = if n == n_layers { 1 } else { 2 };
            let config = ConvConfig {
                stride,
                padding: 1,
                ..Default::default()
            };
            layers.push((
                nn::conv2d(path / format!("conv_{}", n), nf * prev, nf * mult, 4, config),
                Norm::new(path / format!("norm_{}", n), NormKind::Batch, nf * mult),
            ));
        }

        let last = nn::conv2d(
            path / "last",
            nf * mult,
            1,
            4,
            ConvConfig {
                stride: 1,
                padding: 1,
                ..Default::default()
            },
        );

        Self { layers, last }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let net = self.layers.iter().fold(xs.shallow_clone(), |net, (conv, norm)| {
            leaky_relu(&norm.forward_t(&net.apply(conv), train), 0.2)
        });
        net.apply(&self.last)
    }
}

/// Predicts a soft mask blending the generated image with the source image.
#[derive(Debug)]
pub struct PixelWarpNet {
    convs: Vec<nn::Conv2D>,
}

impl PixelWarpNet {
    pub fn new<'p, P>(path: P, in_channels: i64, nf: i64) -> Self
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let convs = vec![
            nn::conv2d(path / "conv_0", in_channels, nf, 3, conv_config(3, 1)),
            nn::conv2d(path / "conv_1", nf, nf, 3, conv_config(3, 1)),
            nn::conv2d(path / "conv_2", nf, 1, 3, conv_config(3, 1)),
        ];
        Self { convs }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let last = self.convs.len() - 1;
        self.convs
            .iter()
            .enumerate()
            .fold(xs.shallow_clone(), |net, (index, conv)| {
                let net = net.apply(conv);
                if index == last {
                    net.sigmoid()
                } else {
                    net.relu()
                }
            })
    }
}
