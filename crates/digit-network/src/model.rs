use burn::{
    config::Config,
    module::{Module, ModuleVisitor, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, Linear, LinearConfig, PaddingConfig2d, ReLU,
    },
    tensor::{backend::Backend, Tensor},
};

// Each convolution block halves both spatial dimensions.
const POOL_FACTOR: usize = 2;
const CONV_BLOCKS: u32 = 2;

#[derive(Module, Debug)]
struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    activation: ReLU,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.activation.forward(x);

        self.pool.forward(x)
    }
}

#[derive(Config, Debug)]
struct ConvBlockConfig {
    channels: [usize; 2],
    kernel_length: usize,
    init_std: f64,
}

impl ConvBlockConfig {
    fn init<B: Backend>(&self) -> ConvBlock<B> {
        // Zero-pad by half the kernel on every side, so only pooling shrinks the image.
        let padding = self.kernel_length / 2;

        ConvBlock {
            conv: Conv2dConfig::new(self.channels, [self.kernel_length, self.kernel_length])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std,
                })
                .init(),
            activation: ReLU::new(),
            pool: MaxPool2dConfig::new([POOL_FACTOR, POOL_FACTOR])
                .with_strides([POOL_FACTOR, POOL_FACTOR])
                .init(),
        }
    }
}

/// Two convolution blocks followed by two fully connected layers, both rectified.
#[derive(Module, Debug)]
pub struct Network<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: ReLU,
}

impl<B: Backend> Network<B> {
    /// Maps `[batch, channels, height, width]` images to `[batch, classes]` scores.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.conv2.forward(x);
        let x = x.flatten::<2>(1, 3);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.fc2.forward(x);

        self.activation.forward(x)
    }
}

impl<B: Backend> Network<B> {
    /// Dims of every parameter tensor, in the order the module visits them.
    pub fn parameter_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = ParameterShapes(Vec::new());
        self.visit(&mut shapes);

        shapes.0
    }
}

struct ParameterShapes(Vec<Vec<usize>>);

impl<B: Backend> ModuleVisitor<B> for ParameterShapes {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        self.0.push(tensor.dims().to_vec());
    }
}

/// Weights whose tensors do not have the shapes a configuration calls for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("weights hold parameters of shapes {found:?}, the configuration needs {expected:?}")]
pub struct ShapeMismatch {
    pub expected: Vec<Vec<usize>>,
    pub found: Vec<Vec<usize>>,
}

impl ShapeMismatch {
    pub fn check(expected: Vec<Vec<usize>>, found: Vec<Vec<usize>>) -> Result<(), Self> {
        if expected == found {
            Ok(())
        } else {
            Err(Self { expected, found })
        }
    }
}

#[derive(Config, Debug, PartialEq)]
pub struct NetworkConfig {
    #[config(default = 1)]
    pub input_channels: usize,
    #[config(default = 28)]
    pub image_size: usize,
    #[config(default = 5)]
    pub kernel_length: usize,
    #[config(default = 32)]
    pub conv1_filters: usize,
    #[config(default = 64)]
    pub conv2_filters: usize,
    #[config(default = 1024)]
    pub hidden_size: usize,
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 0.1)]
    pub init_std: f64,
}

impl NetworkConfig {
    /// `[channels, height, width]` of a single input image.
    pub fn input_dims(&self) -> [usize; 3] {
        [self.input_channels, self.image_size, self.image_size]
    }

    pub fn output_dims(&self) -> [usize; 1] {
        [self.num_classes]
    }

    /// Elements per image at every stage, from the input through to the class scores.
    pub fn activation_sizes(&self) -> [usize; 7] {
        let side = self.image_size;
        let pooled = side / POOL_FACTOR;

        [
            self.input_channels * side * side,
            self.conv1_filters * side * side,
            self.conv1_filters * pooled * pooled,
            self.conv2_filters * pooled * pooled,
            self.flattened_size(),
            self.hidden_size,
            self.num_classes,
        ]
    }

    fn flattened_size(&self) -> usize {
        let side = self.image_size / POOL_FACTOR.pow(CONV_BLOCKS);

        self.conv2_filters * side * side
    }

    /// Builds the network and loads `record` into it.
    ///
    /// Loading a record does not look at tensor shapes, so they are compared here against the
    /// freshly initialized network.
    pub fn init_with_record<B: Backend>(
        &self,
        record: <Network<B> as Module<B>>::Record,
    ) -> Result<Network<B>, ShapeMismatch> {
        let network = self.init::<B>();
        let expected = network.parameter_shapes();
        let network = network.load_record(record);

        ShapeMismatch::check(expected, network.parameter_shapes())?;

        Ok(network)
    }

    pub fn init<B: Backend>(&self) -> Network<B> {
        Network {
            conv1: ConvBlockConfig::new(
                [self.input_channels, self.conv1_filters],
                self.kernel_length,
                self.init_std,
            )
            .init(),
            conv2: ConvBlockConfig::new(
                [self.conv1_filters, self.conv2_filters],
                self.kernel_length,
                self.init_std,
            )
            .init(),
            fc1: LinearConfig::new(self.flattened_size(), self.hidden_size)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std,
                })
                .init(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: self.init_std,
                })
                .init(),
            activation: ReLU::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Distribution};

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn default_parameter_count() {
        let network = NetworkConfig::new().init::<TestBackend>();

        // conv1 + conv2 + fc1 + fc2, weights and biases.
        assert_eq!(
            network.num_params(),
            (5 * 5 * 32 + 32) + (5 * 5 * 32 * 64 + 64) + (3136 * 1024 + 1024) + (1024 * 10 + 10)
        );
    }

    #[test]
    fn output_is_rectified_class_scores() {
        let network = NetworkConfig::new()
            .with_hidden_size(64)
            .init::<TestBackend>();
        let images = Tensor::<TestBackend, 4>::random([3, 1, 28, 28], Distribution::Default);

        let output = network.forward(images);

        assert_eq!(output.dims(), [3, 10]);
        assert!(output
            .into_data()
            .value
            .into_iter()
            .all(|score| score >= 0.0));
    }

    #[test]
    fn flattened_size_follows_image_size() {
        let config = NetworkConfig::new().with_image_size(32).with_conv2_filters(8);

        assert_eq!(config.flattened_size(), 8 * 8 * 8);
        assert_eq!(config.input_dims(), [1, 32, 32]);
    }

    #[test]
    fn parameter_shapes_in_layer_order() {
        let shapes = NetworkConfig::new().init::<TestBackend>().parameter_shapes();

        assert_eq!(shapes.len(), 8);
        assert!(shapes.contains(&vec![32, 1, 5, 5]));
        assert!(shapes.contains(&vec![3136, 1024]));
        assert!(shapes.contains(&vec![1024, 10]));
    }

    #[test]
    fn record_from_matching_config_loads() {
        let config = NetworkConfig::new()
            .with_conv1_filters(2)
            .with_conv2_filters(2)
            .with_hidden_size(8);
        let record = config.init::<TestBackend>().into_record();

        assert!(config.init_with_record::<TestBackend>(record).is_ok());
    }

    #[test]
    fn record_from_other_config_is_rejected() {
        let trained = NetworkConfig::new()
            .with_conv1_filters(2)
            .with_conv2_filters(2)
            .with_hidden_size(16);
        let claimed = trained.clone().with_hidden_size(8);

        let mismatch = claimed
            .init_with_record::<TestBackend>(trained.init::<TestBackend>().into_record())
            .unwrap_err();

        assert!(mismatch.found.contains(&vec![16, 10]));
        assert!(mismatch.expected.contains(&vec![8, 10]));
    }

    #[test]
    fn default_activation_sizes() {
        assert_eq!(
            NetworkConfig::new().activation_sizes(),
            [784, 25088, 6272, 12544, 3136, 1024, 10]
        );
    }
}
