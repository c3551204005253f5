pub mod model;

pub use model::{Network, NetworkConfig, ShapeMismatch};

/// Name of the tensor fed into the network.
pub const INPUT_NAME: &str = "Inputs";
/// Name of the tensor read out of the network, the rectified output of the last layer.
pub const OUTPUT_NAME: &str = "fc2/Relu";
