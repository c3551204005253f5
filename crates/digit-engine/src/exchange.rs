use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder, RecorderError},
    tensor::backend::Backend,
};
use digit_network::{Network, NetworkConfig, ShapeMismatch, INPUT_NAME, OUTPUT_NAME};
use serde::{Deserialize, Serialize};

use crate::container::{Container, ContainerError};

pub const EXCHANGE_MAGIC: [u8; 4] = *b"DGXF";

/// A named tensor at the edge of a graph, with per-item dims (the batch dimension excluded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorBinding {
    pub name: String,
    pub dims: Vec<usize>,
}

impl TensorBinding {
    pub fn new(name: impl Into<String>, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            dims: dims.into(),
        }
    }

    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub input: TensorBinding,
    pub output: TensorBinding,
    pub network: NetworkConfig,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExchangeError {
    #[error("invalid exchange file")]
    Container(#[from] ContainerError),
    #[error("failed to encode or decode weights: {0:?}")]
    Record(RecorderError),
    #[error("could not open exchange file")]
    Io(#[from] std::io::Error),
    #[error("weights do not match the network in the manifest")]
    WeightShape(#[from] ShapeMismatch),
}

/// A frozen network in the intermediate format handed to an engine compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeGraph {
    pub manifest: GraphManifest,
    /// Full precision weight record.
    pub weights: Vec<u8>,
}

impl ExchangeGraph {
    pub fn from_network<B: Backend>(
        config: &NetworkConfig,
        network: &Network<B>,
    ) -> Result<Self, ExchangeError> {
        let weights = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(network.clone().into_record(), ())
            .map_err(ExchangeError::Record)?;

        Ok(Self {
            manifest: GraphManifest {
                input: TensorBinding::new(INPUT_NAME, config.input_dims()),
                output: TensorBinding::new(OUTPUT_NAME, config.output_dims()),
                network: config.clone(),
            },
            weights,
        })
    }

    /// Rebuilds the network the graph was exported from.
    pub fn network<B: Backend>(&self, device: &B::Device) -> Result<Network<B>, ExchangeError> {
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(self.weights.clone())
            .map_err(ExchangeError::Record)?;

        Ok(self
            .manifest
            .network
            .init_with_record::<B>(record)?
            .to_device(device))
    }

    pub fn write(&self, path: &Path) -> Result<(), ExchangeError> {
        let container = Container {
            manifest: self.manifest.clone(),
            payload: self.weights.clone(),
        };

        container.write(EXCHANGE_MAGIC, BufWriter::new(File::create(path)?))?;

        tracing::info!(
            path = %path.display(),
            input = %self.manifest.input.name,
            output = %self.manifest.output.name,
            "wrote exchange graph"
        );

        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, ExchangeError> {
        let Container { manifest, payload } =
            Container::read(EXCHANGE_MAGIC, BufReader::new(File::open(path)?))?;

        Ok(Self {
            manifest,
            weights: payload,
        })
    }
}

/// Serializes `network` to the exchange format at `path`.
pub fn export<B: Backend>(
    config: &NetworkConfig,
    network: &Network<B>,
    path: &Path,
) -> Result<ExchangeGraph, ExchangeError> {
    let graph = ExchangeGraph::from_network(config, network)?;
    graph.write(path)?;

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Tensor};

    use super::*;

    type TestBackend = NdArray;

    fn small_config() -> NetworkConfig {
        NetworkConfig::new()
            .with_conv1_filters(2)
            .with_conv2_filters(2)
            .with_hidden_size(8)
    }

    #[test]
    fn manifest_names_bindings() {
        let config = small_config();
        let graph =
            ExchangeGraph::from_network(&config, &config.init::<TestBackend>()).unwrap();

        assert_eq!(graph.manifest.input, TensorBinding::new("Inputs", [1, 28, 28]));
        assert_eq!(graph.manifest.output, TensorBinding::new("fc2/Relu", [10]));
        assert_eq!(graph.manifest.input.elements(), 784);
    }

    #[test]
    fn exported_graph_computes_the_same_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.dxf");
        let config = small_config();
        let network = config.init::<TestBackend>();

        export(&config, &network, &path).unwrap();
        let restored = ExchangeGraph::read(&path)
            .unwrap()
            .network::<TestBackend>(&Default::default())
            .unwrap();

        let images = Tensor::<TestBackend, 4>::ones([2, 1, 28, 28]);

        assert_eq!(
            network.forward(images.clone()).into_data(),
            restored.forward(images).into_data()
        );
    }

    #[test]
    fn rejects_engine_plan_as_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.plan");
        std::fs::write(&path, b"DGPL\x01\x00\x00\x00").unwrap();

        assert!(matches!(
            ExchangeGraph::read(&path),
            Err(ExchangeError::Container(ContainerError::InvalidMagic { .. }))
        ));
    }
}
