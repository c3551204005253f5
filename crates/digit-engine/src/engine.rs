use std::{fs::File, io, io::BufReader, path::Path};

use burn::{
    module::Module,
    record::{
        BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder, RecorderError,
    },
    tensor::backend::Backend,
};
use digit_network::{Network, ShapeMismatch};

use crate::{
    container::{Container, ContainerError},
    convert::{EngineManifest, Precision, PLAN_MAGIC},
    exchange::TensorBinding,
    stream::{DeviceBuffer, HostBuffer, Stream, StreamError},
};

const INPUT_BINDING: usize = 0;
const OUTPUT_BINDING: usize = 1;
const NUM_BINDINGS: usize = 2;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("could not open engine plan")]
    Io(#[from] io::Error),
    #[error("invalid engine plan")]
    Plan(#[from] ContainerError),
    #[error("failed to decode engine weights: {0:?}")]
    Record(RecorderError),
    #[error("engine weights do not match the network in its manifest")]
    WeightShape(#[from] ShapeMismatch),
    #[error("binding `{name}` must be {expected:?}, the plan says {found:?}")]
    BindingShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("batch size must be between 1 and {max}, got {requested}")]
    BatchSize { requested: usize, max: usize },
    #[error("engine has {expected} bindings, {found} were given")]
    BindingCount { expected: usize, found: usize },
    #[error("binding `{name}` needs {required} bytes, its buffer has {available}")]
    BindingTooSmall {
        name: String,
        required: usize,
        available: usize,
    },
    #[error("stream failed")]
    Stream(#[from] StreamError),
}

/// A compiled network resident on a device.
#[derive(Debug)]
pub struct Engine<B: Backend> {
    manifest: EngineManifest,
    network: Network<B>,
    device: B::Device,
}

fn decode_weights<B: Backend>(
    payload: Vec<u8>,
    precision: Precision,
) -> Result<<Network<B> as Module<B>>::Record, RecorderError> {
    match precision {
        Precision::Float => BinBytesRecorder::<FullPrecisionSettings>::default().load(payload),
        Precision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().load(payload),
    }
}

fn check_binding(binding: &TensorBinding, expected: &[usize]) -> Result<(), EngineError> {
    if binding.dims == expected {
        Ok(())
    } else {
        Err(EngineError::BindingShape {
            name: binding.name.clone(),
            expected: expected.to_vec(),
            found: binding.dims.clone(),
        })
    }
}

impl<B: Backend> Engine<B> {
    pub fn load(path: &Path, device: &B::Device) -> Result<Self, EngineError> {
        let container = Container::read(PLAN_MAGIC, BufReader::new(File::open(path)?))?;
        let engine = Self::from_container(container, device)?;

        tracing::info!(
            path = %path.display(),
            precision = %engine.manifest.precision,
            max_batch_size = engine.manifest.max_batch_size,
            "loaded engine"
        );

        Ok(engine)
    }

    pub fn from_container(
        container: Container<EngineManifest>,
        device: &B::Device,
    ) -> Result<Self, EngineError> {
        let Container { manifest, payload } = container;

        check_binding(&manifest.input, &manifest.network.input_dims())?;
        check_binding(&manifest.output, &manifest.network.output_dims())?;

        let record = decode_weights::<B>(payload, manifest.precision).map_err(EngineError::Record)?;
        let network = manifest
            .network
            .init_with_record::<B>(record)?
            .to_device(device);

        Ok(Self {
            manifest,
            network,
            device: device.clone(),
        })
    }

    pub fn manifest(&self) -> &EngineManifest {
        &self.manifest
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn max_batch_size(&self) -> usize {
        self.manifest.max_batch_size
    }

    pub fn num_bindings(&self) -> usize {
        NUM_BINDINGS
    }

    pub fn binding(&self, index: usize) -> Option<&TensorBinding> {
        match index {
            INPUT_BINDING => Some(&self.manifest.input),
            OUTPUT_BINDING => Some(&self.manifest.output),
            _ => None,
        }
    }

    pub fn binding_index(&self, name: &str) -> Option<usize> {
        (0..NUM_BINDINGS).find(|&index| {
            self.binding(index)
                .is_some_and(|binding| binding.name == name)
        })
    }

    pub fn binding_is_input(&self, index: usize) -> bool {
        index == INPUT_BINDING
    }

    pub fn create_execution_context(&self) -> ExecutionContext<B> {
        ExecutionContext {
            network: self.network.clone(),
            input: self.manifest.input.clone(),
            output: self.manifest.output.clone(),
            image_dims: self.manifest.network.input_dims(),
            max_batch_size: self.manifest.max_batch_size,
        }
    }

    /// Runs `batch_size` images through the engine on a fresh stream, returning the flat scores.
    ///
    /// This is the whole allocate, copy in, execute, copy out and synchronize sequence.
    pub fn infer(&self, images: &[f32], batch_size: usize) -> Result<Vec<f32>, EngineError> {
        let context = self.create_execution_context();
        let scores = HostBuffer::zeros(batch_size * self.manifest.output.elements());

        let input_buffer =
            DeviceBuffer::<B>::mem_alloc(std::mem::size_of_val(images), &self.device);
        let output_buffer =
            DeviceBuffer::<B>::mem_alloc(scores.len() * std::mem::size_of::<f32>(), &self.device);

        let stream = Stream::new();

        stream.memcpy_htod_async(&input_buffer, images)?;
        context.enqueue(batch_size, &[&input_buffer, &output_buffer], &stream)?;
        stream.memcpy_dtoh_async(&scores, &output_buffer)?;
        stream.synchronize()?;

        Ok(scores.to_vec())
    }
}

/// Per-inference state created from an [`Engine`].
pub struct ExecutionContext<B: Backend> {
    network: Network<B>,
    input: TensorBinding,
    output: TensorBinding,
    image_dims: [usize; 3],
    max_batch_size: usize,
}

impl<B: Backend> ExecutionContext<B> {
    fn check_buffer(
        binding: &TensorBinding,
        buffer: &DeviceBuffer<B>,
        batch_size: usize,
    ) -> Result<(), EngineError> {
        let required = batch_size * binding.elements() * std::mem::size_of::<f32>();

        if required > buffer.bytes() {
            Err(EngineError::BindingTooSmall {
                name: binding.name.clone(),
                required,
                available: buffer.bytes(),
            })
        } else {
            Ok(())
        }
    }

    /// Queues one execution of the network on `stream`.
    ///
    /// `bindings` are ordered by binding index: the input buffer, then the output buffer.
    pub fn enqueue(
        &self,
        batch_size: usize,
        bindings: &[&DeviceBuffer<B>],
        stream: &Stream,
    ) -> Result<(), EngineError> {
        if batch_size == 0 || batch_size > self.max_batch_size {
            return Err(EngineError::BatchSize {
                requested: batch_size,
                max: self.max_batch_size,
            });
        }

        let &[input_buffer, output_buffer] = bindings else {
            return Err(EngineError::BindingCount {
                expected: NUM_BINDINGS,
                found: bindings.len(),
            });
        };

        Self::check_buffer(&self.input, input_buffer, batch_size)?;
        Self::check_buffer(&self.output, output_buffer, batch_size)?;

        let network = self.network.clone();
        let input_buffer = input_buffer.clone();
        let output_buffer = output_buffer.clone();
        let input_elements = batch_size * self.input.elements();
        let output_elements = batch_size * self.output.elements();
        let [channels, height, width] = self.image_dims;

        tracing::debug!(batch_size, "enqueued execution");

        stream.launch(move || {
            let input = input_buffer.load()?;
            let available = input.dims()[0];

            if available < input_elements {
                return Err(StreamError::Execution(format!(
                    "input binding holds {available} elements, the batch needs {input_elements}"
                )));
            }

            let images = input
                .slice([0..input_elements])
                .reshape([batch_size, channels, height, width]);
            let scores = network.forward(images).reshape([output_elements]);

            output_buffer.store(scores)
        })?;

        Ok(())
    }
}

/// Index of the first highest score.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index)
}
