use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use burn::tensor::{backend::Backend, Data, Shape, Tensor};
use crossbeam_channel::{Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StreamError {
    #[error("copy of {required} bytes does not fit a {available} byte buffer")]
    BufferTooSmall { required: usize, available: usize },
    #[error("device buffer was read before anything was written to it")]
    Uninitialized,
    #[error("{0}")]
    Execution(String),
    #[error("stream worker has stopped")]
    Disconnected,
}

const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// A flat region of device memory holding `f32` elements.
///
/// Clones refer to the same allocation.
#[derive(Debug, Clone)]
pub struct DeviceBuffer<B: Backend> {
    bytes: usize,
    device: B::Device,
    contents: Arc<Mutex<Option<Tensor<B, 1>>>>,
}

impl<B: Backend> DeviceBuffer<B> {
    pub fn mem_alloc(bytes: usize, device: &B::Device) -> Self {
        tracing::debug!(bytes, "allocated device buffer");

        Self {
            bytes,
            device: device.clone(),
            contents: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn load(&self) -> Result<Tensor<B, 1>, StreamError> {
        self.contents
            .lock()
            .expect("mutex is poisoned")
            .clone()
            .ok_or(StreamError::Uninitialized)
    }

    pub(crate) fn store(&self, tensor: Tensor<B, 1>) -> Result<(), StreamError> {
        let required = tensor.dims()[0] * ELEMENT_SIZE;

        if required > self.bytes {
            return Err(StreamError::BufferTooSmall {
                required,
                available: self.bytes,
            });
        }

        *self.contents.lock().expect("mutex is poisoned") = Some(tensor);

        Ok(())
    }

    fn check_fits(&self, elements: usize) -> Result<(), StreamError> {
        let required = elements * ELEMENT_SIZE;

        if required > self.bytes {
            Err(StreamError::BufferTooSmall {
                required,
                available: self.bytes,
            })
        } else {
            Ok(())
        }
    }
}

/// Host memory that device-to-host copies land in. Only meaningful after a synchronize.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<f32>>>);

impl HostBuffer {
    pub fn zeros(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0.0; len])))
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("mutex is poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.lock().expect("mutex is poisoned").clone()
    }
}

type Operation = Box<dyn FnOnce() -> Result<(), StreamError> + Send>;

enum StreamCommand {
    Run(Operation),
    Synchronize(Sender<Result<(), StreamError>>),
}

/// An in-order queue of device work executed on a dedicated thread.
///
/// After an operation fails, everything queued behind it is skipped until the next
/// [`Stream::synchronize`], which reports the failure.
pub struct Stream {
    command_sender: Option<Sender<StreamCommand>>,
    worker: Option<JoinHandle<()>>,
}

fn run_worker(command_receiver: Receiver<StreamCommand>) {
    let mut failure = None;

    for command in command_receiver {
        match command {
            StreamCommand::Run(operation) => {
                if failure.is_none() {
                    if let Err(error) = operation() {
                        tracing::debug!(%error, "stream operation failed");
                        failure = Some(error);
                    }
                }
            }
            StreamCommand::Synchronize(done_sender) => {
                let _ = done_sender.send(failure.take().map_or(Ok(()), Err));
            }
        }
    }
}

impl Stream {
    pub fn new() -> Self {
        let (command_sender, command_receiver) = crossbeam_channel::unbounded();
        let worker = thread::spawn(move || run_worker(command_receiver));

        Self {
            command_sender: Some(command_sender),
            worker: Some(worker),
        }
    }

    fn submit(&self, command: StreamCommand) -> Result<(), StreamError> {
        self.command_sender
            .as_ref()
            .ok_or(StreamError::Disconnected)?
            .send(command)
            .map_err(|_| StreamError::Disconnected)
    }

    pub(crate) fn launch(
        &self,
        operation: impl FnOnce() -> Result<(), StreamError> + Send + 'static,
    ) -> Result<(), StreamError> {
        self.submit(StreamCommand::Run(Box::new(operation)))
    }

    /// Queues a copy of `source` into `destination`. The host data is captured immediately.
    pub fn memcpy_htod_async<B: Backend>(
        &self,
        destination: &DeviceBuffer<B>,
        source: &[f32],
    ) -> Result<(), StreamError> {
        destination.check_fits(source.len())?;

        let destination = destination.clone();
        let data = Data::new(source.to_vec(), Shape::new([source.len()]));

        self.launch(move || {
            let tensor = Tensor::from_data_device(data.convert(), &destination.device);

            destination.store(tensor)
        })
    }

    /// Queues a copy of the start of `source` into all of `destination`.
    pub fn memcpy_dtoh_async<B: Backend>(
        &self,
        destination: &HostBuffer,
        source: &DeviceBuffer<B>,
    ) -> Result<(), StreamError> {
        source.check_fits(destination.len())?;

        let destination = destination.clone();
        let source = source.clone();

        self.launch(move || {
            let values = source.load()?.into_data().convert::<f32>().value;
            let mut host = destination.0.lock().expect("mutex is poisoned");
            let length = host.len();

            if values.len() < length {
                return Err(StreamError::BufferTooSmall {
                    required: length * ELEMENT_SIZE,
                    available: values.len() * ELEMENT_SIZE,
                });
            }

            host.copy_from_slice(&values[..length]);

            Ok(())
        })
    }

    /// Blocks until everything queued so far has run.
    pub fn synchronize(&self) -> Result<(), StreamError> {
        let (done_sender, done_receiver) = crossbeam_channel::bounded(1);
        self.submit(StreamCommand::Synchronize(done_sender))?;

        done_receiver
            .recv()
            .map_err(|_| StreamError::Disconnected)?
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        drop(self.command_sender.take());

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
