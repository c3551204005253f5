//! Moving a trained digit classifier from the training framework onto an inference device.
//!
//! A frozen network is first exported to an exchange graph, then compiled by a [`Converter`]
//! into an engine plan, which an [`Engine`] loads and executes on a [`Stream`].

pub mod container;
pub mod convert;
pub mod engine;
pub mod exchange;
pub mod stream;

pub use convert::{
    BuiltinConverter, ConversionConfig, ConversionRequest, ConvertError, Converter,
    ExternalConverter, Precision,
};
pub use engine::{argmax, Engine, EngineError, ExecutionContext};
pub use exchange::{export, ExchangeError, ExchangeGraph, TensorBinding};
pub use stream::{DeviceBuffer, HostBuffer, Stream, StreamError};
