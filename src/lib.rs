//! Recurrent Marked Temporal Point Process trainer.
//!
//! A recurrent cell summarizes the history of `(time, mark)` events; its state
//! drives a conditional intensity for the time of the next event and a softmax
//! over its mark. Training maximizes the joint log-likelihood with truncated
//! BPTT on a small reverse-mode autodiff engine.

pub mod cell;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod likelihood;
pub mod model;
pub mod optim;
pub mod params;

pub use config::{Precision, RmtppConfig};
pub use data::{Batch, TrainingData};
pub use error::{Result, RmtppError};
pub use model::{ChunkOutput, EpochReport, Rmtpp};
