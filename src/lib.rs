// ===============================
// src/lib.rs
// ===============================
pub mod blender;
pub mod bus;
pub mod candles;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod metrics;
pub mod positions;
pub mod posttrade;
pub mod recorder;
pub mod replay;
pub mod risk;
pub mod router;
pub mod strategy;

pub use error::{PipelineError, Result};
