#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod discovery;
pub mod dsp;
pub mod http;
pub mod model;
pub mod proto;
pub mod router;
pub mod transport;

pub use dsp::Dsp;
pub use model::{Block, BlockType, Channel, Device};
pub use transport::Connection;
