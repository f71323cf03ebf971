//! Sentinel kernel: fleet state cache, target resolution, job orchestration
//! and the inbound agent protocol.

pub mod audit;
pub mod bus;
pub mod cache;
pub mod config;
pub mod connections;
pub mod error;
pub mod health;
pub mod http;
pub mod inventory;
pub mod jobs;
pub mod models;
pub mod mqtt;
pub mod protocol;
pub mod query;
pub mod resolver;
pub mod state;
pub mod store;

pub use error::{KernelError, KernelResult};
pub use state::Kernel;
