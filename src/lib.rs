pub mod backend;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod partition;
pub mod quant;
pub mod session;
pub mod stage;
pub mod state;
pub mod weights;

pub use error::{Error, Result};

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::backend::{Backend, CpuBackend};
    pub use crate::builder::*;
    pub use crate::config::*;
    pub use crate::dispatch::*;
    pub use crate::error::*;
    pub use crate::graph::*;
    pub use crate::metadata::*;
    pub use crate::partition::*;
    pub use crate::quant::*;
    pub use crate::session::*;
    pub use crate::stage::*;
    pub use crate::state::*;
    pub use crate::weights::*;
}
