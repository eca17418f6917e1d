//! # Tensor-parallel layer policies
//!
//! A [`LayerPolicy`] declares, for one model family, how each module of a transformer is
//! distributed across tensor-parallel ranks:
//! - query/key/value projections and MLP input layers are column-parallel (split along their
//!   output features),
//! - attention output projections and MLP output layers are row-parallel (split along their
//!   input features, partial results reduced across ranks),
//! - word embeddings are vocabulary-parallel,
//! - layer norms, position embeddings and attention mask buffers are replicated.
//!
//! The policy only describes the plan: collective communication and the actual weight split are
//! performed by the parallel runtime consuming it. [`ShardingPlan`] is the owned summary of a
//! policy applied to a concrete model, and [`ParallelModel`] dispatches to the policy matching
//! the model family.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use rust_tensor_parallel::gpt_neo::{GptNeoConfig, GptNeoModel};
//! use rust_tensor_parallel::parallel::ParallelModel;
//! use rust_tensor_parallel::Config;
//! use tch::{nn, Device};
//!
//! let config = GptNeoConfig::from_file("path/to/config.json")?;
//! let vs = nn::VarStore::new(Device::Cpu);
//! let mut model = GptNeoModel::new(vs.root() / "transformer", &config)?;
//!
//! let plan = ParallelModel::GptNeo(&mut model, &config).parallelize(4)?;
//! println!("{}", serde_json::to_string_pretty(&plan)?);
//! # Ok(())
//! # }
//! ```

mod layer;
mod plan;
mod policy;

pub use layer::{Layer, ModuleKind, Replacement, ShardingStrategy};
pub use plan::{BlockPlan, LayerRole, ModelFamily, ParallelModel, ShardSpec, ShardingPlan};
pub use policy::LayerPolicy;
pub(crate) use policy::check_divisible;
