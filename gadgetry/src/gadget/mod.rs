//! Gadgets: the schema-validated tools the model invokes by emitting
//! markers in its text output.
//!
//! - [`Gadget`] / [`GadgetDyn`] — the typed tool interface and its dynamic
//!   dispatch wrapper
//! - [`GadgetRegistry`] — name → definition mapping with validation
//! - [`GadgetContext`] — per-invocation capabilities (abort, cost, input)
//! - [`GadgetExecutor`] — runs one invocation under timeout and abort

mod context;
mod errors;
mod executor;
mod registry;
mod result;
mod traits;

pub use context::{CostMeter, GadgetContext, HostExports, HumanInput};
pub use errors::GadgetError;
pub use executor::{ExecutedGadget, GadgetExecutor, HumanExchange};
pub use registry::GadgetRegistry;
pub use result::GadgetExecutionResult;
pub use traits::{Gadget, GadgetDyn, GadgetOutput};
