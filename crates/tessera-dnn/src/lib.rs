//! # tessera-dnn
//!
//! Engine-facing half of the tessera host/device bridge.
//!
//! Provides:
//! - Coherent host/device buffers with shared, reference-counted blocks (`CoherentBuffer`)
//! - The device layer contract and built-in layers (`DeviceLayer`, `layers`)
//! - Scratch accounting and the shared workspace (`ScratchBudget`, `Workspace`)
//! - Per-engine sessions that tie one stream and one set of handles together (`DeviceSession`)

pub mod block;
pub mod coherent;
pub mod layer;
pub mod layers;
pub mod registry;
pub mod session;
pub mod workspace;

pub use block::{BlockArena, BlockRef, Coherence};
pub use coherent::CoherentBuffer;
pub use layer::{DeviceContext, DeviceLayer, LayerKind, LayerParams};
pub use registry::{LayerFactory, LayerRegistry};
pub use session::DeviceSession;
pub use workspace::{ScratchBudget, Workspace};
