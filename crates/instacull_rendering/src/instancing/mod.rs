//! Device-resident instance storage.
//!
//! ## Key Concepts
//!
//! - **Instance Pool**: every instance, uploaded once, read by the culling kernel
//! - **Visibility Surface**: append buffer the kernel compacts survivors into
//! - **Indirect Arguments**: draw parameters whose instance count is written
//!   on the device from the surface's counter, never by the host

mod draw_args;
mod instance_data;
mod pool;
mod visibility;

pub use draw_args::{DrawArguments, IndirectDrawArguments, INSTANCE_COUNT_OFFSET};
pub use instance_data::{InstanceRecord, PopulationSource};
pub use pool::InstancePool;
pub use visibility::VisibilitySurface;
