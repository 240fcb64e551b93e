//! Managed-heap spaces for a virtual-machine runtime.
//!
//! The crate partitions the process address range into independently managed
//! regions: a growable [`AllocSpace`] backed by a segregated free-list
//! allocator over an owned memory reservation, and read-only [`ImageSpace`]s
//! wrapping pre-built object snapshots. Per-object liveness is tracked in
//! [`SpaceBitmap`]s swapped wholesale between collection phases, and an
//! allocation space can be split at zygote-fork time into a frozen prefix
//! and a fresh sibling heap.
//!
//! The collector itself, the object model and the interpreter are external
//! collaborators; this crate only owns address ranges, growth bookkeeping
//! and liveness indexing.

pub mod accounting;
pub mod caps;
pub mod mem_map;
pub mod mspace;
pub mod spaces;
pub mod utils;

/// Minimum alignment of any object header in a managed space. The liveness
/// bitmaps track one bit per word of this size.
pub const OBJECT_ALIGNMENT: usize = 8;

pub use accounting::space_bitmap::SpaceBitmap;
pub use spaces::alloc_space::AllocSpace;
pub use spaces::image_space::{ImageError, ImageHeader, ImageSpace};
pub use spaces::{GcRetentionPolicy, Space, SpaceError};
pub use utils::Address;
