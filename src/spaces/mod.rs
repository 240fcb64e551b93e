//! Spaces: independently managed sub-ranges of the process address space
//! holding managed objects.
//!
//! Two concrete kinds exist: [`alloc_space::AllocSpace`], a growable heap
//! backed by an mspace allocator, and [`image_space::ImageSpace`], a
//! read-only memory-mapped snapshot of pre-initialized objects. The
//! collector dispatches over them through the capability queries on
//! [`Space`], never by downcasting.

pub mod alloc_space;
pub mod image_space;

use crate::accounting::space_bitmap::SpaceBitmap;
use crate::utils::Address;
use std::fmt;
use std::io;
use std::sync::Arc;

/// When (if ever) the collector scans and sweeps a space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcRetentionPolicy {
    /// Objects are never considered garbage: image spaces and pre-zygote
    /// legacy heaps.
    NeverCollect = 0,
    /// The normal mutable heap, swept by every collection.
    AlwaysCollect = 1,
    /// Swept only by full collections: heaps frozen at zygote-fork time.
    FullCollect = 2,
}

impl GcRetentionPolicy {
    pub(crate) fn from_raw(raw: u8) -> GcRetentionPolicy {
        match raw {
            0 => GcRetentionPolicy::NeverCollect,
            1 => GcRetentionPolicy::AlwaysCollect,
            2 => GcRetentionPolicy::FullCollect,
            _ => unreachable!("invalid retention policy {}", raw),
        }
    }
}

impl fmt::Display for GcRetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GcRetentionPolicy::NeverCollect => write!(f, "NeverCollect"),
            GcRetentionPolicy::AlwaysCollect => write!(f, "AlwaysCollect"),
            GcRetentionPolicy::FullCollect => write!(f, "FullCollect"),
        }
    }
}

/// Identity and bounds contract shared by every space kind.
///
/// `end()` is the high-water mark of the in-use range, not the capacity; it
/// advances as the committed region grows and retreats only through an
/// explicit trim or growth-limit operation on the concrete type.
pub trait Space: Send + Sync {
    /// Diagnostic name; not an identity.
    fn name(&self) -> &str;

    /// Address at which the space begins.
    fn begin(&self) -> Address;

    /// Address one past the in-use range; varies as the space fills.
    fn end(&self) -> Address;

    /// Bytes currently spanned: `end() - begin()`.
    fn size(&self) -> usize {
        self.end().offset_from(self.begin())
    }

    /// Usable capacity. For alloc spaces this is the growth limit, not the
    /// reservation, until the limit is cleared.
    fn capacity(&self) -> usize;

    /// The full physical reservation, ignoring any growth limit.
    fn non_growth_limit_capacity(&self) -> usize;

    fn contains(&self, addr: Address) -> bool {
        self.begin() <= addr && addr < self.end()
    }

    fn gc_retention_policy(&self) -> GcRetentionPolicy;
    fn set_gc_retention_policy(&self, policy: GcRetentionPolicy);

    fn is_alloc_space(&self) -> bool;
    fn is_image_space(&self) -> bool;
    fn is_zygote_space(&self) -> bool;

    fn live_bitmap(&self) -> Arc<SpaceBitmap>;
    fn mark_bitmap(&self) -> Arc<SpaceBitmap>;
}

/// Failure to construct an alloc space.
#[derive(Debug)]
pub enum SpaceError {
    /// The requested sizes are inconsistent
    /// (`initial <= growth_limit <= capacity` must hold).
    InvalidSizes {
        initial_size: usize,
        growth_limit: usize,
        capacity: usize,
    },
    /// The OS would not grant the reservation.
    Reservation(io::Error),
}

impl fmt::Display for SpaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpaceError::InvalidSizes {
                initial_size,
                growth_limit,
                capacity,
            } => write!(
                f,
                "inconsistent space sizes: initial {} growth limit {} capacity {}",
                initial_size, growth_limit, capacity
            ),
            SpaceError::Reservation(err) => write!(f, "reservation failed: {}", err),
        }
    }
}

impl std::error::Error for SpaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpaceError::Reservation(err) => Some(err),
            _ => None,
        }
    }
}
