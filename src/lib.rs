//! Pooled byte-buffer arena and companion thread-local object recycler.
//!
//! The arena partitions pre-reserved chunks into pages via a buddy tree and
//! pages into equal-sized subpage slots; chunks migrate through usage-band
//! lists to favor defragmentation. The recycler returns objects freed on
//! foreign threads to their owning thread through weak-order queues.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("bufpool supports only 64-bit targets.");

pub(crate) mod sync;

pub mod pool;
pub mod recycler;


pub use pool::arena::{ArenaConfig, ArenaMetrics, PoolArena};
pub use pool::buffer::PooledBuf;
pub use pool::cache::{BoundedThreadCache, CacheEntry, PoolThreadCache};
pub use pool::mem::Backing;
pub use pool::size_class::SizeClass;
pub use pool::PoolError;
pub use recycler::{Pooled, Recycler};
