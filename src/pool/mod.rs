pub(crate) mod arena;
pub(crate) mod buffer;
pub(crate) mod cache;
pub(crate) mod chunk;
pub(crate) mod chunk_list;
pub(crate) mod mem;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod subpage;

/// Errors surfaced by arena construction and caller-facing requests.
///
/// Running out of space inside a chunk is *not* an error: `Chunk::allocate`
/// signals it with `None` and the arena escalates to another chunk or a
/// fresh one. Contract violations (double recycle) panic instead; they are
/// program-order bugs, not recoverable conditions.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid arena configuration: {0}")]
    Config(String),

    #[error("bad request: capacity {requested} exceeds max capacity {max}")]
    BadRequest { requested: usize, max: usize },

    #[error("memory reservation of {size} bytes failed: {source}")]
    ReservationFailed {
        size: usize,
        source: std::io::Error,
    },
}
