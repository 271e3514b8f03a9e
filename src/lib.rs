//! An archetype-based entity component storage core.
//!
//! Entities sharing an identical component schema live together in an
//! [`Archetype`], packed column-wise into fixed-size chunks recycled through
//! a shared [`ChunkPool`]. The [`ArchetypeManager`] owns every archetype,
//! memoises single-component transitions between them and serves cached
//! filtered queries, serially or fanned out over a worker pool.

pub use archetype::{Archetype, ArchetypeId};
pub use chunk::{Chunk, ChunkPool, CHUNK_ALIGN, CHUNK_SIZE};
pub use component::{
    Component,
    ComponentDef,
    ComponentInfo,
    ComponentRegistry,
    ComponentTypeID,
    RegistryError,
    SerializeHooks,
};
pub use component_set::ComponentSet;
pub use manager::{ArchetypeManager, BatchHandle, EntityRef, ForEachId};

pub mod component;
pub mod component_set;

pub mod chunk;
pub mod archetype;

pub mod manager;
