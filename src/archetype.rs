//! Archetypes: groups of entities sharing an identical component schema,
//! stored as packed columns across pooled chunks.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::chunk::{column_layout, Chunk, ChunkPool};
use crate::component::{ComponentInfo, ComponentTypeID};
use crate::component_set::ComponentSet;

/// Index of an archetype in its manager's table.
///
/// Transition edges store ids rather than references, so archetype lifetime
/// stays solely with the manager and the (cyclic) edge graph never owns
/// anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) usize);

impl ArchetypeId {
    /// Return the position in the manager's archetype table.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Debug for ArchetypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// Storage for every entity sharing one exact [`ComponentSet`].
///
/// Rows are dense: valid rows are the contiguous range `0..len()`, spread
/// across an ordered list of chunks of which all but the last are full.
pub struct Archetype {
    components: ComponentSet,
    chunks: Vec<Chunk>,
    offsets: Vec<usize>,
    row_capacity: usize,
    len: usize,
    pool: Arc<ChunkPool>,
    add_edges: Vec<(ComponentTypeID, ArchetypeId)>,
    remove_edges: Vec<(ComponentTypeID, ArchetypeId)>,
}

impl Archetype {
    /// Create an empty archetype drawing chunks from `pool`.
    pub fn new(components: ComponentSet, pool: Arc<ChunkPool>) -> Archetype {
        assert!(
            !components.is_empty(),
            "an archetype needs at least one component"
        );
        let (offsets, row_capacity) = column_layout(&components);
        Archetype {
            components,
            chunks: Vec::new(),
            offsets,
            row_capacity,
            len: 0,
            pool,
            add_edges: Vec::new(),
            remove_edges: Vec::new(),
        }
    }

    /// Return the set identifying this archetype; fixed for its lifetime.
    pub fn component_set(&self) -> &ComponentSet {
        &self.components
    }

    /// Total entity count across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks currently backing this archetype.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of rows one chunk can hold for this schema.
    pub fn row_capacity(&self) -> usize {
        self.row_capacity
    }

    /// Returns true if this archetype's set contains the given schema.
    pub fn has_component(&self, id: ComponentTypeID) -> bool {
        self.components.contains(id)
    }

    fn locate(&self, row: usize) -> (usize, usize) {
        (row / self.row_capacity, row % self.row_capacity)
    }

    /// Append a defaulted row and return its index.
    ///
    /// Acquires a chunk from the pool first if the last one is full. Every
    /// column of the new row starts at its schema's default value.
    pub fn create_entity(&mut self) -> usize {
        if self.len == self.chunks.len() * self.row_capacity {
            self.chunks.push(Chunk::new(&self.pool));
        }
        let row = self.len;
        let (chunk_index, inner) = self.locate(row);
        let chunk = &mut self.chunks[chunk_index];
        for (column, info) in self.components.iter().enumerate() {
            info.set_default(chunk.cell_mut(self.offsets[column], info.size(), inner));
        }
        chunk.set_len(inner + 1);
        self.len += 1;
        row
    }

    /// Append a row copied from `source`, projecting by schema.
    ///
    /// Schemas present in both archetypes are copied byte for byte, schemas
    /// present only here keep their default and source-only schemas are
    /// dropped. A transition is this plus `source.remove(source_row)`.
    pub fn copy_entity(&mut self, source: &Archetype, source_row: usize) -> usize {
        assert!(
            source_row < source.len,
            "source row {} out of range ({} entities)",
            source_row,
            source.len
        );
        let row = self.create_entity();
        let (chunk_index, inner) = self.locate(row);
        let (source_chunk, source_inner) = source.locate(source_row);
        for (column, info) in self.components.iter().enumerate() {
            if let Some(source_column) = source.components.index_of(info.id()) {
                let bytes = source.chunks[source_chunk].cell(
                    source.offsets[source_column],
                    info.size(),
                    source_inner,
                );
                self.chunks[chunk_index]
                    .cell_mut(self.offsets[column], info.size(), inner)
                    .copy_from_slice(bytes);
            }
        }
        row
    }

    /// Delete a row, keeping the remaining rows dense.
    ///
    /// Swap-remove: the last row is moved into the vacated slot, so a cached
    /// index to the previous last row now names `row` instead. The chunk
    /// that empties stays with the archetype; chunks return to the pool only
    /// on destruction.
    pub fn remove(&mut self, row: usize) {
        assert!(
            row < self.len,
            "row {} out of range ({} entities)",
            row,
            self.len
        );
        let last = self.len - 1;
        if row != last {
            let (dst_chunk, dst_inner) = self.locate(row);
            let (src_chunk, src_inner) = self.locate(last);
            for (column, info) in self.components.iter().enumerate() {
                let size = info.size();
                let offset = self.offsets[column];
                let src = self.chunks[src_chunk].cell_ptr(offset, size, src_inner);
                let dst = self.chunks[dst_chunk].cell_ptr(offset, size, dst_inner);
                unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
            }
        }
        let (last_chunk, last_inner) = self.locate(last);
        self.chunks[last_chunk].set_len(last_inner);
        self.len = last;
    }

    /// Borrow one component's bytes for one row.
    ///
    /// Panics if the schema is not part of this archetype or the row is out
    /// of range; both indicate a caller bug, not a runtime condition.
    pub fn component(&self, info: &ComponentInfo, row: usize) -> &[u8] {
        let column = self.column_of(info);
        assert!(
            row < self.len,
            "row {} out of range ({} entities)",
            row,
            self.len
        );
        let (chunk, inner) = self.locate(row);
        self.chunks[chunk].cell(self.offsets[column], info.size(), inner)
    }

    /// Overwrite one component's bytes for one row.
    ///
    /// Same preconditions as [`Archetype::component`]; `bytes` must be
    /// exactly the schema's size.
    pub fn set_component(&mut self, info: &ComponentInfo, row: usize, bytes: &[u8]) {
        let column = self.column_of(info);
        assert!(
            row < self.len,
            "row {} out of range ({} entities)",
            row,
            self.len
        );
        assert_eq!(bytes.len(), info.size(), "component byte size mismatch");
        let (chunk, inner) = self.locate(row);
        self.chunks[chunk]
            .cell_mut(self.offsets[column], info.size(), inner)
            .copy_from_slice(bytes);
    }

    fn column_of(&self, info: &ComponentInfo) -> usize {
        match self.components.index_of(info.id()) {
            Some(column) => column,
            None => panic!(
                "component {:?} is not part of archetype {:?}",
                info.name(),
                self.components
            ),
        }
    }

    /// Visit rows `start..end` read-only, handing the callback one pointer
    /// per requested schema in the caller's order.
    pub fn for_each<F>(&self, components: &[Arc<ComponentInfo>], start: usize, end: usize, mut f: F)
    where
        F: FnMut(&[*const u8]),
    {
        // Safety: the callback only ever sees const pointers; the slice
        // transmute just drops element mutability.
        unsafe {
            self.for_each_raw(components, start, end, |ptrs| {
                f(std::mem::transmute::<&[*mut u8], &[*const u8]>(ptrs))
            })
        }
    }

    /// Visit rows `start..end` with mutable cell pointers.
    pub fn for_each_mut<F>(
        &mut self,
        components: &[Arc<ComponentInfo>],
        start: usize,
        end: usize,
        f: F,
    ) where
        F: FnMut(&[*mut u8]),
    {
        // Safety: the exclusive borrow covers the whole range.
        unsafe { self.for_each_raw(components, start, end, f) }
    }

    /// Walk rows `start..end`, building one pointer per requested schema in
    /// the caller's order and advancing all pointers together after every
    /// callback invocation. Pointers are rebuilt at chunk boundaries.
    ///
    /// # Safety
    /// No writer may touch the visited rows for the duration of the call;
    /// writing through the pointers additionally requires exclusive access
    /// to those rows. The parallel drivers satisfy this with disjoint
    /// sub-ranges under the archetype's lock, shared for const iteration
    /// and exclusive for mutation.
    pub(crate) unsafe fn for_each_raw<F>(
        &self,
        components: &[Arc<ComponentInfo>],
        start: usize,
        end: usize,
        mut f: F,
    ) where
        F: FnMut(&[*mut u8]),
    {
        assert!(
            !components.is_empty(),
            "iteration must request at least one component"
        );
        assert!(
            start <= end && end <= self.len,
            "row range {}..{} out of range ({} entities)",
            start,
            end,
            self.len
        );

        let columns: Vec<usize> = components.iter().map(|c| self.column_of(c)).collect();
        let sizes: Vec<usize> = components.iter().map(|c| c.size()).collect();
        let mut ptrs: Vec<*mut u8> = vec![std::ptr::null_mut(); components.len()];

        let mut row = start;
        while row < end {
            let (chunk_index, inner) = self.locate(row);
            let chunk = &self.chunks[chunk_index];
            let chunk_end = end.min((chunk_index + 1) * self.row_capacity);
            for (k, &column) in columns.iter().enumerate() {
                ptrs[k] = chunk.cell_ptr(self.offsets[column], sizes[k], inner);
            }
            for _ in row..chunk_end {
                f(&ptrs);
                for (k, &size) in sizes.iter().enumerate() {
                    ptrs[k] = ptrs[k].add(size);
                }
            }
            row = chunk_end;
        }
    }

    /// True iff this archetype's set is exactly `parent`'s set minus one
    /// schema; returns the connecting schema.
    ///
    /// Used when wiring transition edges at archetype-creation time.
    pub fn is_child_of(&self, parent: &Archetype) -> Option<Arc<ComponentInfo>> {
        let mine = self.components.as_slice();
        let theirs = parent.components.as_slice();
        if mine.len() + 1 != theirs.len() {
            return None;
        }

        let mut connecting = None;
        let mut i = 0;
        for candidate in theirs {
            if i < mine.len() && mine[i].id() == candidate.id() {
                i += 1;
            } else if connecting.is_none() {
                connecting = Some(candidate.clone());
            } else {
                return None;
            }
        }
        connecting
    }

    /// Cached neighbour reached by adding `component`, if established.
    pub fn add_edge(&self, component: ComponentTypeID) -> Option<ArchetypeId> {
        self.add_edges
            .iter()
            .find(|(id, _)| *id == component)
            .map(|&(_, target)| target)
    }

    /// Cached neighbour reached by removing `component`, if established.
    pub fn remove_edge(&self, component: ComponentTypeID) -> Option<ArchetypeId> {
        self.remove_edges
            .iter()
            .find(|(id, _)| *id == component)
            .map(|&(_, target)| target)
    }

    /// Register an add edge; re-registering the same schema is a no-op.
    pub fn insert_add_edge(&mut self, component: ComponentTypeID, target: ArchetypeId) {
        if self.add_edges.iter().all(|(id, _)| *id != component) {
            self.add_edges.push((component, target));
        }
    }

    /// Register a remove edge; re-registering the same schema is a no-op.
    pub fn insert_remove_edge(&mut self, component: ComponentTypeID, target: ArchetypeId) {
        if self.remove_edges.iter().all(|(id, _)| *id != component) {
            self.remove_edges.push((component, target));
        }
    }
}

impl Debug for Archetype {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Archetype {{ components: {:?}, len: {}, chunks: {} }}",
            self.components,
            self.len,
            self.chunks.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::{ComponentDef, ComponentRegistry};

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Default for Position {
        fn default() -> Position {
            Position { x: 0.0, y: 0.0 }
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Health(u32);

    fn fixtures() -> (Arc<ChunkPool>, Arc<ComponentInfo>, Arc<ComponentInfo>) {
        let mut registry = ComponentRegistry::new();
        let position = registry.register::<Position>("Position").unwrap();
        let health = registry.register::<Health>("Health").unwrap();
        (Arc::new(ChunkPool::new()), position, health)
    }

    #[test]
    fn test_create_entity_defaults() {
        let (pool, position, health) = fixtures();
        let mut archetype = Archetype::new(
            ComponentSet::new(vec![position.clone(), health.clone()]),
            pool,
        );

        let row = archetype.create_entity();
        assert_eq!(archetype.len(), 1);
        assert_eq!(
            bytemuck::from_bytes::<Position>(archetype.component(&position, row)),
            &Position::default()
        );
        assert_eq!(
            bytemuck::from_bytes::<Health>(archetype.component(&health, row)),
            &Health::default()
        );
    }

    #[test]
    fn test_copy_entity_projects_by_schema() {
        let (pool, position, health) = fixtures();
        let mut source = Archetype::new(
            ComponentSet::new(vec![position.clone(), health.clone()]),
            pool.clone(),
        );
        let row = source.create_entity();
        source.set_component(&position, row, bytemuck::bytes_of(&Position { x: 1.0, y: 2.0 }));
        source.set_component(&health, row, bytemuck::bytes_of(&Health(7)));

        // Shrinking copy: shared bytes identical, source-only schema dropped.
        let mut narrow = Archetype::new(ComponentSet::new(vec![position.clone()]), pool.clone());
        let narrow_row = narrow.copy_entity(&source, row);
        assert_eq!(
            bytemuck::from_bytes::<Position>(narrow.component(&position, narrow_row)),
            &Position { x: 1.0, y: 2.0 }
        );

        // Growing copy: absent schema gets its default.
        let mut wide = Archetype::new(
            ComponentSet::new(vec![position.clone(), health.clone()]),
            pool,
        );
        let wide_row = wide.copy_entity(&narrow, narrow_row);
        assert_eq!(
            bytemuck::from_bytes::<Position>(wide.component(&position, wide_row)),
            &Position { x: 1.0, y: 2.0 }
        );
        assert_eq!(
            bytemuck::from_bytes::<Health>(wide.component(&health, wide_row)),
            &Health(0)
        );
    }

    #[test]
    fn test_remove_keeps_rows_dense() {
        let (pool, _, health) = fixtures();
        let mut archetype = Archetype::new(ComponentSet::new(vec![health.clone()]), pool);
        for value in 0..3u32 {
            let row = archetype.create_entity();
            archetype.set_component(&health, row, bytemuck::bytes_of(&Health(value)));
        }

        archetype.remove(1);
        assert_eq!(archetype.len(), 2);
        // The last row was swapped into the vacated slot.
        assert_eq!(
            bytemuck::from_bytes::<Health>(archetype.component(&health, 0)),
            &Health(0)
        );
        assert_eq!(
            bytemuck::from_bytes::<Health>(archetype.component(&health, 1)),
            &Health(2)
        );

        archetype.remove(1);
        archetype.remove(0);
        assert!(archetype.is_empty());
    }

    #[test]
    fn test_iteration_spans_chunks() {
        // A 1 KiB schema gives 16 rows per chunk, so 40 rows need 3 chunks.
        let mut registry = ComponentRegistry::new();
        let blob = registry
            .register_raw(ComponentDef::new("blob", 1024, 1))
            .unwrap();
        let pool = Arc::new(ChunkPool::new());
        let mut archetype = Archetype::new(ComponentSet::new(vec![blob.clone()]), pool);

        for i in 0..40usize {
            let row = archetype.create_entity();
            let mut bytes = [0u8; 1024];
            bytes[0] = i as u8;
            archetype.set_component(&blob, row, &bytes);
        }
        assert_eq!(archetype.row_capacity(), 16);
        assert_eq!(archetype.chunk_count(), 3);

        let mut seen = Vec::new();
        archetype.for_each(&[blob.clone()], 0, 40, |ptrs| {
            seen.push(unsafe { *ptrs[0] });
        });
        let expected: Vec<u8> = (0..40).map(|i| i as u8).collect();
        assert_eq!(seen, expected);

        // Sub-ranges observe the same rows, including across the chunk seam.
        let mut partial = Vec::new();
        archetype.for_each(&[blob], 10, 20, |ptrs| {
            partial.push(unsafe { *ptrs[0] });
        });
        let expected: Vec<u8> = (10..20).map(|i| i as u8).collect();
        assert_eq!(partial, expected);
    }

    #[test]
    fn test_for_each_mut_writes_through() {
        let (pool, _, health) = fixtures();
        let mut archetype = Archetype::new(ComponentSet::new(vec![health.clone()]), pool);
        for _ in 0..5 {
            archetype.create_entity();
        }

        archetype.for_each_mut(&[health.clone()], 0, 5, |ptrs| unsafe {
            *(ptrs[0] as *mut u32) = 9;
        });
        for row in 0..5 {
            assert_eq!(
                bytemuck::from_bytes::<Health>(archetype.component(&health, row)),
                &Health(9)
            );
        }
    }

    #[test]
    fn test_is_child_of() {
        let (pool, position, health) = fixtures();
        let parent = Archetype::new(
            ComponentSet::new(vec![position.clone(), health.clone()]),
            pool.clone(),
        );
        let child = Archetype::new(ComponentSet::new(vec![position.clone()]), pool.clone());
        let unrelated = Archetype::new(ComponentSet::new(vec![health.clone()]), pool);

        let connecting = child.is_child_of(&parent).unwrap();
        assert_eq!(connecting.id(), health.id());
        assert_eq!(
            unrelated.is_child_of(&parent).unwrap().id(),
            position.id()
        );
        assert!(parent.is_child_of(&child).is_none());
        assert!(child.is_child_of(&unrelated).is_none());
    }

    #[test]
    fn test_edges_idempotent() {
        let (pool, position, health) = fixtures();
        let mut archetype = Archetype::new(ComponentSet::new(vec![position]), pool);

        assert_eq!(archetype.add_edge(health.id()), None);
        archetype.insert_add_edge(health.id(), ArchetypeId(3));
        archetype.insert_add_edge(health.id(), ArchetypeId(5));
        assert_eq!(archetype.add_edge(health.id()), Some(ArchetypeId(3)));

        archetype.insert_remove_edge(health.id(), ArchetypeId(1));
        archetype.insert_remove_edge(health.id(), ArchetypeId(2));
        assert_eq!(archetype.remove_edge(health.id()), Some(ArchetypeId(1)));
    }

    #[test]
    #[should_panic(expected = "not part of archetype")]
    fn test_absent_component_access_panics() {
        let (pool, position, health) = fixtures();
        let mut archetype = Archetype::new(ComponentSet::new(vec![position]), pool);
        let row = archetype.create_entity();
        archetype.component(&health, row);
    }
}
