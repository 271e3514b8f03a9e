//! The archetype manager: owns every archetype and the chunk pool, resolves
//! schema lookups, keeps cached filtered queries live and drives serial and
//! parallel iteration under per-archetype locks.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::ChunkPool;
use crate::component::{ComponentInfo, ComponentTypeID};
use crate::component_set::ComponentSet;

/// A stable handle for one cached (required, excluded) query filter.
///
/// Handles carry the manager generation they were issued under, so a handle
/// held across [`ArchetypeManager::clear`] fails loudly instead of silently
/// naming a recycled slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForEachId {
    index: usize,
    generation: u64,
}

impl Debug for ForEachId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ForEachId({}#{})", self.index, self.generation)
    }
}

/// A reference to one entity's current storage slot.
///
/// Not a stable identity: any transition moves the entity to another
/// archetype, and a swap-remove in its archetype can move another entity
/// into the row this referred to. Layers that need stable handles map them
/// onto fresh `EntityRef`s after every structural change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityRef {
    pub archetype: ArchetypeId,
    pub row: usize,
}

struct CachedQuery {
    /// The caller's component list, in the caller's order. Callback pointer
    /// order follows this, whichever physical layout an archetype has.
    components: Vec<Arc<ComponentInfo>>,
    required: ComponentSet,
    excluded: ComponentSet,
    matches: Vec<ArchetypeId>,
}

impl CachedQuery {
    fn accepts(&self, set: &ComponentSet) -> bool {
        set.contains_all(&self.required) && !set.intersects(&self.excluded)
    }
}

struct BatchState {
    pending: Mutex<usize>,
    done: Condvar,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl BatchState {
    fn new(pending: usize) -> BatchState {
        BatchState {
            pending: Mutex::new(pending),
            done: Condvar::new(),
            panic: Mutex::new(None),
        }
    }

    fn add_task(&self) {
        *self.pending.lock() += 1;
    }

    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.panic.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    fn finish_task(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.done.notify_all();
        }
    }
}

/// Completion handle for one parallel query.
///
/// Joins the whole query, not individual archetypes; once submitted a batch
/// runs to completion.
pub struct BatchHandle {
    state: Arc<BatchState>,
}

impl BatchHandle {
    /// Block until every sub-range of the batch has run.
    ///
    /// If any callback panicked, the first captured panic is re-raised here.
    pub fn wait(self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.done.wait(&mut pending);
        }
        drop(pending);
        if let Some(payload) = self.state.panic.lock().take() {
            resume_unwind(payload);
        }
    }
}

/// Owns every archetype, the shared chunk pool and the query cache.
///
/// Structural lookups and archetype creation serialise through `&mut self`;
/// iteration and per-entity access take `&self` and synchronise on the
/// per-archetype locks only, so queries over disjoint archetypes never
/// contend.
pub struct ArchetypeManager {
    pool: Arc<ChunkPool>,
    archetypes: Vec<Arc<RwLock<Archetype>>>,
    by_set: HashMap<ComponentSet, ArchetypeId>,
    queries: Vec<CachedQuery>,
    query_ids: HashMap<(ComponentSet, ComponentSet), usize>,
    workers: rayon::ThreadPool,
    generation: u64,
}

impl ArchetypeManager {
    pub fn new() -> ArchetypeManager {
        ArchetypeManager::with_thread_count(0)
    }

    /// Build a manager whose worker pool has `threads` workers; zero picks
    /// the rayon default (one per logical CPU).
    pub fn with_thread_count(threads: usize) -> ArchetypeManager {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("archetypal-worker-{}", i))
            .build()
            .expect("failed to build worker pool");
        ArchetypeManager {
            pool: Arc::new(ChunkPool::new()),
            archetypes: Vec::new(),
            by_set: HashMap::new(),
            queries: Vec::new(),
            query_ids: HashMap::new(),
            workers,
            generation: 0,
        }
    }

    /// The chunk pool shared by every archetype in this manager.
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Number of archetypes currently alive.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// The lock wrapping one archetype's storage.
    pub fn archetype(&self, id: ArchetypeId) -> &Arc<RwLock<Archetype>> {
        &self.archetypes[id.index()]
    }

    /// Exact-match lookup; never creates.
    pub fn get_archetype(&self, set: &ComponentSet) -> Option<ArchetypeId> {
        self.by_set.get(set).copied()
    }

    /// Find or create the archetype for `set`.
    ///
    /// On creation the new archetype is compared against every existing one
    /// to wire single-component transition edges both ways, and is pushed
    /// into every cached query whose filter it satisfies, so queries observe
    /// archetypes created after them.
    pub fn make_archetype(&mut self, set: ComponentSet) -> ArchetypeId {
        if let Some(&id) = self.by_set.get(&set) {
            return id;
        }

        let id = ArchetypeId(self.archetypes.len());
        let mut archetype = Archetype::new(set.clone(), self.pool.clone());
        log::debug!("created archetype {:?} as {:?}", set, id);

        for (index, slot) in self.archetypes.iter().enumerate() {
            let other_id = ArchetypeId(index);
            let mut other = slot.write();
            if let Some(connecting) = other.is_child_of(&archetype) {
                other.insert_add_edge(connecting.id(), id);
                archetype.insert_remove_edge(connecting.id(), other_id);
            } else if let Some(connecting) = archetype.is_child_of(&other) {
                archetype.insert_add_edge(connecting.id(), other_id);
                other.insert_remove_edge(connecting.id(), id);
            }
        }

        for query in &mut self.queries {
            if query.accepts(&set) {
                query.matches.push(id);
            }
        }

        self.archetypes.push(Arc::new(RwLock::new(archetype)));
        self.by_set.insert(set, id);
        id
    }

    /// Get the stable id for a (required, excluded) filter pair.
    ///
    /// The first call scans existing archetypes once to seed the matching
    /// list; later calls with an equal pair return the same id and reuse the
    /// cached list. The callback pointer order of the returned query is the
    /// component order of this first call.
    pub fn get_for_each_id(
        &mut self,
        components: &[Arc<ComponentInfo>],
        exclude: &[Arc<ComponentInfo>],
    ) -> ForEachId {
        assert!(
            !components.is_empty(),
            "a query must request at least one component"
        );
        let required = ComponentSet::new(components.to_vec());
        let excluded = ComponentSet::new(exclude.to_vec());
        let key = (required.clone(), excluded.clone());
        let generation = self.generation;

        if let Some(&index) = self.query_ids.get(&key) {
            return ForEachId { index, generation };
        }

        let query = CachedQuery {
            components: components.to_vec(),
            required,
            excluded,
            matches: self
                .archetypes
                .iter()
                .enumerate()
                .filter(|(_, slot)| {
                    let archetype = slot.read();
                    archetype.component_set().contains_all(&key.0)
                        && !archetype.component_set().intersects(&key.1)
                })
                .map(|(index, _)| ArchetypeId(index))
                .collect(),
        };
        log::trace!(
            "registered query {:?} excluding {:?} with {} initial matches",
            key.0,
            key.1,
            query.matches.len()
        );

        let index = self.queries.len();
        self.queries.push(query);
        self.query_ids.insert(key, index);
        ForEachId { index, generation }
    }

    fn query(&self, id: ForEachId) -> &CachedQuery {
        assert_eq!(
            id.generation, self.generation,
            "query id {:?} was invalidated by clear",
            id
        );
        &self.queries[id.index]
    }

    /// Mutably visit every entity matching the query, one archetype at a
    /// time under that archetype's exclusive lock.
    pub fn for_each<F>(&self, id: ForEachId, mut f: F)
    where
        F: FnMut(&[*mut u8]),
    {
        let query = self.query(id);
        for &archetype_id in &query.matches {
            let mut archetype = self.archetypes[archetype_id.index()].write();
            let len = archetype.len();
            archetype.for_each_mut(&query.components, 0, len, |ptrs| f(ptrs));
        }
    }

    /// Read-only sibling of [`ArchetypeManager::for_each`]; takes shared
    /// locks, so concurrent const queries over one archetype proceed
    /// together.
    pub fn const_for_each<F>(&self, id: ForEachId, mut f: F)
    where
        F: FnMut(&[*const u8]),
    {
        let query = self.query(id);
        for &archetype_id in &query.matches {
            let archetype = self.archetypes[archetype_id.index()].read();
            archetype.for_each(&query.components, 0, archetype.len(), |ptrs| f(ptrs));
        }
    }

    /// Mutably visit every matching entity on the worker pool.
    ///
    /// Each matching archetype's rows are cut into contiguous sub-ranges of
    /// at most `entities_per_thread` rows, each submitted as an independent
    /// pool task. The archetype's exclusive lock is taken here, on the
    /// submitting thread, and travels with the tasks as a shared owned
    /// guard; it unlocks when the archetype's last sub-range finishes.
    /// Workers never block on an archetype lock, so overlapping batches
    /// cannot wedge the pool. Wait on the returned handle to join the whole
    /// query.
    pub fn for_each_parallel<F>(
        &self,
        id: ForEachId,
        entities_per_thread: usize,
        f: F,
    ) -> BatchHandle
    where
        F: Fn(&[*mut u8]) + Send + Sync + 'static,
    {
        assert!(entities_per_thread > 0, "batch size must be non-zero");
        let query = self.query(id);
        // The extra pending task is this submission loop; it keeps the
        // handle from signalling completion while tasks are still being
        // queued.
        let state = Arc::new(BatchState::new(1));
        let f = Arc::new(f);
        let components = Arc::new(query.components.clone());
        for &archetype_id in &query.matches {
            // Matches are in ascending id order, the same order transitions
            // lock in, so concurrent submissions cannot deadlock each other.
            let guard = Arc::new(self.archetypes[archetype_id.index()].write_arc());
            let len = guard.len();
            let mut start = 0;
            while start < len {
                let end = len.min(start + entities_per_thread);
                state.add_task();
                let guard = guard.clone();
                let components = components.clone();
                let state = state.clone();
                let f = f.clone();
                self.workers.spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        // Safety: the exclusive lock is held until the last
                        // sub-range drops it and sub-ranges are disjoint.
                        unsafe { guard.for_each_raw(&components, start, end, |ptrs| f(ptrs)) }
                    }));
                    if let Err(payload) = result {
                        state.record_panic(payload);
                    }
                    state.finish_task();
                });
                start = end;
            }
        }
        state.finish_task();
        BatchHandle { state }
    }

    /// Read-only sibling of [`ArchetypeManager::for_each_parallel`]; holds
    /// shared locks, so it can overlap other const work on the same
    /// archetypes.
    pub fn const_for_each_parallel<F>(
        &self,
        id: ForEachId,
        entities_per_thread: usize,
        f: F,
    ) -> BatchHandle
    where
        F: Fn(&[*const u8]) + Send + Sync + 'static,
    {
        assert!(entities_per_thread > 0, "batch size must be non-zero");
        let query = self.query(id);
        let state = Arc::new(BatchState::new(1));
        let f = Arc::new(f);
        let components = Arc::new(query.components.clone());
        for &archetype_id in &query.matches {
            let guard = Arc::new(self.archetypes[archetype_id.index()].read_arc());
            let len = guard.len();
            let mut start = 0;
            while start < len {
                let end = len.min(start + entities_per_thread);
                state.add_task();
                let guard = guard.clone();
                let components = components.clone();
                let state = state.clone();
                let f = f.clone();
                self.workers.spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        guard.for_each(&components, start, end, |ptrs| f(ptrs))
                    }));
                    if let Err(payload) = result {
                        state.record_panic(payload);
                    }
                    state.finish_task();
                });
                start = end;
            }
        }
        state.finish_task();
        BatchHandle { state }
    }

    /// Create an entity with defaulted components in the archetype for
    /// `set`, creating the archetype first if needed.
    pub fn create_entity(&mut self, set: ComponentSet) -> EntityRef {
        let archetype = self.make_archetype(set);
        let row = self.archetypes[archetype.index()].write().create_entity();
        log::trace!("created entity at {:?} row {}", archetype, row);
        EntityRef { archetype, row }
    }

    /// Remove an entity's row from its archetype.
    ///
    /// Swap-remove: a held reference to the archetype's previous last row
    /// now refers to the vacated slot.
    pub fn destroy_entity(&self, entity: EntityRef) {
        self.archetypes[entity.archetype.index()]
            .write()
            .remove(entity.row);
    }

    /// Move an entity to the archetype that additionally has `component`,
    /// defaulting the new column. Returns the entity's new location.
    pub fn add_component(&mut self, entity: EntityRef, component: Arc<ComponentInfo>) -> EntityRef {
        let destination = {
            let source = self.archetypes[entity.archetype.index()].read();
            assert!(
                !source.has_component(component.id()),
                "entity already has component {:?}",
                component.name()
            );
            source.add_edge(component.id())
        };
        let destination = match destination {
            Some(id) => id,
            None => {
                let set = self.archetypes[entity.archetype.index()]
                    .read()
                    .component_set()
                    .with(component);
                self.make_archetype(set)
            }
        };
        self.transition(entity, destination)
    }

    /// Move an entity to the archetype without the given schema, dropping
    /// that column's bytes. Returns the entity's new location.
    pub fn remove_component(&mut self, entity: EntityRef, component: ComponentTypeID) -> EntityRef {
        let destination = {
            let source = self.archetypes[entity.archetype.index()].read();
            assert!(
                source.has_component(component),
                "entity does not have component {:?}",
                component
            );
            source.remove_edge(component)
        };
        let destination = match destination {
            Some(id) => id,
            None => {
                let set = self.archetypes[entity.archetype.index()]
                    .read()
                    .component_set()
                    .without(component);
                self.make_archetype(set)
            }
        };
        self.transition(entity, destination)
    }

    /// Move one row between two archetypes as a copy-then-remove, holding
    /// exclusive locks on both (in id order) for the whole sequence so no
    /// reader observes the entity in both or in neither.
    fn transition(&self, entity: EntityRef, destination: ArchetypeId) -> EntityRef {
        let source_index = entity.archetype.index();
        let destination_index = destination.index();
        assert_ne!(source_index, destination_index, "transition to same archetype");

        let (mut first, mut second) = if source_index < destination_index {
            let first = self.archetypes[source_index].write();
            let second = self.archetypes[destination_index].write();
            (first, second)
        } else {
            let second = self.archetypes[destination_index].write();
            let first = self.archetypes[source_index].write();
            (first, second)
        };
        let (source, dest) = (&mut *first, &mut *second);

        let row = dest.copy_entity(source, entity.row);
        source.remove(entity.row);
        log::trace!(
            "moved entity from {:?} row {} to {:?} row {}",
            entity.archetype,
            entity.row,
            destination,
            row
        );
        EntityRef {
            archetype: destination,
            row,
        }
    }

    /// Copy one component's bytes out of an entity's row.
    pub fn get_component(&self, entity: EntityRef, component: &ComponentInfo) -> Vec<u8> {
        self.archetypes[entity.archetype.index()]
            .read()
            .component(component, entity.row)
            .to_vec()
    }

    /// Overwrite one component's bytes for an entity's row.
    pub fn set_component(&self, entity: EntityRef, component: &ComponentInfo, bytes: &[u8]) {
        self.archetypes[entity.archetype.index()]
            .write()
            .set_component(component, entity.row, bytes);
    }

    /// Destroy every archetype and invalidate every cached query id.
    ///
    /// Chunks flow back to the pool as the archetypes drop, ready for reuse
    /// by whatever is built next.
    pub fn clear(&mut self) {
        log::debug!(
            "clearing {} archetypes and {} queries",
            self.archetypes.len(),
            self.queries.len()
        );
        self.archetypes.clear();
        self.by_set.clear();
        self.queries.clear();
        self.query_ids.clear();
        self.generation += 1;
    }
}

impl Default for ArchetypeManager {
    fn default() -> ArchetypeManager {
        ArchetypeManager::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::ComponentRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    fn fixtures() -> (
        ArchetypeManager,
        Arc<ComponentInfo>,
        Arc<ComponentInfo>,
    ) {
        let mut registry = ComponentRegistry::new();
        let position = registry.register::<Position>("Position").unwrap();
        let velocity = registry.register::<Velocity>("Velocity").unwrap();
        (ArchetypeManager::new(), position, velocity)
    }

    #[test]
    fn test_add_component_transition() {
        let (mut manager, position, velocity) = fixtures();

        let e0 = manager.create_entity(ComponentSet::new(vec![position.clone()]));
        manager.set_component(
            e0,
            &position,
            bytemuck::bytes_of(&Position { x: 1.0, y: 2.0 }),
        );

        let moved = manager.add_component(e0, velocity.clone());
        assert_ne!(moved.archetype, e0.archetype);
        assert_eq!(
            manager.get_component(moved, &position),
            bytemuck::bytes_of(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(
            manager.get_component(moved, &velocity),
            bytemuck::bytes_of(&Velocity::default())
        );
        assert_eq!(manager.archetype(e0.archetype).read().len(), 0);

        // Both edge directions are wired once the pair of archetypes exists.
        assert_eq!(
            manager
                .archetype(e0.archetype)
                .read()
                .add_edge(velocity.id()),
            Some(moved.archetype)
        );
        assert_eq!(
            manager
                .archetype(moved.archetype)
                .read()
                .remove_edge(velocity.id()),
            Some(e0.archetype)
        );

        // Going back drops the added column and follows the cached edge.
        let back = manager.remove_component(moved, velocity.id());
        assert_eq!(back.archetype, e0.archetype);
        assert_eq!(
            manager.get_component(back, &position),
            bytemuck::bytes_of(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(manager.archetype_count(), 2);
    }

    #[test]
    fn test_make_archetype_is_idempotent() {
        let (mut manager, position, velocity) = fixtures();
        let a = manager.make_archetype(ComponentSet::new(vec![position.clone()]));
        let b = manager.make_archetype(ComponentSet::new(vec![position.clone()]));
        assert_eq!(a, b);
        assert_eq!(
            manager.get_archetype(&ComponentSet::new(vec![position.clone()])),
            Some(a)
        );
        assert_eq!(
            manager.get_archetype(&ComponentSet::new(vec![velocity])),
            None
        );
        assert_eq!(manager.archetype_count(), 1);
    }

    #[test]
    fn test_query_ids_stable_and_live() {
        let (mut manager, position, velocity) = fixtures();
        manager.create_entity(ComponentSet::new(vec![position.clone()]));

        let id = manager.get_for_each_id(&[position.clone()], &[]);
        // Equal filter pairs share one id, whatever order they arrive in.
        assert_eq!(manager.get_for_each_id(&[position.clone()], &[]), id);

        let mut visited = 0;
        manager.const_for_each(id, |_| visited += 1);
        assert_eq!(visited, 1);

        // An archetype created after the query still feeds it.
        manager.create_entity(ComponentSet::new(vec![position.clone(), velocity.clone()]));
        let mut visited = 0;
        manager.const_for_each(id, |_| visited += 1);
        assert_eq!(visited, 2);

        // The excluded filter keeps the two-component archetype out.
        let without_velocity = manager.get_for_each_id(&[position.clone()], &[velocity.clone()]);
        let mut visited = 0;
        manager.const_for_each(without_velocity, |_| visited += 1);
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_for_each_mutates_in_query_order() {
        let (mut manager, position, velocity) = fixtures();
        for _ in 0..10 {
            manager.create_entity(ComponentSet::new(vec![position.clone(), velocity.clone()]));
        }
        let moving = manager.create_entity(ComponentSet::new(vec![position.clone(), velocity.clone()]));
        manager.set_component(
            moving,
            &velocity,
            bytemuck::bytes_of(&Velocity { x: 1.0, y: -1.0 }),
        );

        // Pointer order matches the requested order, not the physical one.
        let id = manager.get_for_each_id(&[velocity.clone(), position.clone()], &[]);
        manager.for_each(id, |ptrs| unsafe {
            let velocity = &*(ptrs[0] as *const Velocity);
            let position = &mut *(ptrs[1] as *mut Position);
            position.x += velocity.x;
            position.y += velocity.y;
        });

        assert_eq!(
            manager.get_component(moving, &position),
            bytemuck::bytes_of(&Position { x: 1.0, y: -1.0 })
        );
        assert_eq!(
            manager.get_component(EntityRef { row: 0, ..moving }, &position),
            bytemuck::bytes_of(&Position::default())
        );
    }

    #[test]
    fn test_parallel_visits_every_entity_once() {
        let (mut manager, position, velocity) = fixtures();
        for _ in 0..500 {
            manager.create_entity(ComponentSet::new(vec![position.clone()]));
        }
        for _ in 0..500 {
            manager.create_entity(ComponentSet::new(vec![position.clone(), velocity.clone()]));
        }

        let id = manager.get_for_each_id(&[position.clone()], &[]);
        let visits = Arc::new(AtomicUsize::new(0));
        let counter = visits.clone();
        manager
            .for_each_parallel(id, 64, move |ptrs| {
                counter.fetch_add(1, Ordering::Relaxed);
                unsafe { (*(ptrs[0] as *mut Position)).x += 1.0 };
            })
            .wait();
        assert_eq!(visits.load(Ordering::Relaxed), 1000);

        // Exactly-once also shows up in the data: every row was bumped once.
        let check = manager.get_for_each_id(&[position.clone()], &[]);
        let sum = Arc::new(AtomicUsize::new(0));
        let adder = sum.clone();
        manager
            .const_for_each_parallel(check, 64, move |ptrs| {
                let position = unsafe { &*(ptrs[0] as *const Position) };
                adder.fetch_add(position.x as usize, Ordering::Relaxed);
            })
            .wait();
        assert_eq!(sum.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_overlapping_parallel_batches_complete() {
        let mut registry = ComponentRegistry::new();
        let position = registry.register::<Position>("Position").unwrap();
        // A small pool makes the batches fight over the same workers.
        let mut manager = ArchetypeManager::with_thread_count(2);
        for _ in 0..100 {
            manager.create_entity(ComponentSet::new(vec![position.clone()]));
        }
        let id = manager.get_for_each_id(&[position.clone()], &[]);

        // Submit a second batch over the same archetype while the first is
        // still running; slow callbacks keep the first batch's sub-ranges
        // in flight across the second submission.
        let first_visits = Arc::new(AtomicUsize::new(0));
        let counter = first_visits.clone();
        let first = manager.for_each_parallel(id, 50, move |_| {
            std::thread::sleep(std::time::Duration::from_millis(1));
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let second_visits = Arc::new(AtomicUsize::new(0));
        let counter = second_visits.clone();
        let second = manager.for_each_parallel(id, 50, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        first.wait();
        second.wait();
        assert_eq!(first_visits.load(Ordering::Relaxed), 100);
        assert_eq!(second_visits.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_parallel_with_no_matches_completes() {
        let (mut manager, position, _) = fixtures();
        let id = manager.get_for_each_id(&[position.clone()], &[]);
        manager.for_each_parallel(id, 16, |_| {}).wait();
    }

    #[test]
    #[should_panic(expected = "callback failure")]
    fn test_parallel_panic_reaches_the_caller() {
        let (mut manager, position, _) = fixtures();
        for _ in 0..10 {
            manager.create_entity(ComponentSet::new(vec![position.clone()]));
        }
        let id = manager.get_for_each_id(&[position.clone()], &[]);
        manager
            .for_each_parallel(id, 4, |_| panic!("callback failure"))
            .wait();
    }

    #[test]
    fn test_clear_returns_chunks_to_the_pool() {
        let (mut manager, position, _) = fixtures();
        for _ in 0..10 {
            manager.create_entity(ComponentSet::new(vec![position.clone()]));
        }
        assert_eq!(manager.pool().allocated(), 1);
        assert_eq!(manager.pool().available(), 0);

        manager.clear();
        assert_eq!(manager.archetype_count(), 0);
        assert_eq!(manager.pool().available(), 1);

        // A rebuilt archetype reuses the pooled chunk.
        manager.create_entity(ComponentSet::new(vec![position.clone()]));
        assert_eq!(manager.pool().allocated(), 1);
    }

    #[test]
    #[should_panic(expected = "invalidated by clear")]
    fn test_stale_query_id_panics() {
        let (mut manager, position, _) = fixtures();
        let id = manager.get_for_each_id(&[position.clone()], &[]);
        manager.clear();
        manager.const_for_each(id, |_| {});
    }

    #[test]
    #[should_panic(expected = "at least one component")]
    fn test_empty_query_rejected() {
        let (mut manager, _, _) = fixtures();
        manager.get_for_each_id(&[], &[]);
    }

    #[test]
    fn test_destroy_entity_swap_remove() {
        let (mut manager, position, _) = fixtures();
        let set = ComponentSet::new(vec![position.clone()]);
        let a = manager.create_entity(set.clone());
        let _b = manager.create_entity(set.clone());
        let c = manager.create_entity(set);
        manager.set_component(c, &position, bytemuck::bytes_of(&Position { x: 3.0, y: 0.0 }));

        manager.destroy_entity(a);
        // The last entity was swapped into the destroyed slot.
        assert_eq!(manager.archetype(a.archetype).read().len(), 2);
        assert_eq!(
            manager.get_component(EntityRef { row: 0, ..a }, &position),
            bytemuck::bytes_of(&Position { x: 3.0, y: 0.0 })
        );
    }
}
