use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use archetypal::{ArchetypeManager, ComponentRegistry, ComponentSet};

#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Position(f32, f32);

#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Velocity(f32, f32);

#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Flagged(u32);

fn main() {
    env_logger::init();

    let mut registry = ComponentRegistry::new();
    let position = registry.register::<Position>("Position").unwrap();
    let velocity = registry.register::<Velocity>("Velocity").unwrap();
    let flagged = registry.register::<Flagged>("Flagged").unwrap();

    let mut manager = ArchetypeManager::new();
    let moving = ComponentSet::new(vec![position.clone(), velocity.clone()]);

    for round in 0..8 {
        let mut to_flag = Vec::new();
        for idx in 0..512 {
            let entity = manager.create_entity(moving.clone());
            manager.set_component(
                entity,
                &velocity,
                bytemuck::bytes_of(&Velocity(idx as f32, round as f32)),
            );
            if idx % 12 == 11 {
                to_flag.push(entity);
            }
        }

        // Transitions churn the chunk pool while the main population stays
        // put. Flag from the back so earlier swap-removes cannot move rows
        // we still hold references to.
        to_flag.reverse();
        for entity in to_flag {
            manager.add_component(entity, flagged.clone());
        }
    }

    let step = manager.get_for_each_id(&[position.clone(), velocity.clone()], &[]);
    let visited = Arc::new(AtomicUsize::new(0));
    let counter = visited.clone();
    manager
        .for_each_parallel(step, 128, move |ptrs| {
            let position = unsafe { &mut *(ptrs[0] as *mut Position) };
            let velocity = unsafe { &*(ptrs[1] as *const Velocity) };
            position.0 += velocity.0;
            position.1 += velocity.1;
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .wait();

    println!(
        "stepped {} entities across {} archetypes using {} chunks",
        visited.load(Ordering::Relaxed),
        manager.archetype_count(),
        manager.pool().allocated()
    );
}
