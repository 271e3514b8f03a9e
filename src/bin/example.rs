use archetypal::{ArchetypeManager, ComponentRegistry, ComponentSet};

#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Position(f32, f32);

#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Velocity(f32, f32);

fn main() {
    env_logger::init();

    let mut registry = ComponentRegistry::new();
    let position = registry.register::<Position>("Position").unwrap();
    let velocity = registry.register::<Velocity>("Velocity").unwrap();

    let mut manager = ArchetypeManager::new();
    let entity = manager.create_entity(ComponentSet::new(vec![position.clone()]));
    manager.set_component(entity, &position, bytemuck::bytes_of(&Position(1.0, 2.0)));
    println!("entity: {:?}", entity);

    let entity = manager.add_component(entity, velocity.clone());
    manager.set_component(entity, &velocity, bytemuck::bytes_of(&Velocity(0.5, -0.5)));
    println!("after adding Velocity: {:?}", entity);

    let step = manager.get_for_each_id(&[position.clone(), velocity.clone()], &[]);
    manager.for_each(step, |ptrs| unsafe {
        let position = &mut *(ptrs[0] as *mut Position);
        let velocity = &*(ptrs[1] as *const Velocity);
        position.0 += velocity.0;
        position.1 += velocity.1;
    });

    let bytes = manager.get_component(entity, &position);
    println!("position: {:?}", bytemuck::from_bytes::<Position>(&bytes));
}
