//! Component schema descriptors and their registry.
//!
//! All storage in this crate is raw bytes laid out according to registered
//! component schemas. A schema is registered once, before any archetype
//! refers to it, and is immutable afterwards. There are no global id
//! counters: every engine instance owns a [`ComponentRegistry`], created in
//! its initialisation scope and passed by reference to registration calls.

use std::alloc::Layout;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytemuck::Pod;
use thiserror::Error;

use crate::chunk::CHUNK_ALIGN;

/// A component type ID which is unique within one `ComponentRegistry`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeID(usize);

impl ComponentTypeID {
    /// Return the inner unique ID.
    pub fn id(&self) -> usize {
        self.0
    }
}

impl Debug for ComponentTypeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeID({})", self.0)
    }
}

/// Errors raised while registering component schemas.
///
/// Registration happens at startup, outside the runtime data path, so every
/// variant is a fail-fast condition.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component name {0:?} is already registered")]
    DuplicateName(String),
    #[error("component type {0} is already registered")]
    DuplicateType(&'static str),
    #[error("component {0:?} has zero size")]
    ZeroSize(String),
    #[error("component {name:?} alignment {align} is unsupported (must be a power of two no larger than the chunk alignment)")]
    BadAlign { name: String, align: usize },
    #[error("component {name:?} size {size} is not a multiple of its alignment {align}")]
    BadStride {
        name: String,
        size: usize,
        align: usize,
    },
}

/// Per-schema serialization dispatch table supplied at registration.
///
/// The storage core never invokes these; they ride along on the descriptor
/// so surrounding asset layers can serialize component bytes without knowing
/// the concrete type.
#[derive(Clone, Copy)]
pub struct SerializeHooks {
    pub serialize: fn(&[u8], &mut Vec<u8>),
    pub deserialize: fn(&mut [u8], &[u8]),
}

/// A schema described at runtime, for components with no compile-time type.
///
/// Cells of a raw schema default to all zeroes.
pub struct ComponentDef {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub hooks: Option<SerializeHooks>,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>, size: usize, align: usize) -> ComponentDef {
        ComponentDef {
            name: name.into(),
            size,
            align,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: SerializeHooks) -> ComponentDef {
        self.hooks = Some(hooks);
        self
    }
}

/// An immutable, registered component schema.
///
/// Shared as `Arc<ComponentInfo>`; the `Arc` is the descriptor reference
/// that [`crate::ComponentSet`]s and archetypes hold.
pub struct ComponentInfo {
    id: ComponentTypeID,
    name: String,
    layout: Layout,
    set_default: fn(&mut [u8]),
    hooks: Option<SerializeHooks>,
}

impl ComponentInfo {
    /// Return the unique type ID of this schema.
    pub fn id(&self) -> ComponentTypeID {
        self.id
    }

    /// Return the caller-supplied name of this schema.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the memory layout of a single instance.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Return the byte size of a single instance.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Return the serialization hooks supplied at registration, if any.
    pub fn hooks(&self) -> Option<&SerializeHooks> {
        self.hooks.as_ref()
    }

    /// Write this schema's default value into a freshly created cell.
    pub fn set_default(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.layout.size());
        (self.set_default)(dst)
    }
}

impl PartialEq for ComponentInfo {
    fn eq(&self, other: &ComponentInfo) -> bool {
        self.id == other.id
    }
}

impl Eq for ComponentInfo {}

impl Debug for ComponentInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<ComponentInfo {} #{}>", self.name, self.id.id())
    }
}

/// Marker for Rust types that can be stored directly as component bytes.
///
/// `Pod` guarantees the bytes can be copied freely between chunks; `Default`
/// provides the value new rows start from.
pub trait Component: Pod + Default + Send + Sync + 'static {}

impl<T: Pod + Default + Send + Sync + 'static> Component for T {}

fn write_default<T: Component>(dst: &mut [u8]) {
    dst.copy_from_slice(bytemuck::bytes_of(&T::default()));
}

fn write_zeroes(dst: &mut [u8]) {
    dst.fill(0);
}

/// Owns every registered schema for one engine instance.
///
/// Dropping the registry frees all schema records; pair it with
/// [`crate::ArchetypeManager::clear`] when tearing an engine down.
#[derive(Default)]
pub struct ComponentRegistry {
    infos: Vec<Arc<ComponentInfo>>,
    by_name: HashMap<String, ComponentTypeID>,
    by_type: HashMap<TypeId, ComponentTypeID>,
}

impl ComponentRegistry {
    pub fn new() -> ComponentRegistry {
        ComponentRegistry::default()
    }

    /// Register a component backed by a Rust type.
    pub fn register<T: Component>(
        &mut self,
        name: &str,
    ) -> Result<Arc<ComponentInfo>, RegistryError> {
        self.register_typed::<T>(name, None)
    }

    /// Register a component backed by a Rust type, with serialization hooks.
    pub fn register_with_hooks<T: Component>(
        &mut self,
        name: &str,
        hooks: SerializeHooks,
    ) -> Result<Arc<ComponentInfo>, RegistryError> {
        self.register_typed::<T>(name, Some(hooks))
    }

    /// Register a schema only known at runtime. New cells start zeroed.
    pub fn register_raw(
        &mut self,
        def: ComponentDef,
    ) -> Result<Arc<ComponentInfo>, RegistryError> {
        let layout = Layout::from_size_align(def.size, def.align).map_err(|_| {
            RegistryError::BadAlign {
                name: def.name.clone(),
                align: def.align,
            }
        })?;
        self.insert(&def.name, layout, write_zeroes, def.hooks)
    }

    /// Fetch a registered schema by ID.
    pub fn get(&self, id: ComponentTypeID) -> Option<&Arc<ComponentInfo>> {
        self.infos.get(id.0)
    }

    /// Fetch a registered schema by name.
    pub fn get_by_name(&self, name: &str) -> Option<&Arc<ComponentInfo>> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    /// Return the number of registered schemas.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    fn register_typed<T: Component>(
        &mut self,
        name: &str,
        hooks: Option<SerializeHooks>,
    ) -> Result<Arc<ComponentInfo>, RegistryError> {
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(RegistryError::DuplicateType(type_name::<T>()));
        }
        let info = self.insert(name, Layout::new::<T>(), write_default::<T>, hooks)?;
        self.by_type.insert(TypeId::of::<T>(), info.id());
        Ok(info)
    }

    fn insert(
        &mut self,
        name: &str,
        layout: Layout,
        set_default: fn(&mut [u8]),
        hooks: Option<SerializeHooks>,
    ) -> Result<Arc<ComponentInfo>, RegistryError> {
        if layout.size() == 0 {
            return Err(RegistryError::ZeroSize(name.to_string()));
        }
        if layout.align() > CHUNK_ALIGN {
            return Err(RegistryError::BadAlign {
                name: name.to_string(),
                align: layout.align(),
            });
        }
        if layout.size() % layout.align() != 0 {
            return Err(RegistryError::BadStride {
                name: name.to_string(),
                size: layout.size(),
                align: layout.align(),
            });
        }
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let id = ComponentTypeID(self.infos.len());
        let info = Arc::new(ComponentInfo {
            id,
            name: name.to_string(),
            layout,
            set_default,
            hooks,
        });
        self.by_name.insert(name.to_string(), id);
        self.infos.push(info.clone());
        log::debug!("registered component {:?} ({} bytes)", name, layout.size());
        Ok(info)
    }
}
