//! Explicit descriptors for native types that marshal as plain maps.
//!
//! A ClassDescriptor lists the fields of a type with a getter and a setter
//! each. Descriptors are registered once, up front, in the process-wide
//! MarshallableRegistry and looked up by type or by class name.
use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{Arc, OnceLock},
};

use parking_lot::RwLock;

use crate::{
    BridgeError, BridgeResult, Index, InternedString, Marshaller, StringValue,
    TaggedValue, ValueKind, intern, new_value_map,
};

/// The scalar shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Void,
    Ptr,
    Object,
    Double,
    Bool,
    Int,
    Long,
    String,
}

impl FieldKind {
    pub fn value_kind(self) -> ValueKind {
        match self {
            Self::Void => ValueKind::Undefined,
            Self::Ptr => ValueKind::Ptr,
            Self::Object => ValueKind::Object,
            Self::Double => ValueKind::Double,
            Self::Bool => ValueKind::Bool,
            Self::Int => ValueKind::Int,
            Self::Long => ValueKind::Long,
            Self::String => ValueKind::String,
        }
    }
}

impl TaggedValue {
    /// The field kind this value can fill. None for composites, functions,
    /// promises, bytes and errors.
    pub fn field_kind(&self) -> Option<FieldKind> {
        match self {
            Self::Undefined | Self::Null => Some(FieldKind::Void),
            Self::Ptr(_) => Some(FieldKind::Ptr),
            Self::Object(_) | Self::Reference(_) => Some(FieldKind::Object),
            Self::Double(_) => Some(FieldKind::Double),
            Self::Bool(_) => Some(FieldKind::Bool),
            Self::Int(_) => Some(FieldKind::Int),
            Self::Long(_) => Some(FieldKind::Long),
            Self::String(_) => Some(FieldKind::String),
            _ => None,
        }
    }
}

type Getter = Box<dyn Fn(&dyn Any) -> BridgeResult<TaggedValue> + Send + Sync>;
type Setter = Box<dyn Fn(&mut dyn Any, TaggedValue) -> BridgeResult<()> + Send + Sync>;
type Constructor = Box<dyn Fn() -> Box<dyn Any> + Send + Sync>;

pub struct FieldDescriptor {
    pub name: InternedString,
    pub kind: FieldKind,
    /// Optional fields may be absent, null or undefined.
    pub optional: bool,
    getter: Getter,
    setter: Setter,
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("optional", &self.optional)
            .finish()
    }
}

pub struct ClassDescriptor {
    class_name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    fields: Vec<FieldDescriptor>,
    constructor: Constructor,
}

pub struct ClassDescriptorBuilder<T> {
    class_name: &'static str,
    fields: Vec<FieldDescriptor>,
    _type: PhantomData<fn() -> T>,
}

fn wrong_type<T>() -> BridgeError {
    BridgeError::UnregisteredType {
        type_name: type_name::<T>(),
    }
}

impl<T: Any + Default> ClassDescriptorBuilder<T> {
    fn add(
        mut self,
        name: &str,
        kind: FieldKind,
        optional: bool,
        get: impl Fn(&T) -> TaggedValue + Send + Sync + 'static,
        set: impl Fn(&mut T, TaggedValue) -> BridgeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            name: intern(name),
            kind,
            optional,
            getter: Box::new(move |object: &dyn Any| {
                object
                    .downcast_ref::<T>()
                    .map(&get)
                    .ok_or_else(wrong_type::<T>)
            }),
            setter: Box::new(move |object: &mut dyn Any, value: TaggedValue| {
                let object = object.downcast_mut::<T>().ok_or_else(wrong_type::<T>)?;
                set(object, value)
            }),
        });
        self
    }

    pub fn field(
        self,
        name: &str,
        kind: FieldKind,
        get: impl Fn(&T) -> TaggedValue + Send + Sync + 'static,
        set: impl Fn(&mut T, TaggedValue) -> BridgeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.add(name, kind, false, get, set)
    }

    /// A field that may be missing. The setter is not called when it is.
    pub fn optional_field(
        self,
        name: &str,
        kind: FieldKind,
        get: impl Fn(&T) -> TaggedValue + Send + Sync + 'static,
        set: impl Fn(&mut T, TaggedValue) -> BridgeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.add(name, kind, true, get, set)
    }

    pub fn build(self) -> ClassDescriptor {
        ClassDescriptor {
            class_name: self.class_name,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            fields: self.fields,
            constructor: Box::new(|| Box::new(T::default()) as Box<dyn Any>),
        }
    }
}

impl ClassDescriptor {
    pub fn builder<T: Any + Default>(class_name: &'static str) -> ClassDescriptorBuilder<T> {
        ClassDescriptorBuilder {
            class_name,
            fields: Vec::new(),
            _type: PhantomData,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Converts `object` into a map keyed by the interned field names.
    pub fn to_value(&self, object: &dyn Any) -> BridgeResult<TaggedValue> {
        let mut map = new_value_map(self.fields.len());
        for field in &self.fields {
            let value = (field.getter)(object)?;
            if field.optional && value.is_null_or_undefined() {
                continue;
            }
            map.insert(field.name.clone().into(), value);
        }
        Ok(TaggedValue::make_map(map))
    }

    /// Builds an instance from a map, checking the kind of every field and
    /// the presence of the required ones.
    pub fn from_value(&self, value: &TaggedValue) -> BridgeResult<Box<dyn Any>> {
        let map = value.get_map()?;
        let mut object = (self.constructor)();
        for field in &self.fields {
            let key = StringValue::from(field.name.clone());
            let value = match map.get(&key) {
                Some(value) if !value.is_null_or_undefined() => value,
                _ if field.optional => continue,
                _ => {
                    return Err(BridgeError::MissingProperty {
                        key: field.name.to_string(),
                    });
                }
            };
            if value.field_kind() != Some(field.kind) {
                return Err(value.mismatch(field.kind.value_kind()));
            }
            (field.setter)(object.as_mut(), value.clone())?;
        }
        Ok(object)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("class_name", &self.class_name)
            .field("type_name", &self.type_name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Default)]
struct MarshallableRegistryImpl {
    by_type: HashMap<TypeId, Arc<ClassDescriptor>>,
    by_name: HashMap<&'static str, Arc<ClassDescriptor>>,
}

#[derive(Default)]
pub struct MarshallableRegistry(RwLock<MarshallableRegistryImpl>);

static MARSHALLABLE_REGISTRY: OnceLock<MarshallableRegistry> = OnceLock::new();

pub fn marshallable_registry() -> &'static MarshallableRegistry {
    MARSHALLABLE_REGISTRY.get_or_init(MarshallableRegistry::default)
}

impl MarshallableRegistry {
    /// Registers `descriptor`, replacing any previous descriptor for the
    /// same type.
    pub fn register(&self, descriptor: ClassDescriptor) -> Arc<ClassDescriptor> {
        let descriptor = Arc::new(descriptor);
        let mut registry = self.0.write();
        if let Some(previous) = registry
            .by_type
            .insert(descriptor.type_id, Arc::clone(&descriptor))
        {
            log::warn!(
                "re-registering {} as {}",
                previous.type_name,
                descriptor.class_name
            );
            registry.by_name.remove(previous.class_name);
        }
        registry
            .by_name
            .insert(descriptor.class_name, Arc::clone(&descriptor));
        descriptor
    }

    pub fn descriptor_of<T: Any>(&self) -> BridgeResult<Arc<ClassDescriptor>> {
        self.0
            .read()
            .by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(wrong_type::<T>)
    }

    pub fn descriptor_named(&self, class_name: &str) -> Option<Arc<ClassDescriptor>> {
        self.0.read().by_name.get(class_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Marshaller {
    /// Pushes `value` as a map, using the descriptor registered for `T`.
    pub fn push_marshallable<T: Any>(&mut self, value: &T) -> BridgeResult<Index> {
        let descriptor = marshallable_registry().descriptor_of::<T>()?;
        let value = descriptor.to_value(value)?;
        Ok(self.push(value))
    }

    pub fn get_marshallable<T: Any>(&self, index: Index) -> BridgeResult<T> {
        let descriptor = marshallable_registry().descriptor_of::<T>()?;
        let object = descriptor.from_value(self.get(index)?)?;
        object
            .downcast::<T>()
            .map(|object| *object)
            .map_err(|_| wrong_type::<T>())
    }
}
