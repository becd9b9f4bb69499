//! TaggedValue: every value that can cross the boundary.
//!
//! ValueKind: the tag of a TaggedValue, used for type predicates and
//! mismatch reporting.
//!
//! ObjectRef: a native object held either retained (keeps the object alive)
//! or unretained (observes it without affecting its lifetime).
use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    BridgeError, BridgeResult, ExportedRef, InternedString, MarshallingError,
    Promise, Strong, ValueFunction, Weak, intern, interning::content_hash,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Bool,
    Int,
    Long,
    Double,
    String,
    Bytes,
    Ptr,
    Object,
    Reference,
    Function,
    Promise,
    Map,
    Array,
    Error,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Ptr => "ptr",
            Self::Object => "object",
            Self::Reference => "reference",
            Self::Function => "function",
            Self::Promise => "promise",
            Self::Map => "map",
            Self::Array => "array",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A string payload, either interned (map keys, identifiers) or owned.
#[derive(Clone)]
pub enum StringValue {
    Interned(InternedString),
    Owned(Arc<str>),
}

impl StringValue {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Interned(interned) => interned.as_str(),
            Self::Owned(owned) => owned,
        }
    }

    pub fn is_interned(&self) -> bool {
        matches!(self, Self::Interned(_))
    }

    /// Returns the interned form, interning the content if needed.
    pub fn to_interned(&self) -> InternedString {
        match self {
            Self::Interned(interned) => interned.clone(),
            Self::Owned(owned) => intern(owned),
        }
    }
}

// Interned and owned keys with the same content are the same key. Both
// hash to the content hash, which interned keys carry precomputed. Two
// interned handles compare by pointer.
impl PartialEq for StringValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Interned(a), Self::Interned(b)) => a == b,
            _ => self.as_str() == other.as_str(),
        }
    }
}

impl Eq for StringValue {}

impl Hash for StringValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let hash = match self {
            Self::Interned(interned) => interned.precomputed_hash(),
            Self::Owned(owned) => content_hash(owned),
        };
        state.write_u64(hash);
    }
}

impl fmt::Debug for StringValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl From<InternedString> for StringValue {
    fn from(value: InternedString) -> Self {
        Self::Interned(value)
    }
}

impl From<&str> for StringValue {
    fn from(value: &str) -> Self {
        Self::Owned(Arc::from(value))
    }
}

impl From<String> for StringValue {
    fn from(value: String) -> Self {
        Self::Owned(Arc::from(value))
    }
}

/// An opaque pointer carried across the boundary without interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaquePtr(usize);

impl OpaquePtr {
    pub const NULL: Self = Self(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone)]
pub enum ObjectRef {
    Retained(Strong),
    Unretained(Weak),
}

impl ObjectRef {
    pub fn is_retained(&self) -> bool {
        matches!(self, Self::Retained(_))
    }

    /// The object, or None if it was unretained and has been deallocated.
    pub fn load(&self) -> Option<Strong> {
        match self {
            Self::Retained(strong) => Some(strong.clone()),
            Self::Unretained(weak) => weak.upgrade(),
        }
    }

    pub fn addr(&self) -> usize {
        match self {
            Self::Retained(strong) => Strong::addr(strong),
            Self::Unretained(weak) => weak.addr(),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retained(strong) => write!(f, "Retained({strong:?})"),
            Self::Unretained(weak) => write!(f, "Unretained({weak:?})"),
        }
    }
}

pub type ValueMap = HashMap<StringValue, TaggedValue, ahash::RandomState>;

pub fn new_value_map(capacity: usize) -> ValueMap {
    HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::new())
}

/// A dynamically typed boundary value.
///
/// Cloning a retained object (or an exported reference) retains it and
/// dropping releases it; moving transfers ownership untouched.
#[derive(Clone, Default)]
pub enum TaggedValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(StringValue),
    Bytes(Arc<[u8]>),
    Ptr(OpaquePtr),
    Object(ObjectRef),
    Reference(ExportedRef),
    Function(Arc<dyn ValueFunction>),
    Promise(Arc<Promise>),
    Map(Arc<ValueMap>),
    Array(Arc<Vec<TaggedValue>>),
    Error(MarshallingError),
}

pub(crate) static UNDEFINED: TaggedValue = TaggedValue::Undefined;

macro_rules! accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> BridgeResult<$ty> {
            match self {
                Self::$variant(value) => Ok(value.clone()),
                other => Err(other.mismatch(ValueKind::$variant)),
            }
        }
    };
}

impl TaggedValue {
    pub fn make_null() -> Self {
        Self::Null
    }

    pub fn make_undefined() -> Self {
        Self::Undefined
    }

    pub fn make_bool(value: bool) -> Self {
        Self::Bool(value)
    }

    pub fn make_int(value: i32) -> Self {
        Self::Int(value)
    }

    pub fn make_long(value: i64) -> Self {
        Self::Long(value)
    }

    pub fn make_double(value: f64) -> Self {
        Self::Double(value)
    }

    pub fn make_string(value: impl Into<StringValue>) -> Self {
        Self::String(value.into())
    }

    pub fn make_bytes(value: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes(value.into())
    }

    pub fn make_ptr(value: OpaquePtr) -> Self {
        Self::Ptr(value)
    }

    /// Retains `object` for as long as the value lives.
    pub fn make_object(object: Strong) -> Self {
        Self::Object(ObjectRef::Retained(object))
    }

    /// References `object` without affecting its retain count.
    pub fn make_unretained_object(object: &Strong) -> Self {
        Self::Object(ObjectRef::Unretained(Strong::downgrade(object)))
    }

    pub fn make_function(function: Arc<dyn ValueFunction>) -> Self {
        Self::Function(function)
    }

    pub fn make_promise(promise: Arc<Promise>) -> Self {
        Self::Promise(promise)
    }

    pub fn make_map(map: ValueMap) -> Self {
        Self::Map(Arc::new(map))
    }

    pub fn make_array(items: Vec<TaggedValue>) -> Self {
        Self::Array(Arc::new(items))
    }

    pub fn make_error(error: MarshallingError) -> Self {
        Self::Error(error)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Undefined => ValueKind::Undefined,
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Double(_) => ValueKind::Double,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Ptr(_) => ValueKind::Ptr,
            Self::Object(_) => ValueKind::Object,
            Self::Reference(_) => ValueKind::Reference,
            Self::Function(_) => ValueKind::Function,
            Self::Promise(_) => ValueKind::Promise,
            Self::Map(_) => ValueKind::Map,
            Self::Array(_) => ValueKind::Array,
            Self::Error(_) => ValueKind::Error,
        }
    }

    pub(crate) fn mismatch(&self, expected: ValueKind) -> BridgeError {
        BridgeError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_null_or_undefined(&self) -> bool {
        self.is_void()
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Self::Ptr(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Self::Double(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    accessor!(get_bool, Bool, bool);
    accessor!(get_int, Int, i32);
    accessor!(get_long, Long, i64);
    accessor!(get_double, Double, f64);
    accessor!(get_ptr, Ptr, OpaquePtr);
    accessor!(get_bytes, Bytes, Arc<[u8]>);
    accessor!(get_function, Function, Arc<dyn ValueFunction>);
    accessor!(get_promise, Promise, Arc<Promise>);
    accessor!(get_error, Error, MarshallingError);
    accessor!(get_reference, Reference, ExportedRef);

    pub fn get_string(&self) -> BridgeResult<&StringValue> {
        match self {
            Self::String(value) => Ok(value),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    pub fn get_str(&self) -> BridgeResult<&str> {
        self.get_string().map(StringValue::as_str)
    }

    /// The referenced object. `Ok(None)` when the value was unretained and
    /// the object has been deallocated since.
    pub fn get_object(&self) -> BridgeResult<Option<Strong>> {
        match self {
            Self::Object(object) => Ok(object.load()),
            other => Err(other.mismatch(ValueKind::Object)),
        }
    }

    pub fn get_map(&self) -> BridgeResult<&ValueMap> {
        match self {
            Self::Map(map) => Ok(map),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    pub fn get_array(&self) -> BridgeResult<&[TaggedValue]> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    pub(crate) fn get_map_mut(&mut self) -> BridgeResult<&mut ValueMap> {
        match self {
            Self::Map(map) => Ok(Arc::make_mut(map)),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    pub(crate) fn get_array_mut(&mut self) -> BridgeResult<&mut Vec<TaggedValue>> {
        match self {
            Self::Array(items) => Ok(Arc::make_mut(items)),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }
}

impl PartialEq for TaggedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => {
                true
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Ptr(a), Self::Ptr(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.addr() == b.addr(),
            (Self::Reference(a), Self::Reference(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Self::Promise(a), Self::Promise(b)) => Arc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Array(a), Self::Array(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => write!(f, "Object({object:?})"),
            Self::Reference(reference) => write!(f, "Reference({reference:?})"),
            Self::Error(error) => write!(f, "Error({error:?})"),
            other => write!(f, "{other}"),
        }
    }
}

impl From<bool> for TaggedValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for TaggedValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for TaggedValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for TaggedValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for TaggedValue {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<InternedString> for TaggedValue {
    fn from(value: InternedString) -> Self {
        Self::String(value.into())
    }
}

impl From<MarshallingError> for TaggedValue {
    fn from(value: MarshallingError) -> Self {
        Self::Error(value)
    }
}
