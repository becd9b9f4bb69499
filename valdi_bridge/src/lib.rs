mod dispatch;
mod error;
mod format;
mod function;
mod interning;
mod marshaller;
mod object;
mod promise;
mod reference_table;
mod schema;
mod tagged;

pub use dispatch::*;
pub use error::*;
pub use format::pretty_print;
pub use function::*;
pub use interning::*;
pub use marshaller::*;
pub use object::*;
pub use promise::*;
pub use reference_table::*;
pub use schema::*;
pub use tagged::{
    ObjectRef, OpaquePtr, StringValue, TaggedValue, ValueKind, ValueMap,
    new_value_map,
};
