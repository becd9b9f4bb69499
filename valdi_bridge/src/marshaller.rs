//! Marshaller: the value stack both sides use to exchange arguments and
//! results.
//!
//! Indexes are relative to the start of the current frame. Negative indexes
//! count from the top, `-1` being the most recently pushed value. A value's
//! index stays valid until a pop reaches it.
use std::{fmt, sync::Arc};

use crate::{
    BridgeError, BridgeResult, ExportedRef, FunctionFlags, InternedString,
    MarshallerFunction, MarshallingError, OpaquePtr, Promise, SlotId,
    Strength, StringValue, Strong, TaggedValue, ValueFunction, ValueKind,
    check_invocation_mode, new_value_map, tagged::UNDEFINED,
};

pub type Index = isize;

#[derive(Debug, Clone)]
pub struct MarshallerCreateInfo {
    pub initial_capacity: usize,
}

impl Default for MarshallerCreateInfo {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GetMapPropertyFlags: u8 {
        /// Treat a property holding null or undefined as missing.
        const IGNORE_NULL_OR_UNDEFINED = 1 << 0;
        /// Push undefined when the property is missing so that the
        /// property always lands at the top.
        const PUSH_UNDEFINED_ON_MISS = 1 << 1;
    }
}

pub struct Marshaller {
    stack: Vec<TaggedValue>,
    frame_start: usize,
    pending_error: Option<MarshallingError>,
}

/// Runs `f` with a fresh marshaller that is released when `f` returns,
/// whether it succeeded or not.
pub fn with_marshaller<R>(f: impl FnOnce(&mut Marshaller) -> R) -> R {
    let mut marshaller = Marshaller::default();
    f(&mut marshaller)
}

impl Marshaller {
    pub fn new(info: &MarshallerCreateInfo) -> Self {
        log::trace!("creating marshaller");
        Self {
            stack: Vec::with_capacity(info.initial_capacity),
            frame_start: 0,
            pending_error: None,
        }
    }

    pub(crate) fn from_values(values: Vec<TaggedValue>) -> Self {
        log::trace!("creating marshaller with {} values", values.len());
        Self {
            stack: values,
            frame_start: 0,
            pending_error: None,
        }
    }

    /// Number of values in the current frame.
    pub fn size(&self) -> usize {
        self.stack.len() - self.frame_start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The values of the current frame, bottom first.
    pub fn values(&self) -> &[TaggedValue] {
        &self.stack[self.frame_start..]
    }

    fn resolve(&self, index: Index) -> BridgeResult<usize> {
        let size = self.size();
        let relative = if index < 0 {
            size.checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize).filter(|i| *i < size)
        };
        relative
            .map(|i| i + self.frame_start)
            .ok_or(BridgeError::OutOfBounds { index, size })
    }

    fn relative(&self, absolute: usize) -> Index {
        (absolute - self.frame_start) as Index
    }

    pub fn get(&self, index: Index) -> BridgeResult<&TaggedValue> {
        let absolute = self.resolve(index)?;
        Ok(&self.stack[absolute])
    }

    pub fn get_or_undefined(&self, index: Index) -> &TaggedValue {
        self.get(index).unwrap_or(&UNDEFINED)
    }

    /// Pushes `value` and returns its index.
    pub fn push(&mut self, value: TaggedValue) -> Index {
        self.stack.push(value);
        self.relative(self.stack.len() - 1)
    }

    pub fn push_undefined(&mut self) -> Index {
        self.push(TaggedValue::Undefined)
    }

    pub fn push_null(&mut self) -> Index {
        self.push(TaggedValue::Null)
    }

    pub fn push_bool(&mut self, value: bool) -> Index {
        self.push(TaggedValue::Bool(value))
    }

    pub fn push_int(&mut self, value: i32) -> Index {
        self.push(TaggedValue::Int(value))
    }

    pub fn push_long(&mut self, value: i64) -> Index {
        self.push(TaggedValue::Long(value))
    }

    pub fn push_double(&mut self, value: f64) -> Index {
        self.push(TaggedValue::Double(value))
    }

    pub fn push_string(&mut self, value: impl Into<StringValue>) -> Index {
        self.push(TaggedValue::make_string(value))
    }

    pub fn push_bytes(&mut self, value: impl Into<Arc<[u8]>>) -> Index {
        self.push(TaggedValue::make_bytes(value))
    }

    pub fn push_ptr(&mut self, value: OpaquePtr) -> Index {
        self.push(TaggedValue::Ptr(value))
    }

    pub fn push_object(&mut self, object: Strong) -> Index {
        self.push(TaggedValue::make_object(object))
    }

    pub fn push_unretained_object(&mut self, object: &Strong) -> Index {
        self.push(TaggedValue::make_unretained_object(object))
    }

    pub fn push_error(&mut self, error: MarshallingError) -> Index {
        self.push(TaggedValue::Error(error))
    }

    pub fn push_promise(&mut self, promise: Arc<Promise>) -> Index {
        self.push(TaggedValue::Promise(promise))
    }

    pub fn push_function(&mut self, function: Arc<dyn ValueFunction>) -> Index {
        self.push(TaggedValue::Function(function))
    }

    /// Wraps a native callable as a function value. When called, it gets its
    /// arguments in a marshaller of its own and returns whether it pushed a
    /// result.
    pub fn push_native_function<F>(&mut self, name: &'static str, callable: F) -> Index
    where
        F: Fn(&mut Marshaller) -> BridgeResult<bool> + Send + Sync + 'static,
    {
        self.push(MarshallerFunction::new(name, callable).into_value())
    }

    pub fn push_map(&mut self, capacity: usize) -> Index {
        self.push(TaggedValue::make_map(new_value_map(capacity)))
    }

    /// Pushes an array of `length` undefined items, to be filled with
    /// [`Marshaller::set_array_item`].
    pub fn push_array(&mut self, length: usize) -> Index {
        self.push(TaggedValue::make_array(vec![TaggedValue::Undefined; length]))
    }

    /// Stores `object` in the global reference table for `strength` and
    /// pushes the resulting reference.
    pub fn push_exported_object(
        &mut self,
        object: &Strong,
        strength: Strength,
        tag: &'static str,
    ) -> Index {
        self.push(TaggedValue::Reference(ExportedRef::export(object, strength, tag)))
    }

    pub fn pop(&mut self) -> BridgeResult<TaggedValue> {
        if self.is_empty() {
            return Err(BridgeError::FrameUnderflow {
                requested: 1,
                available: 0,
            });
        }
        self.stack.pop().ok_or(BridgeError::FrameUnderflow {
            requested: 1,
            available: 0,
        })
    }

    /// Pops `count` values. Fails without popping anything if the current
    /// frame holds fewer.
    pub fn pop_count(&mut self, count: usize) -> BridgeResult<()> {
        self.pop_values(count).map(drop)
    }

    fn pop_values(&mut self, count: usize) -> BridgeResult<Vec<TaggedValue>> {
        let available = self.size();
        if count > available {
            return Err(BridgeError::FrameUnderflow {
                requested: count,
                available,
            });
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    /// Pops every value of the current frame.
    pub fn clear(&mut self) {
        self.stack.truncate(self.frame_start);
    }

    /// Pushes a copy of the value at `index`.
    pub fn duplicate(&mut self, index: Index) -> BridgeResult<Index> {
        let value = self.get(index)?.clone();
        Ok(self.push(value))
    }

    pub fn swap(&mut self, a: Index, b: Index) -> BridgeResult<()> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;
        self.stack.swap(a, b);
        Ok(())
    }

    /// Replaces the content of the current frame with a single array of
    /// those values.
    pub fn to_array(&mut self) -> Index {
        let items = self.stack.split_off(self.frame_start);
        self.push(TaggedValue::make_array(items))
    }

    pub fn kind(&self, index: Index) -> BridgeResult<ValueKind> {
        self.get(index).map(TaggedValue::kind)
    }

    pub fn get_bool(&self, index: Index) -> BridgeResult<bool> {
        self.get(index)?.get_bool()
    }

    pub fn get_int(&self, index: Index) -> BridgeResult<i32> {
        self.get(index)?.get_int()
    }

    pub fn get_long(&self, index: Index) -> BridgeResult<i64> {
        self.get(index)?.get_long()
    }

    pub fn get_double(&self, index: Index) -> BridgeResult<f64> {
        self.get(index)?.get_double()
    }

    pub fn get_ptr(&self, index: Index) -> BridgeResult<OpaquePtr> {
        self.get(index)?.get_ptr()
    }

    pub fn get_string(&self, index: Index) -> BridgeResult<StringValue> {
        self.get(index)?.get_string().cloned()
    }

    pub fn get_str(&self, index: Index) -> BridgeResult<&str> {
        self.get(index)?.get_str()
    }

    pub fn get_bytes(&self, index: Index) -> BridgeResult<Arc<[u8]>> {
        self.get(index)?.get_bytes()
    }

    /// `Ok(None)` for an unretained object that was deallocated.
    pub fn get_object(&self, index: Index) -> BridgeResult<Option<Strong>> {
        self.get(index)?.get_object()
    }

    pub fn get_function(&self, index: Index) -> BridgeResult<Arc<dyn ValueFunction>> {
        self.get(index)?.get_function()
    }

    pub fn get_promise(&self, index: Index) -> BridgeResult<Arc<Promise>> {
        self.get(index)?.get_promise()
    }

    pub fn get_error(&self, index: Index) -> BridgeResult<MarshallingError> {
        self.get(index)?.get_error()
    }

    pub fn get_exported_id(&self, index: Index) -> BridgeResult<SlotId> {
        match self.get(index)? {
            TaggedValue::Reference(reference) => Ok(reference.id()),
            other => Err(other.mismatch(ValueKind::Reference)),
        }
    }

    /// The object behind an exported reference. `Ok(None)` for a weak
    /// reference whose object is gone.
    pub fn get_exported_object(&self, index: Index) -> BridgeResult<Option<Strong>> {
        match self.get(index)? {
            TaggedValue::Reference(reference) => reference.load(),
            other => Err(other.mismatch(ValueKind::Reference)),
        }
    }

    fn get_optional<T>(
        &self,
        index: Index,
        get: impl FnOnce(&TaggedValue) -> BridgeResult<T>,
    ) -> BridgeResult<Option<T>> {
        let value = self.get_or_undefined(index);
        if value.is_null_or_undefined() {
            Ok(None)
        } else {
            get(value).map(Some)
        }
    }

    pub fn get_optional_bool(&self, index: Index) -> BridgeResult<Option<bool>> {
        self.get_optional(index, TaggedValue::get_bool)
    }

    pub fn get_optional_int(&self, index: Index) -> BridgeResult<Option<i32>> {
        self.get_optional(index, TaggedValue::get_int)
    }

    pub fn get_optional_long(&self, index: Index) -> BridgeResult<Option<i64>> {
        self.get_optional(index, TaggedValue::get_long)
    }

    pub fn get_optional_double(&self, index: Index) -> BridgeResult<Option<f64>> {
        self.get_optional(index, TaggedValue::get_double)
    }

    pub fn get_optional_string(&self, index: Index) -> BridgeResult<Option<StringValue>> {
        self.get_optional(index, |value| value.get_string().cloned())
    }

    pub fn get_optional_object(&self, index: Index) -> BridgeResult<Option<Strong>> {
        self.get_optional(index, TaggedValue::get_object)
            .map(Option::flatten)
    }

    pub fn is_null_or_undefined(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_null_or_undefined()
    }

    pub fn is_bool(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_bool()
    }

    pub fn is_int(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_int()
    }

    pub fn is_long(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_long()
    }

    pub fn is_double(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_double()
    }

    pub fn is_string(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_string()
    }

    pub fn is_ptr(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_ptr()
    }

    pub fn is_object(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_object()
    }

    pub fn is_function(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_function()
    }

    pub fn is_map(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_map()
    }

    pub fn is_array(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_array()
    }

    pub fn is_error(&self, index: Index) -> bool {
        self.get_or_undefined(index).is_error()
    }

    // Takes the value at `index` for storing into `container`. The value is
    // popped when it is the top of the frame and copied otherwise.
    fn take_value(&mut self, index: Index, container: usize) -> BridgeResult<TaggedValue> {
        let absolute = self.resolve(index)?;
        if absolute + 1 == self.stack.len() && absolute != container {
            self.pop()
        } else {
            Ok(self.stack[absolute].clone())
        }
    }

    fn insert_property(
        &mut self,
        map_index: Index,
        key: StringValue,
        value_index: Index,
    ) -> BridgeResult<()> {
        // check the map before the value gets popped
        let map_absolute = self.resolve(map_index)?;
        if !self.stack[map_absolute].is_map() {
            return Err(self.stack[map_absolute].mismatch(ValueKind::Map));
        }
        let value = self.take_value(value_index, map_absolute)?;
        self.stack[map_absolute].get_map_mut()?.insert(key, value);
        Ok(())
    }

    /// Sets `key` on the map at `map_index` to the value at `value_index`.
    /// The value is consumed when it sits at the top of the frame.
    pub fn put_map_property(
        &mut self,
        map_index: Index,
        key: &InternedString,
        value_index: Index,
    ) -> BridgeResult<()> {
        self.insert_property(map_index, key.clone().into(), value_index)
    }

    /// [`Marshaller::put_map_property`] with a key that is not interned.
    pub fn put_map_property_uninterned(
        &mut self,
        map_index: Index,
        key: &str,
        value_index: Index,
    ) -> BridgeResult<()> {
        self.insert_property(map_index, key.into(), value_index)
    }

    /// Pushes the property `key` of the map at `map_index` and returns
    /// whether anything was pushed. With `PUSH_UNDEFINED_ON_MISS` a miss
    /// pushes undefined.
    pub fn get_map_property(
        &mut self,
        map_index: Index,
        key: impl Into<StringValue>,
        flags: GetMapPropertyFlags,
    ) -> BridgeResult<bool> {
        let key = key.into();
        let found = self
            .get(map_index)?
            .get_map()?
            .get(&key)
            .filter(|value| {
                !(flags.contains(GetMapPropertyFlags::IGNORE_NULL_OR_UNDEFINED)
                    && value.is_null_or_undefined())
            })
            .cloned();
        match found {
            Some(value) => {
                self.push(value);
                Ok(true)
            }
            None if flags.contains(GetMapPropertyFlags::PUSH_UNDEFINED_ON_MISS) => {
                self.push_undefined();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pushes the property `key` of the map at `map_index`, failing with
    /// `MissingProperty` when it is absent, null or undefined.
    pub fn must_get_map_property(
        &mut self,
        map_index: Index,
        key: impl Into<StringValue>,
    ) -> BridgeResult<Index> {
        let key = key.into();
        let missing = key.as_str().to_owned();
        if self.get_map_property(
            map_index,
            key,
            GetMapPropertyFlags::IGNORE_NULL_OR_UNDEFINED,
        )? {
            Ok(self.relative(self.stack.len() - 1))
        } else {
            Err(BridgeError::MissingProperty { key: missing })
        }
    }

    pub fn get_map_length(&self, map_index: Index) -> BridgeResult<usize> {
        self.get(map_index)?.get_map().map(|map| map.len())
    }

    /// Pushes a new map with the properties of both maps, `right` winning
    /// on conflicts.
    pub fn merge_maps(&mut self, left: Index, right: Index) -> BridgeResult<Index> {
        let mut merged = self.get(left)?.get_map()?.clone();
        for (key, value) in self.get(right)?.get_map()? {
            merged.insert(key.clone(), value.clone());
        }
        Ok(self.push(TaggedValue::make_map(merged)))
    }

    pub fn get_array_length(&self, array_index: Index) -> BridgeResult<usize> {
        self.get(array_index)?.get_array().map(<[_]>::len)
    }

    /// Stores the value at `value_index` into slot `item` of the array at
    /// `array_index`. The array keeps its length.
    pub fn set_array_item(
        &mut self,
        array_index: Index,
        item: usize,
        value_index: Index,
    ) -> BridgeResult<()> {
        let array_absolute = self.resolve(array_index)?;
        let size = self.stack[array_absolute].get_array()?.len();
        if item >= size {
            return Err(BridgeError::OutOfBounds {
                index: item as isize,
                size,
            });
        }
        let value = self.take_value(value_index, array_absolute)?;
        self.stack[array_absolute].get_array_mut()?[item] = value;
        Ok(())
    }

    /// Pushes slot `item` of the array at `array_index`.
    pub fn get_array_item(&mut self, array_index: Index, item: usize) -> BridgeResult<Index> {
        let items = self.get(array_index)?.get_array()?;
        let value = items
            .get(item)
            .cloned()
            .ok_or(BridgeError::OutOfBounds {
                index: item as isize,
                size: items.len(),
            })?;
        Ok(self.push(value))
    }

    /// Records a boundary error to be reported by the next
    /// [`Marshaller::check_for_error`].
    pub fn set_pending_error(&mut self, error: MarshallingError) {
        if let Some(previous) = self.pending_error.replace(error) {
            log::warn!("pending error overwritten: {previous}");
        }
    }

    pub fn has_pending_error(&self) -> bool {
        self.pending_error.is_some()
    }

    /// Reports the pending error, once. Does nothing if there is none.
    pub fn check_for_error(&mut self) -> BridgeResult<()> {
        match self.pending_error.take() {
            Some(error) => Err(BridgeError::Marshalling(error)),
            None => Ok(()),
        }
    }

    /// Runs `callable` over the top `argument_count` values as a frame of
    /// its own. Whatever the callable leaves behind is discarded except
    /// for its result, which replaces the arguments.
    pub fn call_in_frame<F>(&mut self, argument_count: usize, callable: F) -> BridgeResult<bool>
    where
        F: FnOnce(&mut Marshaller) -> BridgeResult<bool>,
    {
        let available = self.size();
        if argument_count > available {
            return Err(BridgeError::FrameUnderflow {
                requested: argument_count,
                available,
            });
        }
        let enclosing = self.frame_start;
        self.frame_start = self.stack.len() - argument_count;
        log::trace!("entering frame at {}", self.frame_start);

        let outcome = callable(self).and_then(|pushed| self.take_result(argument_count, pushed));

        self.stack.truncate(self.frame_start);
        self.frame_start = enclosing;
        log::trace!("leaving frame, back at {enclosing}");

        match outcome? {
            Some(result) => {
                self.push(result);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pops the result a callable declared, after checking that its frame
    /// holds exactly the `arguments` plus that result.
    pub(crate) fn take_result(
        &mut self,
        arguments: usize,
        pushed: bool,
    ) -> BridgeResult<Option<TaggedValue>> {
        let expected = arguments + usize::from(pushed);
        let found = self.size();
        if found != expected {
            return Err(BridgeError::UnbalancedFrame { expected, found });
        }
        if pushed { self.pop().map(Some) } else { Ok(None) }
    }

    /// Calls the function value at `function_index` with the top
    /// `argument_count` values, which are popped. Pushes the result if
    /// there is one and returns whether it did. An error raised by the
    /// callee becomes the pending error.
    pub fn call_function(
        &mut self,
        function_index: Index,
        argument_count: usize,
        flags: FunctionFlags,
    ) -> BridgeResult<bool> {
        let function = self.get_function(function_index)?;
        self.call_value(&function, argument_count, flags)
    }

    pub(crate) fn call_value(
        &mut self,
        function: &Arc<dyn ValueFunction>,
        argument_count: usize,
        flags: FunctionFlags,
    ) -> BridgeResult<bool> {
        check_invocation_mode(function.as_ref(), flags)?;
        let parameters = self.pop_values(argument_count)?;
        match function.call(flags, parameters) {
            Ok(Some(result)) => {
                self.push(result);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(error) => {
                self.set_pending_error(error);
                Ok(false)
            }
        }
    }

    /// Calls the function at `callback_index` once the promise at
    /// `promise_index` completes: with the value on success, with
    /// `(undefined, error)` on failure.
    pub fn on_promise_complete(
        &self,
        promise_index: Index,
        callback_index: Index,
    ) -> BridgeResult<()> {
        let promise = self.get_promise(promise_index)?;
        let callback = self.get_function(callback_index)?;
        promise.on_complete(move |result| {
            let parameters = match result {
                Ok(value) => vec![value.clone()],
                Err(error) => vec![TaggedValue::Undefined, error.clone().into()],
            };
            if let Err(error) = callback.call(FunctionFlags::empty(), parameters) {
                log::error!(
                    "uncaught error in promise callback {}: {error}",
                    callback.function_type()
                );
            }
        });
        Ok(())
    }

    /// Compares the current frames of both marshallers value by value.
    /// Walks every nested map and array.
    pub fn equals(&self, other: &Marshaller) -> bool {
        self.values() == other.values()
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new(&MarshallerCreateInfo::default())
    }
}

impl fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller")
            .field("frame_start", &self.frame_start)
            .field("values", &self.values())
            .field("pending_error", &self.pending_error)
            .finish()
    }
}

impl PartialEq for Marshaller {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Drop for Marshaller {
    fn drop(&mut self) {
        if let Some(error) = &self.pending_error {
            log::warn!("marshaller dropped with unchecked error: {error}");
        }
        log::trace!("destroying marshaller holding {} values", self.stack.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Image;

    #[test]
    fn primitives_by_index() {
        let mut marshaller = Marshaller::default();
        assert_eq!(marshaller.push_int(42), 0);
        assert_eq!(marshaller.push_string("hello"), 1);

        assert_eq!(marshaller.get_int(0), Ok(42));
        assert_eq!(marshaller.get_str(1), Ok("hello"));
        assert!(!marshaller.is_double(0));
        assert_eq!(marshaller.get_str(-1), Ok("hello"), "-1 is the top");
        assert_eq!(marshaller.get_int(-2), Ok(42));
        assert_eq!(
            marshaller.get(2).unwrap_err(),
            BridgeError::OutOfBounds { index: 2, size: 2 }
        );
        assert!(marshaller.get(-3).is_err());
        assert!(marshaller.get_or_undefined(5).is_null_or_undefined());
    }

    #[test]
    fn map_properties() {
        let mut marshaller = Marshaller::default();
        let map = marshaller.push_map(1);
        marshaller.push_int(7);
        marshaller.put_map_property(map, &intern("x"), -1).unwrap();
        assert_eq!(marshaller.size(), 1, "the value is consumed");

        assert_eq!(
            marshaller.get_map_property(map, intern("x"), GetMapPropertyFlags::empty()),
            Ok(true)
        );
        assert_eq!(marshaller.get_int(-1), Ok(7));

        assert_eq!(
            marshaller.get_map_property(map, intern("y"), GetMapPropertyFlags::empty()),
            Ok(false)
        );
        assert_eq!(marshaller.size(), 2, "a miss pushes nothing");
        assert_eq!(marshaller.get_map_length(map), Ok(1));
    }

    #[test]
    fn map_property_flags() {
        let mut marshaller = Marshaller::default();
        let map = marshaller.push_map(2);
        marshaller.push_null();
        marshaller.put_map_property_uninterned(map, "empty", -1).unwrap();

        assert_eq!(
            marshaller.get_map_property(map, "empty", GetMapPropertyFlags::empty()),
            Ok(true)
        );
        marshaller.pop().unwrap();
        assert_eq!(
            marshaller.get_map_property(
                map,
                "empty",
                GetMapPropertyFlags::IGNORE_NULL_OR_UNDEFINED
                    | GetMapPropertyFlags::PUSH_UNDEFINED_ON_MISS
            ),
            Ok(true),
            "undefined was pushed"
        );
        assert_eq!(marshaller.size(), 2);
        assert!(marshaller.is_null_or_undefined(-1));

        assert_eq!(
            marshaller.must_get_map_property(map, "empty"),
            Err(BridgeError::MissingProperty {
                key: "empty".to_owned()
            })
        );
    }

    #[test]
    fn put_into_a_non_map_keeps_the_value() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(1);
        marshaller.push_int(2);
        assert!(marshaller.put_map_property_uninterned(0, "a", -1).is_err());
        assert_eq!(marshaller.size(), 2);
    }

    #[test]
    fn maps_are_copied_on_write() {
        let mut marshaller = Marshaller::default();
        let map = marshaller.push_map(1);
        let copy = marshaller.duplicate(map).unwrap();
        marshaller.push_bool(true);
        marshaller.put_map_property_uninterned(map, "flag", -1).unwrap();

        assert_eq!(marshaller.get_map_length(map), Ok(1));
        assert_eq!(marshaller.get_map_length(copy), Ok(0));
    }

    #[test]
    fn merge_maps_prefers_the_right_side() {
        let mut marshaller = Marshaller::default();
        let left = marshaller.push_map(2);
        marshaller.push_int(1);
        marshaller.put_map_property_uninterned(left, "a", -1).unwrap();
        marshaller.push_int(1);
        marshaller.put_map_property_uninterned(left, "b", -1).unwrap();
        let right = marshaller.push_map(1);
        marshaller.push_int(2);
        marshaller.put_map_property_uninterned(right, "b", -1).unwrap();

        let merged = marshaller.merge_maps(left, right).unwrap();
        assert_eq!(
            marshaller.to_string(merged, false).unwrap(),
            r#"{ "a": 1, "b": 2 }"#
        );
    }

    #[test]
    fn array_items() {
        let mut marshaller = Marshaller::default();
        let array = marshaller.push_array(2);
        marshaller.push_string("a");
        marshaller.set_array_item(array, 0, -1).unwrap();
        marshaller.push_string("b");
        marshaller.set_array_item(array, 1, -1).unwrap();
        marshaller.push_string("c");
        assert_eq!(
            marshaller.set_array_item(array, 5, -1),
            Err(BridgeError::OutOfBounds { index: 5, size: 2 })
        );

        assert_eq!(marshaller.get_array_length(array), Ok(2));
        let item = marshaller.get_array_item(array, 1).unwrap();
        assert_eq!(marshaller.get_str(item), Ok("b"));
        assert!(marshaller.get_array_item(array, 2).is_err());
    }

    #[test]
    fn arrays_are_created_at_their_length_and_filled_in_any_order() {
        let mut marshaller = Marshaller::default();
        let array = marshaller.push_array(3);
        assert_eq!(marshaller.get_array_length(array), Ok(3));
        let first = marshaller.get_array_item(array, 0).unwrap();
        assert!(marshaller.is_null_or_undefined(first));
        marshaller.pop().unwrap();

        marshaller.push_int(30);
        marshaller.set_array_item(array, 2, -1).unwrap();
        marshaller.push_int(10);
        marshaller.set_array_item(array, 0, -1).unwrap();
        marshaller.push_int(20);
        marshaller.set_array_item(array, 1, -1).unwrap();
        assert_eq!(marshaller.size(), 1);

        marshaller.push_int(40);
        assert_eq!(
            marshaller.set_array_item(array, 3, -1),
            Err(BridgeError::OutOfBounds { index: 3, size: 3 }),
            "arrays do not grow"
        );
        marshaller.pop().unwrap();
        assert_eq!(marshaller.to_string(array, false).unwrap(), "[10, 20, 30]");
    }

    #[test]
    fn pop_count_past_the_frame_fails() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(1);
        marshaller.push_int(2);
        assert_eq!(
            marshaller.pop_count(3),
            Err(BridgeError::FrameUnderflow {
                requested: 3,
                available: 2
            })
        );
        assert_eq!(marshaller.size(), 2, "a failed pop_count must not pop");
        marshaller.pop_count(2).unwrap();
        assert!(marshaller.pop().is_err());
    }

    #[test]
    fn frames_do_not_leak_into_each_other() {
        let mut marshaller = Marshaller::default();
        marshaller.push_string("outer");
        marshaller.push_int(3);
        marshaller.push_int(4);

        let pushed = marshaller
            .call_in_frame(2, |frame| {
                assert_eq!(frame.size(), 2);
                assert_eq!(frame.get_int(0), Ok(3));
                assert!(
                    frame.pop_count(3).is_err(),
                    "must not reach the enclosing frame"
                );
                let product = frame.get_int(0)? * frame.get_int(1)?;
                frame.push_int(product);
                frame.push_string("scratch");
                frame.pop()?;
                Ok(true)
            })
            .unwrap();

        assert!(pushed);
        assert_eq!(marshaller.size(), 2);
        assert_eq!(marshaller.get_str(0), Ok("outer"));
        assert_eq!(marshaller.get_int(1), Ok(12));
    }

    #[test]
    fn frames_must_hold_exactly_the_declared_result() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(1);
        assert_eq!(
            marshaller.call_in_frame(1, |_| Ok(true)),
            Err(BridgeError::UnbalancedFrame {
                expected: 2,
                found: 1
            }),
            "an argument is not a result"
        );
        assert_eq!(marshaller.size(), 0);

        marshaller.push_int(1);
        assert_eq!(
            marshaller.call_in_frame(1, |frame| {
                frame.push_int(2);
                frame.push_int(3);
                Ok(true)
            }),
            Err(BridgeError::UnbalancedFrame {
                expected: 2,
                found: 3
            })
        );
        assert_eq!(marshaller.size(), 0);
    }

    #[test]
    fn failing_frames_are_unwound() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(1);
        let result = marshaller.call_in_frame(1, |frame| {
            frame.push_int(2);
            frame.get_str(0).map(|_| true)
        });
        assert!(result.is_err());
        assert_eq!(marshaller.size(), 0, "arguments are consumed either way");
    }

    #[test]
    fn retained_values_are_released_when_popped_or_dropped() {
        let image = Strong::new(Image).erase();
        {
            let mut marshaller = Marshaller::default();
            marshaller.push_object(image.clone());
            marshaller.duplicate(-1).unwrap();
            assert_eq!(Strong::retain_count(&image), 3);
            marshaller.pop().unwrap();
            assert_eq!(Strong::retain_count(&image), 2);
        }
        assert_eq!(Strong::retain_count(&image), 1);
    }

    #[test]
    fn call_function_pushes_the_result() {
        let mut marshaller = Marshaller::default();
        let function = marshaller.push_native_function("concat", |m| {
            let joined = format!("{}{}", m.get_str(0)?, m.get_str(1)?);
            m.push_string(joined);
            Ok(true)
        });
        marshaller.push_string("foo");
        marshaller.push_string("bar");

        assert_eq!(
            marshaller.call_function(function, 2, FunctionFlags::CALL_SYNC),
            Ok(true)
        );
        assert_eq!(marshaller.size(), 2);
        assert_eq!(marshaller.get_str(-1), Ok("foobar"));
        assert!(marshaller.check_for_error().is_ok());
    }

    #[test]
    fn callee_errors_are_reported_once() {
        let mut marshaller = Marshaller::default();
        let function = marshaller.push_native_function("fails", |m| {
            m.get_int(0)?;
            Ok(false)
        });
        marshaller.push_string("not an int");

        assert_eq!(
            marshaller.call_function(
                function,
                1,
                FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR
            ),
            Ok(false)
        );
        assert!(marshaller.has_pending_error());
        assert!(matches!(
            marshaller.check_for_error(),
            Err(BridgeError::Marshalling(_))
        ));
        assert!(marshaller.check_for_error().is_ok(), "only reported once");
    }

    #[test]
    fn callee_errors_are_logged_unless_propagated() {
        let mut marshaller = Marshaller::default();
        let function = marshaller.push_native_function("fails", |m| {
            m.get_int(0)?;
            Ok(false)
        });
        marshaller.push_string("not an int");

        assert_eq!(
            marshaller.call_function(function, 1, FunctionFlags::CALL_SYNC),
            Ok(false)
        );
        assert!(!marshaller.has_pending_error());
        assert_eq!(marshaller.size(), 1);
    }

    #[test]
    fn unsupported_modes_are_rejected_before_popping() {
        let mut marshaller = Marshaller::default();
        let function = marshaller.push_native_function("noop", |_| Ok(false));
        marshaller.push_int(1);
        assert!(matches!(
            marshaller.call_function(function, 1, FunctionFlags::ALLOW_THROTTLING),
            Err(BridgeError::UnsupportedInvocationMode { .. })
        ));
        assert_eq!(marshaller.size(), 2);
    }

    #[test]
    fn promise_completion_calls_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = MarshallerFunction::new("callback", move |m: &mut Marshaller| {
            sink.lock().push(m.values().to_vec());
            Ok(false)
        });

        let mut marshaller = Marshaller::default();
        let promise = Promise::new();
        let promise_index = marshaller.push_promise(promise.clone());
        let callback_index = marshaller.push(callback.into_value());
        marshaller.on_promise_complete(promise_index, callback_index).unwrap();
        assert!(seen.lock().is_empty());

        promise.resolve(TaggedValue::Int(9));
        assert_eq!(*seen.lock(), vec![vec![TaggedValue::Int(9)]]);

        let rejected = Promise::rejected(MarshallingError::new("nope"));
        let rejected_index = marshaller.push_promise(rejected);
        marshaller.on_promise_complete(rejected_index, callback_index).unwrap();
        assert_eq!(
            seen.lock()[1],
            vec![TaggedValue::Undefined, MarshallingError::new("nope").into()]
        );
    }

    #[test]
    fn exported_objects_cross_as_ids() {
        let image = Strong::new(Image).erase();
        let mut marshaller = Marshaller::default();
        let index = marshaller.push_exported_object(&image, Strength::Strong, "Image");
        let id = marshaller.get_exported_id(index).unwrap();

        let loaded = marshaller.get_exported_object(index).unwrap().unwrap();
        assert!(Strong::ptr_eq(&loaded, &image));
        drop(loaded);

        marshaller.pop().unwrap();
        assert!(
            crate::strong_references().load(id).is_err(),
            "dropping the last reference frees the slot"
        );
        assert_eq!(Strong::retain_count(&image), 1);
    }

    #[test]
    fn equality_and_to_array() {
        let mut left = Marshaller::default();
        let mut right = Marshaller::default();
        for marshaller in [&mut left, &mut right] {
            marshaller.push_int(1);
            marshaller.push_string("two");
        }
        assert!(left.equals(&right));

        right.swap(0, 1).unwrap();
        assert_ne!(left, right);

        left.to_array();
        assert_eq!(left.size(), 1);
        assert_eq!(left.to_string(0, false).unwrap(), r#"[1, "two"]"#);
    }

    #[test]
    fn optional_getters() {
        let mut marshaller = Marshaller::default();
        marshaller.push_null();
        marshaller.push_double(1.5);
        assert_eq!(marshaller.get_optional_double(0), Ok(None));
        assert_eq!(marshaller.get_optional_double(1), Ok(Some(1.5)));
        assert_eq!(marshaller.get_optional_int(7), Ok(None));
        assert!(marshaller.get_optional_int(1).is_err());
    }

    #[test]
    fn scoped_marshaller() {
        let image = Strong::new(Image).erase();
        let size = with_marshaller(|marshaller| {
            marshaller.push_object(image.clone());
            marshaller.push_unretained_object(&image);
            marshaller.size()
        });
        assert_eq!(size, 2);
        assert_eq!(Strong::retain_count(&image), 1);
    }
}
