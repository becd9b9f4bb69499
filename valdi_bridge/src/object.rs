//! Ownership wrappers for native objects crossing the boundary.
//!
//! Strong<T>: a retained reference. Cloning retains, dropping releases.
//!
//! Weak<T>: an unretained reference that never keeps the object alive and
//! detects deallocation on access.
use std::{
    any::Any,
    fmt,
    ops::Deref,
    sync::{Arc, Weak as StdWeak},
};

/// Any native object that can be handed to the scripting side.
pub trait NativeObject: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + fmt::Debug> NativeObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

pub struct Strong<T: ?Sized = dyn NativeObject>(Arc<T>);

pub struct Weak<T: ?Sized = dyn NativeObject>(StdWeak<T>);

impl<T: NativeObject> Strong<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Type-erases the reference so it can be stored in a [`crate::TaggedValue`].
    pub fn erase(self) -> Strong {
        let erased: Arc<dyn NativeObject> = self.0;
        Strong(erased)
    }
}

impl<T: ?Sized> Strong<T> {
    pub fn from_arc(arc: Arc<T>) -> Self {
        Self(arc)
    }

    /// Number of strong holders, this one included.
    pub fn retain_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        Weak(Arc::downgrade(&this.0))
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Self::addr(this) == Self::addr(other)
    }

    /// Address of the referenced object, used as its identity.
    pub fn addr(this: &Self) -> usize {
        Arc::as_ptr(&this.0) as *const () as usize
    }

    /// Gives up this reference without releasing it. The count stays
    /// incremented until a matching [`Strong::from_raw`].
    pub fn into_raw(this: Self) -> *const T {
        Arc::into_raw(this.0)
    }

    /// # Safety
    /// `ptr` must come from [`Strong::into_raw`] and be consumed once.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        // SAFETY: the caller hands back a pointer obtained from into_raw
        Self(unsafe { Arc::from_raw(ptr) })
    }
}

// Strong itself satisfies the NativeObject blanket impl, so the erased
// object is always reached through `&*self.0`.
impl Strong {
    pub fn type_name(&self) -> &'static str {
        <dyn NativeObject as NativeObject>::type_name(&*self.0)
    }

    pub fn downcast<T: NativeObject>(self) -> Result<Strong<T>, Strong> {
        if self.downcast_ref::<T>().is_none() {
            return Err(self);
        }
        let raw = Arc::into_raw(self.0) as *const T;
        // SAFETY: the concrete type was checked above, the allocation is the
        // one into_raw handed out
        Ok(Strong(unsafe { Arc::from_raw(raw) }))
    }

    pub fn downcast_ref<T: NativeObject>(&self) -> Option<&T> {
        <dyn NativeObject as NativeObject>::as_any(&*self.0).downcast_ref::<T>()
    }
}

// we need custom clone implementation as derive would require T: Clone
impl<T: ?Sized> Clone for Strong<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Strong").field(&&*self.0).finish()
    }
}

impl<T: ?Sized> Weak<T> {
    pub fn upgrade(&self) -> Option<Strong<T>> {
        self.0.upgrade().map(Strong)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as *const () as usize
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self(StdWeak::clone(&self.0))
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weak({:#x}, alive: {})", self.addr(), self.is_alive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Button {
        title: &'static str,
    }

    #[test]
    fn clone_and_drop_balance_the_retain_count() {
        let button = Strong::new(Button { title: "ok" });
        assert_eq!(Strong::retain_count(&button), 1);

        let copy = button.clone();
        assert_eq!(Strong::retain_count(&button), 2);
        drop(copy);
        assert_eq!(Strong::retain_count(&button), 1);
    }

    #[test]
    fn weak_does_not_keep_the_object_alive() {
        let button = Strong::new(Button { title: "ok" });
        let weak = Strong::downgrade(&button);

        assert_eq!(Strong::retain_count(&button), 1);
        assert!(weak.is_alive());
        assert_eq!(weak.upgrade().map(|b| b.title), Some("ok"));

        drop(button);
        assert!(!weak.is_alive(), "object should be gone");
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn erased_objects_downcast_back() {
        let erased = Strong::new(Button { title: "ok" }).erase();
        assert!(erased.downcast_ref::<String>().is_none());
        assert_eq!(erased.type_name(), std::any::type_name::<Button>());

        let erased = erased.downcast::<String>().unwrap_err();
        let button = erased.downcast::<Button>().expect("is a button");
        assert_eq!(button.title, "ok");
    }

    #[test]
    fn raw_round_trip_keeps_the_count() {
        let button = Strong::new(Button { title: "ok" });
        let keep = button.clone();
        let raw = Strong::into_raw(button);
        assert_eq!(Strong::retain_count(&keep), 2);

        // SAFETY: raw comes from into_raw above
        let back = unsafe { Strong::from_raw(raw) };
        assert!(Strong::ptr_eq(&back, &keep));
        drop(back);
        assert_eq!(Strong::retain_count(&keep), 1);
    }
}
