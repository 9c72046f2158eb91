use std::cell::{Ref, RefCell, RefMut};
use std::ops::Deref;
use std::rc::Rc;

/// Shared, single-threaded mutable state.
///
/// Everything in an invocation runs on one current-thread runtime, so a plain `Rc<RefCell<T>>`
/// is enough to share state between a provider/scheduler implementation and its observers.
#[derive(Default, Debug)]
pub struct WrappedRcRefCell<T: ?Sized> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedRcRefCell {
            inner: Rc::new(RefCell::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedRcRefCell<T> {
    /// Return a immutable reference to contents. Panics whenever `RefCell::borrow()` would.
    #[inline]
    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.deref().borrow()
    }

    /// Return a mutable reference to contents. Panics whenever `RefCell::borrow_mut()` would.
    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.deref().borrow_mut()
    }
}

impl<T: ?Sized> Clone for WrappedRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedRcRefCell {
            inner: self.inner.clone(),
        }
    }
}
