use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{MarshallingError, TaggedValue};

pub type PromiseResult = Result<TaggedValue, MarshallingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Observer form of [`Promise::on_complete`], for callers that keep their
/// callback around as an object.
pub trait PromiseCallback: Send + Sync {
    fn on_success(&self, value: &TaggedValue);
    fn on_failure(&self, error: &MarshallingError);
}

type Completion = Box<dyn FnOnce(&PromiseResult) + Send>;

struct PromiseImpl {
    result: Option<PromiseResult>,
    callbacks: Vec<Completion>,
    cancelled: bool,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

/// A value that becomes available later, exactly once.
///
/// Callbacks never run under the promise's lock. Callbacks attached after
/// resolution run immediately on the attaching thread.
pub struct Promise {
    cancelable: bool,
    inner: Mutex<PromiseImpl>,
}

impl Promise {
    fn with(cancelable: bool, on_cancel: Option<Box<dyn FnOnce() + Send>>) -> Arc<Self> {
        Arc::new(Self {
            cancelable,
            inner: Mutex::new(PromiseImpl {
                result: None,
                callbacks: Vec::new(),
                cancelled: false,
                on_cancel,
            }),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::with(false, None)
    }

    /// A promise whose producer can be asked to stop. `on_cancel` runs at
    /// most once, on the first [`Promise::cancel`].
    pub fn cancelable<F>(on_cancel: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with(true, Some(Box::new(on_cancel)))
    }

    pub fn resolved(value: TaggedValue) -> Arc<Self> {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    pub fn rejected(error: MarshallingError) -> Arc<Self> {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    /// Completes the promise. Only the first call has any effect; returns
    /// whether this one did.
    pub fn fulfill(&self, result: PromiseResult) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn resolve(&self, value: TaggedValue) -> bool {
        self.fulfill(Ok(value))
    }

    pub fn reject(&self, error: MarshallingError) -> bool {
        self.fulfill(Err(error))
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&PromiseResult) + Send + 'static,
    {
        let result = {
            let mut inner = self.inner.lock();
            match &inner.result {
                Some(result) => result.clone(),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    pub fn on_complete_callback(&self, callback: Arc<dyn PromiseCallback>) {
        self.on_complete(move |result| match result {
            Ok(value) => callback.on_success(value),
            Err(error) => callback.on_failure(error),
        });
    }

    /// Asks the producer to stop. Does nothing on a non-cancelable promise
    /// or when called again. Results delivered later still reach the
    /// attached callbacks.
    pub fn cancel(&self) {
        if !self.cancelable {
            return;
        }
        let on_cancel = {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.on_cancel.take()
        };
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn state(&self) -> PromiseState {
        match &self.inner.lock().result {
            None => PromiseState::Pending,
            Some(Ok(_)) => PromiseState::Fulfilled,
            Some(Err(_)) => PromiseState::Rejected,
        }
    }

    pub fn result(&self) -> Option<PromiseResult> {
        self.inner.lock().result.clone()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("cancelable", &self.cancelable)
            .finish()
    }
}
