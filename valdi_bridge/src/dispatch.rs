//! Dispatcher: where deferred calls run. The core never owns a scheduler,
//! the embedder hands one in.
//!
//! DispatchedFunction: a function value whose default and throttled calls
//! are sent to a dispatcher, while synchronous calls run on the caller's
//! thread.
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    CallResult, FunctionFlags, Promise, TaggedValue, ValueFunction,
};

pub type Task = Box<dyn FnOnce() + Send>;

pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);

    /// Whether the calling thread is the one tasks run on.
    fn is_current(&self) -> bool {
        false
    }
}

/// Runs every task immediately on the dispatching thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }

    fn is_current(&self) -> bool {
        true
    }
}

/// Collects tasks until the owner of the run loop drains them.
#[derive(Default)]
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<Task>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the oldest task. Returns false if there was none.
    pub fn run_once(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue is empty, including tasks enqueued while
    /// draining. Returns how many ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    has_work: Condvar,
    should_stop: AtomicBool,
}

impl WorkerQueue {
    fn run(&self) {
        loop {
            let task = {
                let mut tasks = self.tasks.lock();
                while tasks.is_empty() && !self.should_stop.load(Ordering::Acquire) {
                    self.has_work.wait(&mut tasks);
                }
                match tasks.pop_front() {
                    Some(task) => task,
                    // stopping and nothing left
                    None => return,
                }
            };
            task();
        }
    }
}

/// A single worker thread. Dropping the dispatcher lets the worker finish
/// the queued tasks and joins it.
pub struct ThreadDispatcher {
    queue: Arc<WorkerQueue>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadDispatcher {
    pub fn new(name: &str) -> io::Result<Self> {
        let queue = Arc::new(WorkerQueue {
            tasks: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker.run())?;
        Ok(Self {
            queue,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, task: Task) {
        self.queue.tasks.lock().push_back(task);
        self.queue.has_work.notify_one();
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        {
            let _tasks = self.queue.tasks.lock();
            self.queue.should_stop.store(true, Ordering::Release);
        }
        self.queue.has_work.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // dropped from one of its own tasks, the thread exits by itself
                return;
            }
            if handle.join().is_err() {
                log::error!("dispatcher thread panicked");
            }
        }
    }
}

/// Sends calls of a function value through a [`Dispatcher`].
pub struct DispatchedFunction {
    function: Arc<dyn ValueFunction>,
    dispatcher: Arc<dyn Dispatcher>,
    // ticket of the most recent throttled call
    latest_throttled: Arc<AtomicU64>,
}

impl DispatchedFunction {
    pub fn new(function: Arc<dyn ValueFunction>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            function,
            dispatcher,
            latest_throttled: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn into_value(self) -> TaggedValue {
        TaggedValue::make_function(Arc::new(self))
    }

    fn dispatch_call(&self, parameters: Vec<TaggedValue>, ticket: Option<u64>) {
        let function = Arc::clone(&self.function);
        let latest = Arc::clone(&self.latest_throttled);
        self.dispatcher.dispatch(Box::new(move || {
            if let Some(ticket) = ticket {
                // a call counts as started once it passed this check
                if latest.load(Ordering::Acquire) != ticket {
                    log::debug!(
                        "throttled call {ticket} to {} superseded",
                        function.function_type()
                    );
                    return;
                }
            }
            if let Err(error) = function.call(FunctionFlags::empty(), parameters) {
                log::error!(
                    "uncaught error in {}: {error}",
                    function.function_type()
                );
            }
        }));
    }

    /// Runs the call on the dispatcher and completes the returned promise
    /// with its outcome. A call producing no value resolves to undefined.
    pub fn call_async(&self, parameters: Vec<TaggedValue>) -> Arc<Promise> {
        let promise = Promise::new();
        let function = Arc::clone(&self.function);
        let completion = Arc::clone(&promise);
        self.dispatcher.dispatch(Box::new(move || {
            let flags = FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR;
            let result = function
                .call(flags, parameters)
                .map(Option::unwrap_or_default);
            completion.fulfill(result);
        }));
        promise
    }
}

impl ValueFunction for DispatchedFunction {
    fn call(&self, flags: FunctionFlags, parameters: Vec<TaggedValue>) -> CallResult {
        if flags.contains(FunctionFlags::CALL_SYNC) {
            return self.function.call(flags, parameters);
        }
        let ticket = flags
            .contains(FunctionFlags::ALLOW_THROTTLING)
            .then(|| self.latest_throttled.fetch_add(1, Ordering::AcqRel) + 1);
        self.dispatch_call(parameters, ticket);
        Ok(None)
    }

    fn capabilities(&self) -> FunctionFlags {
        FunctionFlags::all()
    }

    fn function_type(&self) -> &'static str {
        self.function.function_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BridgeResult, Invocable, Marshaller, MarshallerFunction, MarshallingError,
        PromiseState,
    };
    use std::{sync::mpsc, time::Duration};

    fn recorder() -> (Arc<dyn ValueFunction>, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let function = MarshallerFunction::new(
            "record",
            move |m: &mut Marshaller| -> BridgeResult<bool> {
                sink.lock().push(m.get_int(0)?);
                Ok(false)
            },
        );
        (Arc::new(function), seen)
    }

    #[test]
    fn default_calls_are_deferred() {
        let queue = Arc::new(QueueDispatcher::new());
        let (function, seen) = recorder();
        let dispatched = Invocable::new(Arc::new(DispatchedFunction::new(
            function,
            queue.clone(),
        )));

        dispatched.invoke(vec![1.into()]);
        dispatched.invoke(vec![2.into()]);
        assert!(seen.lock().is_empty(), "nothing runs before the drain");

        assert_eq!(queue.drain(), 2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn throttled_calls_keep_only_the_latest_pending_one() {
        let queue = Arc::new(QueueDispatcher::new());
        let (function, seen) = recorder();
        let dispatched = Invocable::new(Arc::new(DispatchedFunction::new(
            function,
            queue.clone(),
        )));

        dispatched.invoke_throttled(vec![1.into()]).unwrap();
        dispatched.invoke_throttled(vec![2.into()]).unwrap();
        queue.drain();
        assert_eq!(*seen.lock(), vec![2], "the first call was superseded");

        // a call that already ran is not affected by later ones
        dispatched.invoke_throttled(vec![3.into()]).unwrap();
        queue.drain();
        dispatched.invoke_throttled(vec![4.into()]).unwrap();
        queue.drain();
        assert_eq!(*seen.lock(), vec![2, 3, 4]);
    }

    #[test]
    fn sync_calls_run_on_the_calling_thread() {
        let queue = Arc::new(QueueDispatcher::new());
        let adder = MarshallerFunction::new("add", |m: &mut Marshaller| {
            let sum = m.get_int(0)? + m.get_int(1)?;
            m.push_int(sum);
            Ok(true)
        });
        let dispatched =
            Invocable::new(Arc::new(DispatchedFunction::new(Arc::new(adder), queue.clone())));

        assert_eq!(
            dispatched.invoke_sync(vec![1.into(), 2.into()]),
            Ok(Some(TaggedValue::Int(3)))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn sync_calls_propagate_errors_only_when_asked() {
        let queue = Arc::new(QueueDispatcher::new());
        let failing = MarshallerFunction::new("fail", |m: &mut Marshaller| {
            m.set_pending_error(MarshallingError::new("denied"));
            Ok(false)
        });
        let dispatched = DispatchedFunction::new(Arc::new(failing), queue.clone());

        assert_eq!(dispatched.call(FunctionFlags::CALL_SYNC, vec![]), Ok(None));
        assert_eq!(
            dispatched.call(
                FunctionFlags::CALL_SYNC | FunctionFlags::PROPAGATES_ERROR,
                vec![]
            ),
            Err(MarshallingError::new("denied"))
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn async_calls_complete_a_promise() {
        let queue = Arc::new(QueueDispatcher::new());
        let failing = MarshallerFunction::new("fail", |m: &mut Marshaller| {
            m.set_pending_error(MarshallingError::new("denied"));
            Ok(false)
        });
        let dispatched = DispatchedFunction::new(Arc::new(failing), queue.clone());

        let promise = dispatched.call_async(vec![]);
        assert_eq!(promise.state(), PromiseState::Pending);
        queue.drain();
        assert_eq!(promise.result(), Some(Err(MarshallingError::new("denied"))));
    }

    #[test]
    fn inline_dispatcher_runs_immediately() {
        let (function, seen) = recorder();
        let dispatched = DispatchedFunction::new(function, Arc::new(InlineDispatcher));
        let promise = dispatched.call_async(vec![5.into()]);

        assert_eq!(*seen.lock(), vec![5]);
        assert_eq!(promise.result(), Some(Ok(TaggedValue::Undefined)));
    }

    #[test]
    fn thread_dispatcher_runs_tasks_in_order() {
        let dispatcher = ThreadDispatcher::new("valdi-test-worker").unwrap();
        let (sender, receiver) = mpsc::channel();
        for i in 0..10 {
            let sender = sender.clone();
            dispatcher.dispatch(Box::new(move || {
                sender.send(i).unwrap();
            }));
        }
        let order: Vec<i32> = (0..10)
            .map(|_| receiver.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert!(!dispatcher.is_current());
    }

    #[test]
    fn dropping_the_thread_dispatcher_finishes_queued_work() {
        let ran = Arc::new(AtomicU64::new(0));
        {
            let dispatcher = ThreadDispatcher::new("valdi-test-drain").unwrap();
            for _ in 0..100 {
                let ran = ran.clone();
                dispatcher.dispatch(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }
}
