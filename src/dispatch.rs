// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Runs work on the engine's graphics thread.

Engines expose their graphics command stream as a [`CommandStream`]: something that
accepts a C-style `(callback, event_id, data)` triple and invokes the callback on the
graphics thread once the stream reaches that point.  This is the shape of the
plugin-event hooks most engines offer.

[`Dispatcher`] turns that into something that takes a closure.  The closure is parked in
a process-wide [`HandleRegistry`] and the token rides through the stream as `data`.

# A brief digression on blocking

Work such as fetching the current native graphics context only makes sense on the
graphics thread, but the caller usually needs the answer right away.  [`Dispatcher::run_blocking`]
covers that: the dispatched closure fulfils a one-shot continuation and the caller sleeps
on it.  From the stream's point of view the execution is still asynchronous.  If the
caller *is* the graphics thread, waiting on the stream would deadlock, so the closure
runs inline instead.
*/

use crate::Error;
use crate::registry::{HandleRegistry, Token, fatal};
use logwise::context::Context;
use r#continue::continuation;
use std::ffi::c_void;
use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle, ThreadId};

/// C-style plugin event callback: `(event_id, data)`.
pub type PluginCallback = extern "C" fn(event_id: i32, data: *mut c_void);

/// Event id attached to dispatched closures.
pub const DISPATCH_EVENT: i32 = 0;

/// An engine's graphics command stream.
pub trait CommandStream: Send + Sync + 'static {
    /**
    Enqueues `callback(event_id, data)`.

    The callback must run exactly once, on the graphics thread, in submission order
    relative to other commands in this stream.
    */
    fn issue(&self, callback: PluginCallback, event_id: i32, data: *mut c_void);

    /// True when called from the graphics thread.
    fn is_current(&self) -> bool;
}

type Action = Box<dyn FnOnce() + Send>;

static ACTIONS: HandleRegistry<Action> = HandleRegistry::new();

extern "C" fn run_action(_event_id: i32, data: *mut c_void) {
    let action = match Token::from_context(data) {
        Some(token) => ACTIONS.resolve_and_release(token),
        None => fatal(&Error::NullContext),
    };
    match action {
        Ok(action) => {
            if std::panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
                logwise::error_sync!("Dispatched action panicked on the graphics thread");
            }
        }
        Err(e) => fatal(&e),
    }
}

/// Closure-level access to a [`CommandStream`].
#[derive(Clone)]
pub struct Dispatcher {
    stream: Arc<dyn CommandStream>,
}

impl Dispatcher {
    pub fn new(stream: Arc<dyn CommandStream>) -> Self {
        Dispatcher { stream }
    }

    pub fn is_graphics_thread(&self) -> bool {
        self.stream.is_current()
    }

    /// Enqueues `action` on the graphics thread and returns immediately.
    pub fn run<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = ACTIONS.allocate(Box::new(action));
        self.stream
            .issue(run_action, DISPATCH_EVENT, token.into_context());
    }

    /// Runs `f` on the graphics thread and blocks until it returns.
    ///
    /// A panic in `f` is resumed on the calling thread.
    pub fn run_blocking<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_graphics_thread() {
            return f();
        }
        let (s, r) = continuation();
        self.run(move || {
            //a panic must still reach the waiting caller
            s.send(std::panic::catch_unwind(AssertUnwindSafe(f)));
        });
        match test_executors::sleep_on(r) {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Runs `f` on the graphics thread, carrying the caller's log context along.
    pub async fn run_async<F, R>(&self, label: String, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let prior_context = Context::current();
        let (s, r) = continuation();
        self.run(move || {
            let c = Context::new_task(Some(prior_context), "dispatch".to_string());
            let id = c.context_id();
            c.set_current();
            logwise::info_sync!("dispatch {label}", label = label);
            let r = std::panic::catch_unwind(AssertUnwindSafe(f));
            s.send(r);
            Context::pop(id);
        });
        match r.await {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}

struct Command {
    callback: PluginCallback,
    event_id: i32,
    data: usize,
}

/**
A [`CommandStream`] backed by a dedicated thread draining a FIFO.

Dropping the stream lets the thread finish every queued command, then joins it.
*/
pub struct GraphicsThread {
    sender: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl GraphicsThread {
    pub fn spawn(name: &str) -> Result<Self, Error> {
        let (sender, receiver): (Sender<Command>, Receiver<Command>) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                //channel closes when the stream drops
                while let Ok(command) = receiver.recv() {
                    (command.callback)(command.event_id, command.data as *mut c_void);
                }
            })?;
        let thread_id = thread.thread().id();
        Ok(GraphicsThread {
            sender: Some(sender),
            thread: Some(thread),
            thread_id,
        })
    }
}

impl CommandStream for GraphicsThread {
    fn issue(&self, callback: PluginCallback, event_id: i32, data: *mut c_void) {
        let command = Command {
            callback,
            event_id,
            data: data as usize,
        };
        let sent = self
            .sender
            .as_ref()
            .map(|sender| sender.send(command).is_ok())
            .unwrap_or(false);
        if !sent {
            logwise::error_sync!("Graphics thread is gone; dropping command");
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Debug for GraphicsThread {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsThread")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl Drop for GraphicsThread {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.thread.take() {
            //the last reference can be released from a command on the thread itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(GraphicsThread::spawn("test graphics").unwrap()))
    }

    #[test]
    fn actions_run_in_submission_order() {
        let dispatcher = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            dispatcher.run(move || seen.lock().unwrap().push(i));
        }
        dispatcher.run_blocking(|| ());
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn run_blocking_executes_on_graphics_thread() {
        let dispatcher = dispatcher();
        let inner = dispatcher.clone();
        let on_thread = dispatcher.run_blocking(move || inner.is_graphics_thread());
        assert!(on_thread);
        assert!(!dispatcher.is_graphics_thread());
    }

    #[test]
    fn nested_run_blocking_runs_inline() {
        let dispatcher = dispatcher();
        let inner = dispatcher.clone();
        let value = dispatcher.run_blocking(move || inner.run_blocking(|| 7));
        assert_eq!(value, 7);
    }

    #[test]
    fn each_action_runs_once() {
        let dispatcher = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = count.clone();
            dispatcher.run(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.run_blocking(|| ());
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn panicking_action_does_not_kill_the_stream() {
        let dispatcher = dispatcher();
        dispatcher.run(|| panic!("boom"));
        assert_eq!(dispatcher.run_blocking(|| 3), 3);
    }

    #[test]
    fn run_blocking_resumes_panic_on_caller() {
        let dispatcher = dispatcher();
        let inner = dispatcher.clone();
        let caught = std::panic::catch_unwind(AssertUnwindSafe(move || {
            inner.run_blocking(|| -> u32 { panic!("no native context") })
        }));
        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"no native context"));
        assert_eq!(dispatcher.run_blocking(|| 5), 5);
    }

    #[test_executors::async_test]
    async fn run_async_returns_value() {
        let dispatcher = dispatcher();
        let value = dispatcher.run_async("answer".to_string(), || 42).await;
        assert_eq!(value, 42);
    }
}
