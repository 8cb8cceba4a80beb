//! Interpreter exclusion
//!
//! One lock per interpreter. Handlers run while holding it; blocking I/O is
//! wrapped in [`InterpreterGuard::allow_threads`], which releases the lock for
//! the duration of the call and takes it back before returning.

use native_host::{LogLevel, NativeServer, PoolRef};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fmt;
use tracing::{error, trace};

/// Script callback run once at pool teardown, given its registration data
pub type Cleanup = Box<dyn FnOnce(Option<Value>) -> anyhow::Result<()> + Send>;

pub struct Interpreter {
    name: String,
    lock: Mutex<()>,
}

impl Interpreter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the interpreter lock is ours
    pub fn acquire(&self) -> InterpreterGuard<'_> {
        let guard = self.lock.lock();
        trace!(interpreter = %self.name, "acquired");
        InterpreterGuard {
            interpreter: self,
            guard,
        }
    }

    /// Whether some thread currently holds the lock
    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }

    /// Run a registered cleanup under the lock. Failures go to the error log
    /// of `server` and are not propagated.
    pub(crate) fn run_cleanup(
        &self,
        cleanup: Cleanup,
        data: Option<Value>,
        server: Option<&PoolRef<NativeServer>>,
    ) {
        let _py = self.acquire();
        if let Err(e) = cleanup(data) {
            let message = format!("cleanup handler failed: {:#}", e);
            error!(interpreter = %self.name, "{}", message);
            let server = server.and_then(|s| s.get().ok());
            let server = server.as_ref().map(|s| s.lock());
            native_host::log_error(&message, LogLevel::Error, server.as_deref());
        }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("name", &self.name)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Proof that the current thread holds the interpreter lock
pub struct InterpreterGuard<'a> {
    interpreter: &'a Interpreter,
    guard: MutexGuard<'a, ()>,
}

impl InterpreterGuard<'_> {
    pub fn interpreter(&self) -> &Interpreter {
        self.interpreter
    }

    /// Run blocking work with the lock released
    pub fn allow_threads<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        MutexGuard::unlocked(&mut self.guard, f)
    }
}
