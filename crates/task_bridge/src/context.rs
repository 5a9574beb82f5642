//! src/context.rs
//!
//! Per-task state handed to the bridge by the enclosing framework.
//!
//! `TaskContext` is a cheap-clone handle: every clone observes the same
//! cancellation and completion flags, the same metrics, and the same hook
//! registry. The framework flips `cancel()` from wherever it learns about
//! a kill request and calls `complete()` exactly when the task attempt is
//! finished (successfully or not); completion runs the registered hooks
//! once, in registration order, on the completing thread.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

type CompletionHook = Box<dyn FnOnce() + Send>;

/// Shared handle to the state of one task attempt.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    cancelled: AtomicBool,
    completed: AtomicBool,
    hooks: Mutex<Vec<CompletionHook>>,
    metrics: TaskMetrics,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
                metrics: TaskMetrics::default(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Marks the task as killed. Observers (the monitor, the output
    /// iterator) react on their next check; nothing blocks here.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Registers a hook to run when the task completes. If the task has
    /// already completed, the hook runs immediately on this thread.
    pub fn add_completion_hook(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_completed() {
            hook();
            return;
        }
        let mut hooks = self.inner.hooks.lock().unwrap();
        // Re-check under the lock so a racing complete() cannot strand us.
        if self.inner.completed.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Marks the task completed and runs the registered hooks once.
    /// Idempotent: later calls are no-ops.
    pub fn complete(&self) {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks: Vec<CompletionHook> =
            std::mem::take(&mut *self.inner.hooks.lock().unwrap());
        for hook in hooks {
            hook();
        }
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.inner.metrics
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported by the worker's timing frames.
#[derive(Default)]
pub struct TaskMetrics {
    memory_bytes_spilled: AtomicI64,
    disk_bytes_spilled: AtomicI64,
}

impl TaskMetrics {
    pub fn add_memory_bytes_spilled(&self, bytes: i64) {
        self.memory_bytes_spilled.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn add_disk_bytes_spilled(&self, bytes: i64) {
        self.disk_bytes_spilled.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn memory_bytes_spilled(&self) -> i64 {
        self.memory_bytes_spilled.load(Ordering::SeqCst)
    }

    pub fn disk_bytes_spilled(&self) -> i64 {
        self.disk_bytes_spilled.load(Ordering::SeqCst)
    }
}
