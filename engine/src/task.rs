//! Parallel task handles and the task system abstraction.
//!
//! The cooperative scheduler never runs numeric work itself; it schedules
//! closures on a [`TaskSystem`] and polls the returned opaque handles. A task
//! produces its result into its own buffer, and the result is *moved* out on
//! completion, so a task can never write into arena memory that has since
//! been reassigned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// What a completed task hands back to the poller.
///
/// `reclaim` carries pooled input buffers the work took ownership of; the
/// poller recycles them so moving inputs into a task never leaks an
/// allocation out of the pool.
#[derive(Debug, Default, PartialEq)]
pub struct TaskOutput {
    pub result: Vec<f32>,
    pub reclaim: Vec<Vec<f32>>,
}

impl From<Vec<f32>> for TaskOutput {
    fn from(result: Vec<f32>) -> Self {
        Self {
            result,
            reclaim: Vec::new(),
        }
    }
}

/// Work scheduled on a task system: computes a sample buffer.
pub type TaskWork = Box<dyn FnOnce() -> TaskOutput + Send + 'static>;

struct TaskShared {
    done: AtomicBool,
    result: Mutex<Option<TaskOutput>>,
    cond: Condvar,
}

impl TaskShared {
    fn finish(&self, result: TaskOutput) {
        let mut slot = self.result.lock().unwrap();
        *slot = Some(result);
        self.done.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

/// Opaque handle to a unit of parallel work.
///
/// Cheap to clone; combined handles report completion once every member is
/// complete.
#[derive(Clone)]
pub enum TaskHandle {
    Leaf(Arc<TaskShared>),
    All(Arc<Vec<TaskHandle>>),
}

impl TaskHandle {
    fn new_pending() -> (TaskHandle, Arc<TaskShared>) {
        let shared = Arc::new(TaskShared {
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        (TaskHandle::Leaf(shared.clone()), shared)
    }

    /// A handle that is complete once every member handle is complete.
    pub fn combine(handles: Vec<TaskHandle>) -> TaskHandle {
        TaskHandle::All(Arc::new(handles))
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> bool {
        match self {
            TaskHandle::Leaf(shared) => shared.done.load(Ordering::Acquire),
            TaskHandle::All(handles) => handles.iter().all(|h| h.is_complete()),
        }
    }

    /// Block the calling thread until the task completes.
    pub fn join(&self) {
        match self {
            TaskHandle::Leaf(shared) => {
                if shared.done.load(Ordering::Acquire) {
                    return;
                }
                let mut slot = shared.result.lock().unwrap();
                while !shared.done.load(Ordering::Acquire) {
                    slot = shared.cond.wait(slot).unwrap();
                }
            }
            TaskHandle::All(handles) => {
                for handle in handles.iter() {
                    handle.join();
                }
            }
        }
    }

    /// Move the output out of a completed leaf handle.
    ///
    /// Returns `None` if the task is not complete, the output was already
    /// taken, or this is a combined handle.
    pub fn take_result(&self) -> Option<TaskOutput> {
        match self {
            TaskHandle::Leaf(shared) => {
                if !shared.done.load(Ordering::Acquire) {
                    return None;
                }
                shared.result.lock().unwrap().take()
            }
            TaskHandle::All(_) => None,
        }
    }
}

/// Schedules units of parallel work over sample buffers.
pub trait TaskSystem: Send + Sync {
    /// Schedule `work` to run after every handle in `deps` completes.
    fn schedule(&self, deps: Vec<TaskHandle>, work: TaskWork) -> TaskHandle;
}

/// Production task system backed by the rayon thread pool.
pub struct RayonTaskSystem;

impl TaskSystem for RayonTaskSystem {
    fn schedule(&self, deps: Vec<TaskHandle>, work: TaskWork) -> TaskHandle {
        let (handle, shared) = TaskHandle::new_pending();
        rayon::spawn(move || {
            for dep in &deps {
                dep.join();
            }
            shared.finish(work());
        });
        handle
    }
}

/// Deterministic task system that runs work at schedule time, on the calling
/// thread. For tests and anywhere reproducible frame counts matter more than
/// parallelism.
pub struct InlineTaskSystem;

impl TaskSystem for InlineTaskSystem {
    fn schedule(&self, deps: Vec<TaskHandle>, work: TaskWork) -> TaskHandle {
        for dep in &deps {
            dep.join();
        }
        let (handle, shared) = TaskHandle::new_pending();
        shared.finish(work());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_inline_system_completes_at_schedule() {
        let system = InlineTaskSystem;
        let handle = system.schedule(Vec::new(), Box::new(|| vec![1.0, 2.0].into()));
        assert!(handle.is_complete());
        assert_eq!(handle.take_result().map(|o| o.result), Some(vec![1.0, 2.0]));
        assert_eq!(handle.take_result(), None);
    }

    #[test]
    fn test_rayon_system_join_and_take() {
        let system = RayonTaskSystem;
        let handle = system.schedule(
            Vec::new(),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(20));
                vec![3.0].into()
            }),
        );
        handle.join();
        assert!(handle.is_complete());
        assert_eq!(handle.take_result().map(|o| o.result), Some(vec![3.0]));
    }

    #[test]
    fn test_take_result_hands_back_reclaim_buffers() {
        let system = InlineTaskSystem;
        let input = vec![7.0; 4];
        let handle = system.schedule(
            Vec::new(),
            Box::new(move || TaskOutput {
                result: vec![input.iter().sum()],
                reclaim: vec![input],
            }),
        );
        let output = handle.take_result().unwrap();
        assert_eq!(output.result, vec![28.0]);
        assert_eq!(output.reclaim, vec![vec![7.0; 4]]);
    }

    #[test]
    fn test_dependencies_run_first() {
        let system = RayonTaskSystem;
        let first = system.schedule(
            Vec::new(),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(10));
                vec![1.0].into()
            }),
        );
        let second = system.schedule(vec![first.clone()], Box::new(|| vec![2.0].into()));
        second.join();
        assert!(first.is_complete());
        assert!(second.is_complete());
    }

    #[test]
    fn test_combined_handle_waits_for_all() {
        let system = RayonTaskSystem;
        let a = system.schedule(
            Vec::new(),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(15));
                vec![1.0].into()
            }),
        );
        let b = system.schedule(Vec::new(), Box::new(|| vec![2.0].into()));
        let all = TaskHandle::combine(vec![a.clone(), b.clone()]);
        all.join();
        assert!(all.is_complete());
        assert!(a.is_complete() && b.is_complete());
    }
}
