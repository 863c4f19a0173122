//! Tree lifecycle hooks.
//!
//! Collaborators register callbacks that fire whenever any context in any
//! tree is created or closed, and use them to lazily attach auxiliary
//! per-context state (point-placement grids, normal caches) through the
//! context's aux slots. The core never knows what that state is.

use std::sync::RwLock;

use crate::context::ExecutionContext;

pub type InitHook = Box<dyn Fn(&mut ExecutionContext, Option<&ExecutionContext>) + Send + Sync>;
pub type CloseHook = Box<dyn Fn(&mut ExecutionContext) + Send + Sync>;

#[derive(Default)]
pub struct LifecycleHooks {
    init: RwLock<Vec<InitHook>>,
    close: RwLock<Vec<CloseHook>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked after a context is created; `parent` is the context it was
    /// derived from, if any.
    pub fn on_context_initialized(&self, hook: InitHook) {
        self.init.write().unwrap().push(hook);
    }

    /// Invoked before a context releases its state back to the pool. Each
    /// closer is responsible for detaching its own aux state.
    pub fn on_context_closed(&self, hook: CloseHook) {
        self.close.write().unwrap().push(hook);
    }

    pub fn notify_initialized(&self, ctx: &mut ExecutionContext, parent: Option<&ExecutionContext>) {
        for hook in self.init.read().unwrap().iter() {
            hook(ctx, parent);
        }
    }

    pub fn notify_closed(&self, ctx: &mut ExecutionContext) {
        for hook in self.close.read().unwrap().iter() {
            hook(ctx);
        }
    }
}
