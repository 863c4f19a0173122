//! The context tree: one primary context plus every derived context spawned
//! while resolving it.

use std::sync::Arc;

use uuid::Uuid;

use crate::context::{ContextId, ExecutionContext};
use crate::hooks::LifecycleHooks;
use crate::model::Graph;
use crate::pool::ArenaPool;

/// The root context's id within any tree.
pub const ROOT: ContextId = ContextId(0);

/// The unit of polling and disposal for one generation request.
///
/// Derived contexts (alternate seed, resolution or origin) are registered on
/// the same tree so they share its forced-completion semantics and are closed
/// together, transactionally.
pub struct ContextTree {
    pub id: Uuid,
    graph: Arc<Graph>,
    contexts: Vec<ExecutionContext>,
    forced: bool,
    /// Resume point recorded when a poll hit the recursion budget.
    checkpoint: Option<(ContextId, Uuid)>,
    closed: bool,
}

impl ContextTree {
    pub fn new(graph: Arc<Graph>, root: ExecutionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph,
            contexts: vec![root],
            forced: false,
            checkpoint: None,
            closed: false,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn root(&self) -> ContextId {
        ROOT
    }

    pub fn context(&self, id: ContextId) -> &ExecutionContext {
        &self.contexts[id.0]
    }

    pub fn context_mut(&mut self, id: ContextId) -> &mut ExecutionContext {
        &mut self.contexts[id.0]
    }

    /// Disjoint mutable access to two contexts (e.g. copying a derived
    /// context's output into its parent).
    pub fn two_contexts_mut(
        &mut self,
        a: ContextId,
        b: ContextId,
    ) -> (&mut ExecutionContext, &mut ExecutionContext) {
        assert_ne!(a, b, "two_contexts_mut requires distinct contexts");
        if a.0 < b.0 {
            let (head, tail) = self.contexts.split_at_mut(b.0);
            (&mut head[a.0], &mut tail[0])
        } else {
            let (head, tail) = self.contexts.split_at_mut(a.0);
            (&mut tail[0], &mut head[b.0])
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Register a derived context and fire initializer hooks with its parent.
    pub fn add_context(&mut self, ctx: ExecutionContext, hooks: &LifecycleHooks) -> ContextId {
        let id = ContextId(self.contexts.len());
        self.contexts.push(ctx);

        let parent = self.contexts[id.0].parent;
        match parent {
            Some(parent_id) if parent_id.0 < id.0 => {
                let (head, tail) = self.contexts.split_at_mut(id.0);
                hooks.notify_initialized(&mut tail[0], Some(&head[parent_id.0]));
            }
            _ => {
                let ctx = &mut self.contexts[id.0];
                hooks.notify_initialized(ctx, None);
            }
        }
        id
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Switch the tree to forced completion: every subsequent poll of an
    /// async operation or task wait in this tree joins synchronously instead
    /// of returning "not ready".
    pub fn force_complete(&mut self) {
        self.forced = true;
    }

    pub fn take_checkpoint(&mut self) -> Option<(ContextId, Uuid)> {
        self.checkpoint.take()
    }

    pub fn set_checkpoint(&mut self, checkpoint: Option<(ContextId, Uuid)>) {
        self.checkpoint = checkpoint;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close every context in the tree, derived contexts first.
    ///
    /// Each context joins its outstanding parallel tasks before its arena is
    /// released; closer hooks run before the release so collaborators can
    /// detach their aux state.
    pub fn close_all(&mut self, pool: &mut ArenaPool, hooks: &LifecycleHooks) {
        if self.closed {
            log::warn!("tree {} closed twice", self.id);
            return;
        }
        for ctx in self.contexts.iter_mut().rev() {
            hooks.notify_closed(ctx);
            ctx.close(pool);
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::model::{GraphNode, ParamMap, PortId, Vec2};
    use crate::operator::OperatorRegistry;
    use crate::plan::{PathPlan, Resolution};
    use crate::task::{RayonTaskSystem, TaskSystem};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn test_tree() -> (ContextTree, ArenaPool) {
        let registry = OperatorRegistry::new();
        builtin::register_all(&registry);

        let mut graph = Graph::new("tree-test");
        let constant = graph.add_node(GraphNode::new("terrain.constant", ParamMap::new()));
        let norm = graph.add_node(GraphNode::new("terrain.normalize", ParamMap::new()));
        graph
            .connect(PortId::new(constant, "height"), PortId::new(norm, "input"))
            .unwrap();
        graph.add_root(norm);

        let plan = Arc::new(PathPlan::plan(&graph, &registry, Resolution(4)));
        let mut pool = ArenaPool::new();
        let root = ExecutionContext::new(&mut pool, plan, 7, Vec2::new(0.0, 0.0), None);
        (ContextTree::new(Arc::new(graph), root), pool)
    }

    #[test]
    fn test_close_joins_outstanding_tasks() {
        let (mut tree, mut pool) = test_tree();
        let hooks = LifecycleHooks::new();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = RayonTaskSystem.schedule(
            Vec::new(),
            Box::new(move || {
                std::thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::Release);
                Vec::new().into()
            }),
        );
        tree.context_mut(ROOT).add_task(handle.clone());

        tree.close_all(&mut pool, &hooks);
        assert!(tree.is_closed());
        // Close must have joined the task, not merely dropped the handle.
        assert!(handle.is_complete());
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_hooks_attach_and_detach_aux_state() {
        struct NormalCache(#[allow(dead_code)] Vec<f32>);

        let (mut tree, mut pool) = test_tree();
        let hooks = LifecycleHooks::new();
        hooks.on_context_initialized(Box::new(|ctx, _parent| {
            ctx.aux_set(NormalCache(Vec::new()));
        }));
        let detached = Arc::new(AtomicBool::new(false));
        let flag = detached.clone();
        hooks.on_context_closed(Box::new(move |ctx| {
            if ctx.aux_take::<NormalCache>().is_some() {
                flag.store(true, Ordering::Release);
            }
        }));

        let plan = tree.context(ROOT).plan().clone();
        let derived = ExecutionContext::new(&mut pool, plan, 8, Vec2::new(1.0, 1.0), Some(ROOT));
        let id = tree.add_context(derived, &hooks);
        assert!(tree.context(id).aux_get::<NormalCache>().is_some());

        tree.close_all(&mut pool, &hooks);
        assert!(detached.load(Ordering::Acquire));
    }

    #[test]
    fn test_two_contexts_mut_disjoint() {
        let (mut tree, mut pool) = test_tree();
        let hooks = LifecycleHooks::new();
        let plan = tree.context(ROOT).plan().clone();
        let derived = ExecutionContext::new(&mut pool, plan, 9, Vec2::new(0.0, 0.0), Some(ROOT));
        let id = tree.add_context(derived, &hooks);

        let (a, b) = tree.two_contexts_mut(ROOT, id);
        assert_ne!(a.id, b.id);

        tree.close_all(&mut pool, &hooks);
    }
}
