//! Engine entry points: request creation, polling, forced completion,
//! disposal and output readback.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use uuid::Uuid;

use crate::context::{ExecutionContext, PortValue};
use crate::hooks::LifecycleHooks;
use crate::model::{Graph, Vec2};
use crate::operator::OperatorRegistry;
use crate::plan::{PlanCache, Resolution};
use crate::pool::ArenaPool;
use crate::schedule;
use crate::task::{RayonTaskSystem, TaskSystem};
use crate::tree::{ContextTree, ROOT};
use crate::util::ScopedTimer;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Recursion budget per top-level poll; deeper chains resume from a
    /// checkpoint on the next poll.
    pub depth_budget: usize,
    /// Capacity of the shared context-independent value cache.
    pub shared_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            depth_budget: 64,
            shared_cache_capacity: 128,
        }
    }
}

/// LRU cache of context-independent sample tables, keyed by (node id, seed).
///
/// Operators use it for lookup tables that are pure functions of node
/// identity and seed, safe to share across every tree and context.
pub struct SharedValueCache {
    inner: Mutex<LruCache<(Uuid, u64), Arc<Vec<f32>>>>,
}

impl SharedValueCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_insert_with(
        &self,
        key: (Uuid, u64),
        build: impl FnOnce() -> Vec<f32>,
    ) -> Arc<Vec<f32>> {
        let mut cache = self.inner.lock().unwrap();
        cache.get_or_insert(key, || Arc::new(build())).clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared services behind every request: the operator registry, plan cache,
/// recycling pools, task system, shared value cache and lifecycle hooks.
pub struct EngineServices {
    pub registry: Arc<OperatorRegistry>,
    pub plans: Mutex<PlanCache>,
    pub pools: Mutex<ArenaPool>,
    pub tasks: Arc<dyn TaskSystem>,
    pub shared: SharedValueCache,
    pub hooks: LifecycleHooks,
    pub config: EngineConfig,
}

/// A value read back from a completed (or force-completed) request.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputValue {
    Samples(Vec<f32>),
    Scalar(f64),
    Integer(i64),
    List(Vec<OutputValue>),
    /// The node never produced this output. After forced completion this is
    /// what non-converged outputs read as.
    Missing,
}

pub struct Engine {
    services: EngineServices,
}

impl Engine {
    /// Engine with the builtin terrain operators and the rayon task system.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            Arc::new(OperatorRegistry::with_builtins()),
            Arc::new(RayonTaskSystem),
            config,
        )
    }

    pub fn with_parts(
        registry: Arc<OperatorRegistry>,
        tasks: Arc<dyn TaskSystem>,
        config: EngineConfig,
    ) -> Self {
        Self {
            services: EngineServices {
                registry,
                plans: Mutex::new(PlanCache::new()),
                pools: Mutex::new(ArenaPool::new()),
                tasks,
                shared: SharedValueCache::new(config.shared_cache_capacity),
                hooks: LifecycleHooks::new(),
                config,
            },
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.services.registry
    }

    pub fn on_context_initialized(&self, hook: crate::hooks::InitHook) {
        self.services.hooks.on_context_initialized(hook);
    }

    pub fn on_context_closed(&self, hook: crate::hooks::CloseHook) {
        self.services.hooks.on_context_closed(hook);
    }

    /// Create a generation request: plan (or reuse a cached plan for) the
    /// graph at `resolution` and build the root context of a fresh tree.
    pub fn create_request(
        &self,
        graph: &Arc<Graph>,
        resolution: Resolution,
        seed: u64,
        origin: Vec2,
    ) -> ContextTree {
        let _timer = ScopedTimer::debug_lazy(|| {
            format!("create request for graph {} at {:?}", graph.id, resolution)
        });

        let plan = {
            let mut plans = self.services.plans.lock().unwrap();
            plans.get_or_plan(graph, &self.services.registry, resolution)
        };
        let root = {
            let mut pool = self.services.pools.lock().unwrap();
            ExecutionContext::new(&mut pool, plan, seed, origin, None)
        };
        let mut tree = ContextTree::new(graph.clone(), root);
        self.services
            .hooks
            .notify_initialized(tree.context_mut(ROOT), None);
        tree
    }

    /// Advance the tree by one frame. Returns true once every root node is
    /// done; polling a finished tree is a cheap no-op that stays true.
    pub fn poll_tree(&self, tree: &mut ContextTree) -> bool {
        schedule::poll_tree(&self.services, tree)
    }

    /// Drive the tree to completion synchronously. Subsequent polls join
    /// tasks instead of deferring; if the tree still does not converge within
    /// a bounded number of polls, remaining outputs are left missing and the
    /// tree is marked done anyway.
    pub fn force_complete(&self, tree: &mut ContextTree) {
        tree.force_complete();

        // Each poll either finishes or moves the checkpoint deeper, so the
        // bound only trips on graphs that cannot converge at all.
        let max_polls = (self.services.config.depth_budget.max(1))
            * tree.graph().nodes.len().max(1)
            * tree.context_count().max(1)
            + 16;
        for _ in 0..max_polls {
            if self.poll_tree(tree) {
                return;
            }
        }
        log::error!(
            "tree {} did not converge under forced completion; outputs degraded to defaults",
            tree.id
        );
    }

    /// Close the tree and return all of its state to the pools.
    pub fn close_tree(&self, tree: &mut ContextTree) {
        let mut pool = self.services.pools.lock().unwrap();
        tree.close_all(&mut pool, &self.services.hooks);
    }

    /// Read one node output back from the tree's root context.
    pub fn read_output(&self, tree: &ContextTree, node_id: Uuid, port_name: &str) -> OutputValue {
        Self::port_value_to_output(tree.context(ROOT), tree.context(ROOT).value(node_id, port_name))
    }

    fn port_value_to_output(ctx: &ExecutionContext, value: Option<&PortValue>) -> OutputValue {
        match value {
            Some(PortValue::Buffer(slot)) => {
                OutputValue::Samples(ctx.arena_read(*slot).to_vec())
            }
            Some(PortValue::Scalar(v)) => OutputValue::Scalar(*v),
            Some(PortValue::Integer(v)) => OutputValue::Integer(*v),
            Some(PortValue::List(items)) => OutputValue::List(
                items
                    .iter()
                    .map(|item| Self::port_value_to_output(ctx, Some(item)))
                    .collect(),
            ),
            None => OutputValue::Missing,
        }
    }

    /// Drop all recycled objects and buffers. Outstanding contexts are
    /// unaffected; they return their state to a now-smaller pool on close.
    pub fn clear_pools(&self) {
        self.services.pools.lock().unwrap().clear();
    }
}
