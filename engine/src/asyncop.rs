//! Pollable async operations.
//!
//! An operation captures multi-frame work a node cannot finish inside one
//! processing call: waiting on a parallel task, pulling a value out of a
//! derived sibling context, or gathering a list of sources. Operations are
//! plain enum-driven state machines, pooled and reset between uses so
//! steady-state polling does not allocate.

use uuid::Uuid;

use crate::context::ContextId;
use crate::error::EngineError;
use crate::plan::Resolution;
use crate::pool::{ArenaPool, Poolable};
use crate::schedule::OpCtx;
use crate::task::TaskHandle;

/// A multi-frame unit of node work, polled once per scheduler tick.
pub trait AsyncOperation: Send + 'static {
    /// Advance the operation. `Ok(true)` means finished: outputs are written
    /// and the owning node becomes `Done`. `Ok(false)` means poll again next
    /// tick. Under forced completion a poll must do whatever blocking is
    /// needed to finish.
    fn poll(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError>;

    /// Clear captured state so the object can be reused.
    fn reset(&mut self);

    /// Return this operation to the pool.
    fn recycle(self: Box<Self>, pool: &mut ArenaPool);
}

/// Resample a square patch into an existing buffer by nearest sample.
///
/// Straight copy when the resolutions match. Good enough for the runtime's
/// own cross-context copies; operators needing filtered rescaling do it in
/// task work.
pub fn resample_into(src: &[f32], src_res: Resolution, dst: &mut [f32], dst_res: Resolution) {
    if src_res == dst_res {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }
    let se = src_res.edge();
    let de = dst_res.edge();
    for y in 0..de {
        let sy = if de > 1 { y * (se - 1) / (de - 1) } else { 0 };
        for x in 0..de {
            let sx = if de > 1 { x * (se - 1) / (de - 1) } else { 0 };
            dst[y * de + x] = src[sy * se + sx];
        }
    }
}

/// [`resample_into`] against a fresh buffer.
pub fn resample(src: &[f32], src_res: Resolution, dst_res: Resolution) -> Vec<f32> {
    let mut out = vec![0.0; dst_res.samples()];
    resample_into(src, src_res, &mut out, dst_res);
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum WaitState {
    #[default]
    Waiting,
    Finished,
}

/// Completes when a scheduled task handle does, then moves the task's result
/// into the target node output.
#[derive(Default)]
pub struct TaskWait {
    state: WaitState,
    handle: Option<TaskHandle>,
    target: Option<(Uuid, String)>,
}

impl TaskWait {
    pub fn begin(&mut self, handle: TaskHandle, node_id: Uuid, port_name: &str) {
        self.state = WaitState::Waiting;
        self.handle = Some(handle);
        self.target = Some((node_id, port_name.to_string()));
    }
}

impl Poolable for TaskWait {
    fn reset(&mut self) {
        self.state = WaitState::Waiting;
        self.handle = None;
        self.target = None;
    }
}

impl AsyncOperation for TaskWait {
    fn poll(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError> {
        if self.state == WaitState::Finished {
            return Ok(true);
        }
        let Some(handle) = self.handle.clone() else {
            log::error!("task wait polled before begin");
            return Ok(true);
        };

        if cx.forced() {
            handle.join();
        }
        if !handle.is_complete() {
            return Ok(false);
        }

        if let Some((node_id, port_name)) = self.target.take() {
            match handle.take_result() {
                Some(output) => {
                    cx.write_output(node_id, &port_name, &output.result);
                    cx.recycle(output.result);
                    for buf in output.reclaim {
                        cx.recycle(buf);
                    }
                }
                None => log::error!(
                    "task result for {}.{} already taken; output degraded",
                    node_id,
                    port_name
                ),
            }
        }
        self.state = WaitState::Finished;
        Ok(true)
    }

    fn reset(&mut self) {
        Poolable::reset(self);
    }

    fn recycle(mut self: Box<Self>, pool: &mut ArenaPool) {
        if let Some(handle) = self.handle.take() {
            // Never abandon a running task.
            handle.join();
            if let Some(output) = handle.take_result() {
                pool.release_buffer(output.result);
                for buf in output.reclaim {
                    pool.release_buffer(buf);
                }
            }
        }
        pool.release(*self);
    }
}

/// Pulls one node output out of another context of the same tree into a node
/// output of the current context, resampling if the contexts were planned at
/// different resolutions.
///
/// Polling the source node happens through the current walk, so the copy
/// shares its depth budget and cycle guard.
#[derive(Default)]
pub struct ContextCopy {
    src: Option<(ContextId, Uuid, String)>,
    dst: Option<(Uuid, String)>,
    finished: bool,
}

impl ContextCopy {
    pub fn begin(
        &mut self,
        src_ctx: ContextId,
        src_node: Uuid,
        src_port: &str,
        dst_node: Uuid,
        dst_port: &str,
    ) {
        self.src = Some((src_ctx, src_node, src_port.to_string()));
        self.dst = Some((dst_node, dst_port.to_string()));
        self.finished = false;
    }
}

impl Poolable for ContextCopy {
    fn reset(&mut self) {
        self.src = None;
        self.dst = None;
        self.finished = false;
    }
}

impl AsyncOperation for ContextCopy {
    fn poll(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError> {
        if self.finished {
            return Ok(true);
        }
        let Some((src_ctx, src_node, ref src_port)) = self.src else {
            log::error!("context copy polled before begin");
            return Ok(true);
        };

        if !cx.poll_dependency(src_ctx, src_node)? {
            return Ok(false);
        }

        let Some((dst_node, ref dst_port)) = self.dst else {
            return Ok(true);
        };
        match cx.read_slot(src_ctx, src_node, src_port) {
            Some((samples, src_res)) => {
                let dst_res = cx
                    .slot(dst_node, dst_port)
                    .map(|s| s.resolution)
                    .unwrap_or(src_res);
                let out = resample(&samples, src_res, dst_res);
                cx.write_output(dst_node, dst_port, &out);
                cx.recycle(samples);
                cx.recycle(out);
            }
            None => log::error!(
                "context copy source {}.{} has no slot; output degraded",
                src_node,
                src_port
            ),
        }
        self.finished = true;
        Ok(true)
    }

    fn reset(&mut self) {
        Poolable::reset(self);
    }

    fn recycle(mut self: Box<Self>, pool: &mut ArenaPool) {
        Poolable::reset(&mut *self);
        pool.release(*self);
    }
}

/// Collects sample buffers from a set of sources, preserving source order
/// regardless of the order they complete in.
#[derive(Default)]
pub struct GatherList {
    sources: Vec<(ContextId, Uuid, String)>,
    collected: Vec<Option<(Vec<f32>, Resolution)>>,
}

impl GatherList {
    pub fn begin(&mut self, sources: Vec<(ContextId, Uuid, String)>) {
        self.collected = sources.iter().map(|_| None).collect();
        self.sources = sources;
    }

    /// True once every source has been collected.
    pub fn advance(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError> {
        let mut all = true;
        for (i, (src_ctx, src_node, src_port)) in self.sources.iter().enumerate() {
            if self.collected[i].is_some() {
                continue;
            }
            if !cx.poll_dependency(*src_ctx, *src_node)? {
                all = false;
                continue;
            }
            match cx.read_slot(*src_ctx, *src_node, src_port) {
                Some(copy) => self.collected[i] = Some(copy),
                None => {
                    log::error!(
                        "gather source {}.{} has no slot; entry degraded to empty",
                        src_node,
                        src_port
                    );
                    self.collected[i] = Some((Vec::new(), Resolution(0)));
                }
            }
        }
        Ok(all)
    }

    /// Move the collected buffers out, in source order. Only valid after
    /// `advance` returned true.
    pub fn take_collected(&mut self) -> Vec<(Vec<f32>, Resolution)> {
        self.sources.clear();
        self.collected.drain(..).flatten().collect()
    }
}

impl Poolable for GatherList {
    fn reset(&mut self) {
        self.sources.clear();
        self.collected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let src = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&src, Resolution(1), Resolution(1)), src);
    }

    #[test]
    fn test_resample_preserves_corners() {
        // 3x3 patch down to 2x2: corners survive nearest resampling.
        let src = vec![
            1.0, 0.0, 2.0, //
            0.0, 9.0, 0.0, //
            3.0, 0.0, 4.0,
        ];
        let out = resample(&src, Resolution(2), Resolution(1));
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_resample_upscale_len() {
        let src = vec![5.0; Resolution(2).samples()];
        let out = resample(&src, Resolution(2), Resolution(4));
        assert_eq!(out.len(), Resolution(4).samples());
        assert!(out.iter().all(|&v| v == 5.0));
    }
}
