use uuid::Uuid;

use crate::asyncop::{resample, AsyncOperation, GatherList};
use crate::context::ContextId;
use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::pool::{ArenaPool, Poolable};
use crate::schedule::OpCtx;

/// Sums every connection on its list input, in connection order.
///
/// No connections means a zero field, not an error.
pub struct Combine;

impl Operator for Combine {
    fn type_id(&self) -> &'static str {
        "terrain.combine"
    }

    fn inputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::input("values", "Values", PortDataType::Height).as_list()]
    }

    fn outputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::output("height", "Height", PortDataType::Height)]
    }

    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError> {
        let here = cx.ctx;
        let sources = cx
            .upstream_all(node.id, "values")
            .into_iter()
            .map(|(src_node, src_port)| (here, src_node, src_port))
            .collect();

        let mut sum: CombineSum = cx.acquire_op();
        sum.begin(node.id, sources);
        Ok(Progress::Pending(Box::new(sum)))
    }
}

/// Gathers every source buffer, then sums them into the output.
#[derive(Default)]
pub struct CombineSum {
    node: Option<Uuid>,
    gather: GatherList,
    finished: bool,
}

impl CombineSum {
    fn begin(&mut self, node_id: Uuid, sources: Vec<(ContextId, Uuid, String)>) {
        self.node = Some(node_id);
        self.gather.begin(sources);
        self.finished = false;
    }
}

impl Poolable for CombineSum {
    fn reset(&mut self) {
        self.node = None;
        Poolable::reset(&mut self.gather);
        self.finished = false;
    }
}

impl AsyncOperation for CombineSum {
    fn poll(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError> {
        if self.finished {
            return Ok(true);
        }
        if !self.gather.advance(cx)? {
            return Ok(false);
        }
        let Some(node_id) = self.node else {
            log::error!("combine sum polled before begin");
            return Ok(true);
        };
        let Some(slot) = cx.slot(node_id, "height") else {
            self.finished = true;
            return Ok(true);
        };

        let mut acc = cx.acquire_buffer(slot.len);
        for (buf, res) in self.gather.take_collected() {
            if buf.is_empty() {
                continue;
            }
            let term = resample(&buf, res, slot.resolution);
            for (a, v) in acc.iter_mut().zip(&term) {
                *a += v;
            }
            cx.recycle(buf);
        }
        cx.write_output(node_id, "height", &acc);
        cx.recycle(acc);
        self.finished = true;
        Ok(true)
    }

    fn reset(&mut self) {
        Poolable::reset(self);
    }

    fn recycle(self: Box<Self>, pool: &mut ArenaPool) {
        pool.release(*self);
    }
}
