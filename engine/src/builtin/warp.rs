use uuid::Uuid;

use crate::asyncop::{AsyncOperation, ContextCopy};
use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::pool::{ArenaPool, Poolable};
use crate::schedule::{ContextOverrides, OpCtx};

/// Produces a pair of offset fields by evaluating its source in two derived
/// sibling contexts, one at the request seed and one at seed + 1, then
/// remapping the [0, 1] source values to signed offsets scaled by the
/// `amplitude` parameter.
pub struct Warp;

impl Operator for Warp {
    fn type_id(&self) -> &'static str {
        "terrain.warp"
    }

    fn inputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::input("source", "Source", PortDataType::Height)]
    }

    fn outputs(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::output("offset_x", "Offset X", PortDataType::Height),
            PortDefinition::output("offset_y", "Offset Y", PortDataType::Height),
        ]
    }

    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError> {
        let Some((src_node, src_port)) = cx.upstream(node.id, "source") else {
            log::warn!("warp node {} has no source; offsets are zero", node.id);
            for port in ["offset_x", "offset_y"] {
                if let Some(slot) = cx.slot(node.id, port) {
                    let zeros = cx.acquire_buffer(slot.len);
                    cx.write_output(node.id, port, &zeros);
                    cx.recycle(zeros);
                }
            }
            return Ok(Progress::Done);
        };

        let mut fields: WarpFields = cx.acquire_op();
        fields.begin(node.id, src_node, &src_port, node.param_scalar("amplitude", 1.0));
        Ok(Progress::Pending(Box::new(fields)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum WarpState {
    #[default]
    Derive,
    Copy,
    Remap,
    Finished,
}

/// The warp's multi-frame body: derive two sibling contexts, copy the source
/// field out of each, remap to signed amplitude-scaled offsets.
#[derive(Default)]
pub struct WarpFields {
    state: WarpState,
    node: Option<Uuid>,
    source: Option<(Uuid, String)>,
    amplitude: f64,
    copies: Vec<ContextCopy>,
}

impl WarpFields {
    fn begin(&mut self, node_id: Uuid, src_node: Uuid, src_port: &str, amplitude: f64) {
        self.state = WarpState::Derive;
        self.node = Some(node_id);
        self.source = Some((src_node, src_port.to_string()));
        self.amplitude = amplitude;
        self.copies.clear();
    }
}

impl Poolable for WarpFields {
    fn reset(&mut self) {
        self.state = WarpState::Derive;
        self.node = None;
        self.source = None;
        self.amplitude = 0.0;
        self.copies.clear();
    }
}

impl AsyncOperation for WarpFields {
    fn poll(&mut self, cx: &mut OpCtx<'_>) -> Result<bool, EngineError> {
        loop {
            match self.state {
                WarpState::Derive => {
                    let (Some(node_id), Some((src_node, src_port))) =
                        (self.node, self.source.clone())
                    else {
                        log::error!("warp fields polled before begin");
                        return Ok(true);
                    };
                    let seed = cx.seed();
                    let ctx_x = cx.derive(ContextOverrides {
                        seed: Some(seed),
                        ..Default::default()
                    });
                    let ctx_y = cx.derive(ContextOverrides {
                        seed: Some(seed.wrapping_add(1)),
                        ..Default::default()
                    });

                    let mut copy_x: ContextCopy = cx.acquire_op();
                    copy_x.begin(ctx_x, src_node, &src_port, node_id, "offset_x");
                    let mut copy_y: ContextCopy = cx.acquire_op();
                    copy_y.begin(ctx_y, src_node, &src_port, node_id, "offset_y");
                    self.copies = vec![copy_x, copy_y];
                    self.state = WarpState::Copy;
                }
                WarpState::Copy => {
                    let mut all = true;
                    for copy in &mut self.copies {
                        if !copy.poll(cx)? {
                            all = false;
                        }
                    }
                    if !all {
                        return Ok(false);
                    }
                    self.state = WarpState::Remap;
                }
                WarpState::Remap => {
                    let Some(node_id) = self.node else {
                        return Ok(true);
                    };
                    let amplitude = self.amplitude as f32;
                    for port in ["offset_x", "offset_y"] {
                        if let Some((mut samples, _)) = cx.read_slot(cx.ctx, node_id, port) {
                            for v in &mut samples {
                                *v = (*v * 2.0 - 1.0) * amplitude;
                            }
                            cx.write_output(node_id, port, &samples);
                            cx.recycle(samples);
                        }
                    }
                    self.state = WarpState::Finished;
                    return Ok(true);
                }
                WarpState::Finished => return Ok(true),
            }
        }
    }

    fn reset(&mut self) {
        Poolable::reset(self);
    }

    fn recycle(mut self: Box<Self>, pool: &mut ArenaPool) {
        for copy in self.copies.drain(..) {
            pool.release(copy);
        }
        pool.release(*self);
    }
}
