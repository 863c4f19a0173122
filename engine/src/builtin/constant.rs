use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::schedule::OpCtx;

/// Fills its output with the `value` parameter.
pub struct Constant;

impl Operator for Constant {
    fn type_id(&self) -> &'static str {
        "terrain.constant"
    }

    fn inputs(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::output("height", "Height", PortDataType::Height)]
    }

    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError> {
        let Some(slot) = cx.slot(node.id, "height") else {
            return Ok(Progress::Done);
        };
        let value = node.param_scalar("value", 0.0) as f32;
        let mut buf = cx.acquire_buffer(slot.len);
        buf.fill(value);
        cx.write_output(node.id, "height", &buf);
        cx.recycle(buf);
        Ok(Progress::Done)
    }
}
