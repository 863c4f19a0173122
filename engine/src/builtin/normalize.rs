use crate::asyncop::resample_into;
use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::schedule::OpCtx;

/// Rescales its input to the [0, 1] range.
///
/// Works in a context scratch buffer, so the staging memory is handed back
/// with the context's pack and reused by the next same-shape pass. A
/// degenerate input (constant, empty) has no range to stretch; the output
/// clamps to all ones rather than dividing by zero.
pub struct Normalize;

impl Operator for Normalize {
    fn type_id(&self) -> &'static str {
        "terrain.normalize"
    }

    fn inputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::input("input", "Input", PortDataType::Height)]
    }

    fn outputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::output("height", "Height", PortDataType::Height)]
    }

    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError> {
        let Some(slot) = cx.slot(node.id, "height") else {
            return Ok(Progress::Done);
        };
        let (src, src_res) = cx.input_samples(node.id, "input", slot.resolution);

        let staged = cx.scratch_acquire(slot.len);
        let out = cx.scratch_mut(staged);
        resample_into(&src, src_res, out, slot.resolution);

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in out.iter() {
            min = min.min(v);
            max = max.max(v);
        }
        let range = max - min;
        if !range.is_finite() || range < 1e-6 {
            out.fill(1.0);
        } else {
            for v in out.iter_mut() {
                *v = (*v - min) / range;
            }
        }

        cx.write_scratch_output(node.id, "height", staged);
        cx.recycle(src);
        Ok(Progress::Done)
    }
}
