use crate::asyncop::TaskWait;
use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::plan::Resolution;
use crate::schedule::OpCtx;
use crate::task::TaskOutput;

/// 3x3 box blur, computed as a parallel task.
///
/// Plans its input two samples larger than its own output so the kernel has
/// a real border row on every side instead of clamped edge repeats.
pub struct Blur;

fn box_blur(src: &[f32], src_res: Resolution, dst_res: Resolution) -> Vec<f32> {
    let se = src_res.edge() as isize;
    let de = dst_res.edge() as isize;
    let mut out = vec![0.0; dst_res.samples()];
    for y in 0..de {
        for x in 0..de {
            // Planned padding puts the output patch one sample inside the
            // source; degrade to clamped center mapping otherwise.
            let (sx, sy) = if se == de + 2 {
                (x + 1, y + 1)
            } else if de > 1 {
                (x * (se - 1) / (de - 1), y * (se - 1) / (de - 1))
            } else {
                (0, 0)
            };
            let mut sum = 0.0;
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    let px = (sx + dx).clamp(0, se - 1);
                    let py = (sy + dy).clamp(0, se - 1);
                    sum += src[(py * se + px) as usize];
                }
            }
            out[(y * de + x) as usize] = sum / 9.0;
        }
    }
    out
}

impl Operator for Blur {
    fn type_id(&self) -> &'static str {
        "terrain.blur"
    }

    fn inputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::input("input", "Input", PortDataType::Height)]
    }

    fn outputs(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::output("height", "Height", PortDataType::Height)]
    }

    fn input_resolution(&self, _input: &str, requested: Resolution) -> Resolution {
        requested.padded(2)
    }

    fn process(&self, node: &GraphNode, cx: &mut OpCtx<'_>) -> Result<Progress, EngineError> {
        let Some(slot) = cx.slot(node.id, "height") else {
            return Ok(Progress::Done);
        };
        let out_res = slot.resolution;
        let (src, src_res) = cx.input_samples(node.id, "input", out_res.padded(2));

        // The pooled source snapshot rides back in the task output so the
        // wait can recycle it.
        let handle = cx.spawn_task(
            Vec::new(),
            Box::new(move || TaskOutput {
                result: box_blur(&src, src_res, out_res),
                reclaim: vec![src],
            }),
        );
        let mut wait: TaskWait = cx.acquire_op();
        wait.begin(handle, node.id, "height");
        Ok(Progress::Pending(Box::new(wait)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_blur_flat_field_stays_flat() {
        let src = vec![2.0; Resolution(6).samples()];
        let out = box_blur(&src, Resolution(6), Resolution(4));
        assert_eq!(out.len(), Resolution(4).samples());
        assert!(out.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_box_blur_spreads_impulse() {
        // Impulse at the source sample behind output (0, 0).
        let src_res = Resolution(4);
        let mut src = vec![0.0; src_res.samples()];
        src[src_res.edge() + 1] = 9.0;
        let out = box_blur(&src, src_res, Resolution(2));

        let de = Resolution(2).edge();
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!((out[de] - 1.0).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
    }
}
