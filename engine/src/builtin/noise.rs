use crate::error::EngineError;
use crate::model::{GraphNode, PortDataType, PortDefinition};
use crate::operator::{Operator, Progress};
use crate::schedule::OpCtx;

/// Deterministic value noise.
///
/// Samples are a pure function of the absolute sample coordinate (context
/// origin plus grid position), the node's seed-derived lookup table and the
/// `scale` parameter, so neighboring chunks line up and repeated generation
/// is bit-identical. The 256-entry table lives in the engine's shared value
/// cache, keyed by (node id, seed).
pub struct Noise;

fn build_table(seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..256)
        .map(|_| {
            state = state.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            z ^= z >> 31;
            (z >> 40) as f32 / (1u64 << 24) as f32
        })
        .collect()
}

fn cell_hash(gx: i64, gy: i64) -> usize {
    let mut h = (gx as u64).wrapping_mul(0x9E3779B97F4A7C15)
        ^ (gy as u64).wrapping_mul(0xC2B2AE3D27D4EB4F);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51AFD7ED558CCD);
    h ^= h >> 33;
    (h & 255) as usize
}

impl Operator for Noise {
    fn type_id(&self) -> &'static str {
        "terrain.noise"
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
        let scale = node.param_scalar("scale", 1.0);
        let seed = cx.seed();
        let origin = cx.origin();
        let table =
            cx.shared_table((node.id, seed), || build_table(seed ^ node.id.as_u128() as u64));

        let edge = slot.resolution.edge();
        let mut buf = cx.acquire_buffer(slot.len);
        for y in 0..edge {
            let wy = ((origin.y.0 + y as f64) * scale).floor() as i64;
            for x in 0..edge {
                let wx = ((origin.x.0 + x as f64) * scale).floor() as i64;
                buf[y * edge + x] = table[cell_hash(wx, wy)];
            }
        }
        cx.write_output(node.id, "height", &buf);
        cx.recycle(buf);
        Ok(Progress::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_seed_dependent_and_in_range() {
        let a = build_table(1);
        let b = build_table(1);
        let c = build_table(2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_cell_hash_varies_per_axis() {
        assert_ne!(cell_hash(0, 1), cell_hash(1, 0));
        assert_eq!(cell_hash(-3, 7), cell_hash(-3, 7));
    }
}
