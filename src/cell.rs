// ============================================================================
// RECURRENT CELL
// h_t = clip(h_{t-1}·Wh + embed(mark_t)·Wy + time_t·Wt + bh, 0, 1e6)
// ============================================================================

use crate::graph::{Graph, TID};
use crate::params::ParamStore;

pub const STATE_FLOOR: f32 = 0.0;
pub const STATE_CEIL: f32 = 1e6;

/// Record one step of the cell. `h_prev` is [B,H]; `mark` and `time` are [B,1]
/// input columns. Returns the new [B,H] state.
///
/// The cell never resets state. Chunk-to-chunk hand-off is the caller's job.
pub fn step(g: &mut Graph, p: &ParamStore, h_prev: TID, mark: TID, time: TID) -> TID {
    let recur = g.matmul(h_prev, p.w_state);
    let embedded = g.gather(p.w_embed, mark);
    let from_mark = g.matmul(embedded, p.w_proj);
    let from_time = g.matmul(time, p.w_time);
    let pre = g.add(recur, from_mark);
    let pre = g.add(pre, from_time);
    let pre = g.broadcast_add(pre, p.b_state);
    g.clamp(pre, STATE_FLOOR, STATE_CEIL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup(h: usize, e: usize, k: usize) -> (Graph, ParamStore) {
        let mut g = Graph::new();
        let p = ParamStore::new(h, e, k, &mut g, &mut ChaCha8Rng::seed_from_u64(11));
        (g, p)
    }

    #[test]
    fn matches_hand_computed_update() {
        let (mut g, p) = setup(2, 2, 2);
        g.bind(p.w_state, &[0.5, 0.0, 0.0, 0.5]);
        g.bind(p.w_embed, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        g.bind(p.w_proj, &[1.0, 2.0, 3.0, 4.0]);
        g.bind(p.w_time, &[0.1, -0.1]);
        g.bind(p.b_state, &[0.0, 0.0]);

        let h0 = g.input(1, 2);
        let mark = g.input(1, 1);
        let time = g.input(1, 1);
        let h1 = step(&mut g, &p, h0, mark, time);
        g.bind(h0, &[2.0, 4.0]);
        g.bind(mark, &[2.0]);
        g.bind(time, &[10.0]);
        g.forward();
        // [1, 2] + [3, 4] + [1, -1]
        assert_eq!(g.data(h1), &[5.0, 5.0]);
    }

    #[test]
    fn state_is_clipped_to_the_non_negative_range() {
        let (mut g, p) = setup(3, 2, 2);
        let h0 = g.input(2, 3);
        let mark = g.input(2, 1);
        let time = g.input(2, 1);
        let h1 = step(&mut g, &p, h0, mark, time);
        g.bind(h0, &[1e7, -1e7, 0.5, -3.0, 2e6, 0.0]);
        g.bind(mark, &[1.0, 0.0]);
        g.bind(time, &[1e5, -1e5]);
        g.forward();
        assert!(g.data(h1).iter().all(|&v| (STATE_FLOOR..=STATE_CEIL).contains(&v)));
    }

    #[test]
    fn padding_mark_uses_embedding_row_zero() {
        let (mut g, p) = setup(2, 2, 2);
        g.bind(p.w_state, &[0.0; 4]);
        g.bind(p.w_time, &[0.0, 0.0]);
        g.bind(p.b_state, &[0.0, 0.0]);
        g.bind(p.w_proj, &[1.0, 0.0, 0.0, 1.0]);
        g.bind(p.w_embed, &[0.25, 0.5, 9.0, 9.0, 9.0, 9.0]);
        let h0 = g.input(1, 2);
        let mark = g.input(1, 1);
        let time = g.input(1, 1);
        let h1 = step(&mut g, &p, h0, mark, time);
        g.bind(mark, &[0.0]);
        g.forward();
        assert_eq!(g.data(h1), &[0.25, 0.5]);
    }
}
