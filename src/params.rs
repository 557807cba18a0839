// ============================================================================
// PARAMETER STORE
// Named trainable tensors living as leaves of the compute plan.
// ============================================================================

use rand::Rng;

use crate::graph::{Graph, TID};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Init {
    /// U(-l, l) with l = sqrt(6 / (fan_in + fan_out)).
    GlorotUniform,
    /// U(-l, l) with l = sqrt(3 / fan_in).
    UnitScaling,
}

fn rand_uniform(n: usize, limit: f32, rng: &mut impl Rng) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-limit..limit)).collect()
}

fn draw(init: Init, rows: usize, cols: usize, rng: &mut impl Rng) -> Vec<f32> {
    let limit = match init {
        Init::GlorotUniform => (6.0 / (rows + cols) as f32).sqrt(),
        Init::UnitScaling => (3.0 / rows as f32).sqrt(),
    };
    rand_uniform(rows * cols, limit, rng)
}

/// Every trainable tensor of the model.
///
/// Row 0 of `w_embed` and column 0 of `v_mark` belong to the padding mark. They
/// receive gradients and updates like every other entry.
pub struct ParamStore {
    /// `Wh`, H×H state-to-state.
    pub w_state: TID,
    /// `Wem`, (K+1)×E mark embedding table.
    pub w_embed: TID,
    /// `Wy`, E×H embedding-to-state projection.
    pub w_proj: TID,
    /// `Wt`, 1×H time-to-state.
    pub w_time: TID,
    /// `bh`, 1×H.
    pub b_state: TID,
    /// `Vt`, H×1 state-to-time influence.
    pub v_time: TID,
    /// `wt`, 1×1 time decay.
    pub w_decay: TID,
    /// `bt`, 1×1 base intensity.
    pub b_time: TID,
    /// `Vy`, H×(K+1) state-to-logits.
    pub v_mark: TID,
    /// `bk`, 1×(K+1).
    pub b_mark: TID,
    inits: Vec<(&'static str, TID, Init)>,
}

impl ParamStore {
    pub fn new(hidden: usize, embed: usize, num_categories: usize, g: &mut Graph, rng: &mut impl Rng) -> Self {
        let classes = num_categories + 1;
        let mut inits = Vec::with_capacity(10);
        let mut make = |name, rows, cols, init| {
            let id = g.param(draw(init, rows, cols, rng), rows, cols);
            inits.push((name, id, init));
            id
        };

        let w_time = make("Wt", 1, hidden, Init::GlorotUniform);
        let w_embed = make("Wem", classes, embed, Init::GlorotUniform);
        let w_state = make("Wh", hidden, hidden, Init::GlorotUniform);
        let b_state = make("bh", 1, hidden, Init::GlorotUniform);
        let w_decay = make("wt", 1, 1, Init::GlorotUniform);
        let w_proj = make("Wy", embed, hidden, Init::GlorotUniform);
        let v_mark = make("Vy", hidden, classes, Init::GlorotUniform);
        let v_time = make("Vt", hidden, 1, Init::UnitScaling);
        let b_time = make("bt", 1, 1, Init::GlorotUniform);
        let b_mark = make("bk", 1, classes, Init::GlorotUniform);

        ParamStore { w_state, w_embed, w_proj, w_time, b_state, v_time, w_decay, b_time, v_mark, b_mark, inits }
    }

    /// Redraw every tensor from its initializer, in declaration order.
    pub fn reinitialize(&self, g: &mut Graph, rng: &mut impl Rng) {
        for &(_, id, init) in &self.inits {
            let values = draw(init, g.rows(id), g.cols(id), rng);
            g.bind(id, &values);
        }
    }

    pub fn ids(&self) -> Vec<TID> { self.inits.iter().map(|&(_, id, _)| id).collect() }

    pub fn names(&self) -> impl Iterator<Item = (&'static str, TID)> + '_ {
        self.inits.iter().map(|&(name, id, _)| (name, id))
    }

    pub fn get(&self, name: &str) -> Option<TID> {
        self.inits.iter().find(|(n, _, _)| *n == name).map(|&(_, id, _)| id)
    }

    pub fn total_params(&self, g: &Graph) -> usize {
        self.ids().iter().map(|&t| g.data(t).len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn shapes_follow_sizes() {
        let mut g = Graph::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let p = ParamStore::new(4, 3, 5, &mut g, &mut rng);
        assert_eq!((g.rows(p.w_embed), g.cols(p.w_embed)), (6, 3));
        assert_eq!((g.rows(p.w_proj), g.cols(p.w_proj)), (3, 4));
        assert_eq!((g.rows(p.v_mark), g.cols(p.v_mark)), (4, 6));
        assert_eq!((g.rows(p.v_time), g.cols(p.v_time)), (4, 1));
        assert_eq!(g.data(p.w_decay).len(), 1);
        assert_eq!(p.total_params(&g), 4 + 18 + 16 + 4 + 1 + 12 + 24 + 4 + 1 + 6);
    }

    #[test]
    fn names_resolve_to_handles() {
        let mut g = Graph::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let p = ParamStore::new(2, 2, 2, &mut g, &mut rng);
        assert_eq!(p.get("Wem"), Some(p.w_embed));
        assert_eq!(p.get("wt"), Some(p.w_decay));
        assert_eq!(p.get("Wt"), Some(p.w_time));
        assert_eq!(p.get("missing"), None);
        assert_eq!(p.names().count(), 10);
    }

    #[test]
    fn initial_values_stay_within_limits() {
        let mut g = Graph::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let p = ParamStore::new(8, 6, 3, &mut g, &mut rng);
        let vt_limit = (3.0f32 / 8.0).sqrt();
        assert!(g.data(p.v_time).iter().all(|v| v.abs() <= vt_limit));
        let wh_limit = (6.0f32 / 16.0).sqrt();
        assert!(g.data(p.w_state).iter().all(|v| v.abs() <= wh_limit));
    }

    #[test]
    fn same_seed_reinitializes_identically() {
        let mut g = Graph::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let p = ParamStore::new(3, 2, 2, &mut g, &mut rng);
        let first: Vec<Vec<f32>> = p.ids().iter().map(|&t| g.data(t).to_vec()).collect();
        p.reinitialize(&mut g, &mut ChaCha8Rng::seed_from_u64(3));
        let second: Vec<Vec<f32>> = p.ids().iter().map(|&t| g.data(t).to_vec()).collect();
        assert_eq!(first, second);
    }
}
