// ============================================================================
// OPTIMIZER: learning-rate schedule, gradient clipping and Adam
// ============================================================================

use crate::graph::{vec_scale_inplace, Graph, TID};

/// `lr = base_lr / (1 + decay_rate * floor(step / decay_steps))`
#[derive(Clone, Copy, Debug)]
pub struct InverseTimeDecay {
    pub base_lr: f32,
    pub decay_rate: f32,
    pub decay_steps: u64,
}

impl InverseTimeDecay {
    pub fn learning_rate(&self, global_step: u64) -> f32 {
        let k = (global_step / self.decay_steps) as f32;
        self.base_lr / (1.0 + self.decay_rate * k)
    }
}

/// L2 norm over every component of every gradient.
pub fn global_norm<'a>(grads: impl IntoIterator<Item = &'a [f32]>) -> f32 {
    let sq: f64 = grads
        .into_iter()
        .flat_map(|g| g.iter())
        .map(|&v| (v as f64) * (v as f64))
        .sum();
    sq.sqrt() as f32
}

/// Scale the gradients of `ids` so their joint norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_by_global_norm(g: &mut Graph, ids: &[TID], max_norm: f32) -> f32 {
    let norm = global_norm(ids.iter().map(|&t| g.grad(t)));
    if norm > max_norm {
        let s = max_norm / norm;
        for &t in ids { vec_scale_inplace(g.grad_mut(t), s); }
    }
    norm
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    t: u64,
}

impl Adam {
    pub fn new(beta1: f32, ids: &[TID], g: &Graph) -> Self {
        let m: Vec<Vec<f32>> = ids.iter().map(|&t| vec![0.0; g.data(t).len()]).collect();
        let v = m.clone();
        Adam { beta1, beta2: 0.999, eps: 1e-8, m, v, t: 0 }
    }

    /// Clear both moment buffers and the bias-correction counter.
    pub fn reset(&mut self) {
        for buf in self.m.iter_mut().chain(self.v.iter_mut()) {
            for x in buf.iter_mut() { *x = 0.0; }
        }
        self.t = 0;
    }

    pub fn steps(&self) -> u64 { self.t }

    /// Apply one update to every parameter in `ids` from its current gradient.
    pub fn step(&mut self, g: &mut Graph, ids: &[TID], lr: f32) {
        debug_assert_eq!(ids.len(), self.m.len());
        self.t += 1;
        let t = self.t as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        for (idx, &tid) in ids.iter().enumerate() {
            let (data, grad) = g.param_mut(tid);
            let pm = &mut self.m[idx];
            let pv = &mut self.v[idx];
            for j in 0..data.len() {
                let gj = grad[j];
                pm[j] = self.beta1 * pm[j] + (1.0 - self.beta1) * gj;
                pv[j] = self.beta2 * pv[j] + (1.0 - self.beta2) * gj * gj;
                let m_hat = pm[j] / bc1;
                let v_hat = pv[j] / bc2;
                data[j] -= lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learning_rate_decays_in_stairs() {
        let s = InverseTimeDecay { base_lr: 0.1, decay_rate: 0.001, decay_steps: 10 };
        assert_eq!(s.learning_rate(0), 0.1);
        assert_eq!(s.learning_rate(9), 0.1);
        assert!((s.learning_rate(10) - 0.1 / 1.001).abs() < 1e-7);
        assert!((s.learning_rate(25) - 0.1 / 1.002).abs() < 1e-7);
    }

    fn graph_with_grads(grads: &[&[f32]]) -> (Graph, Vec<TID>) {
        let mut g = Graph::new();
        let ids: Vec<TID> = grads.iter().map(|gr| g.param(vec![0.0; gr.len()], 1, gr.len())).collect();
        for (&t, gr) in ids.iter().zip(grads) {
            g.grad_mut(t).copy_from_slice(gr);
        }
        (g, ids)
    }

    #[test]
    fn large_gradients_are_rescaled_to_the_threshold() {
        let (mut g, ids) = graph_with_grads(&[&[300.0, 0.0], &[0.0, 400.0, 0.0]]);
        let before = clip_by_global_norm(&mut g, &ids, 100.0);
        assert!((before - 500.0).abs() < 1e-3);
        let after = global_norm(ids.iter().map(|&t| g.grad(t)));
        assert!((after - 100.0).abs() < 1e-3);
        assert!((g.grad(ids[0])[0] - 60.0).abs() < 1e-4);
        assert!((g.grad(ids[1])[1] - 80.0).abs() < 1e-4);
    }

    #[test]
    fn small_gradients_are_untouched() {
        let (mut g, ids) = graph_with_grads(&[&[3.0, -4.0], &[12.0]]);
        let before = clip_by_global_norm(&mut g, &ids, 100.0);
        assert!((before - 13.0).abs() < 1e-5);
        assert_eq!(g.grad(ids[0]), &[3.0, -4.0]);
        assert_eq!(g.grad(ids[1]), &[12.0]);
    }

    #[test]
    fn first_adam_step_moves_each_entry_by_lr_against_its_gradient() {
        let (mut g, ids) = graph_with_grads(&[&[2.0, -0.5, 0.0]]);
        let mut opt = Adam::new(0.9, &ids, &g);
        opt.step(&mut g, &ids, 0.1);
        let p = g.data(ids[0]);
        assert!((p[0] + 0.1).abs() < 1e-5);
        assert!((p[1] - 0.1).abs() < 1e-5);
        assert_eq!(p[2], 0.0);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn reset_clears_moments() {
        let (mut g, ids) = graph_with_grads(&[&[1.0]]);
        let mut opt = Adam::new(0.5, &ids, &g);
        opt.step(&mut g, &ids, 0.01);
        opt.reset();
        assert_eq!(opt.steps(), 0);
        g.bind(ids[0], &[0.0]);
        opt.step(&mut g, &ids, 0.01);
        assert!((g.data(ids[0])[0] + 0.01).abs() < 1e-6);
    }
}
