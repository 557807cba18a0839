// ============================================================================
// LIKELIHOOD HEAD
// Per-step log-likelihood of the next (time, mark) pair.
//
// With hv = h_t·Vt and λ0 = bt the intensity after an elapsed time Δt is
//   log λ(Δt) = hv + Δt·wt + λ0
// and the density of the next event at Δt integrates it in closed form:
//   log f*(Δt) = log λ(Δt) + exp(hv + λ0)/wt − exp(log λ(Δt))/wt
// Both exponentials are capped at exp(50); wt is kept at least 1e-6 from zero.
// ============================================================================

use crate::graph::{away_from_zero, Graph, TID};
use crate::params::ParamStore;

pub const LOG_CAP: f32 = 50.0;
pub const DECAY_FLOOR: f32 = 1e-6;
pub const PROB_FLOOR: f32 = 1e-6;

/// Intensity `λ = exp(min(50, log λ(Δt)))` for one element.
pub fn intensity(hv: f32, dt: f32, wt: f32, bt: f32) -> f32 {
    (hv + dt * wt + bt).min(LOG_CAP).exp()
}

/// Closed-form `log f*(Δt)` for one element.
pub fn log_density(hv: f32, dt: f32, wt: f32, bt: f32) -> f32 {
    let log_lambda = hv + dt * wt + bt;
    let inv = 1.0 / away_from_zero(wt, DECAY_FLOOR);
    log_lambda + inv * (hv + bt).min(LOG_CAP).exp() - inv * intensity(hv, dt, wt, bt)
}

/// Plan nodes produced for one step.
#[derive(Clone, Copy, Debug)]
pub struct StepHead {
    /// [B,1] intensity at the observed Δt.
    pub lambda: TID,
    /// [B,1] `log f*(Δt)`.
    pub log_f_star: TID,
    /// [B,K+1] mark distribution.
    pub mark_probs: TID,
    /// [B,1] time plus mark log-likelihood.
    pub step_ll: TID,
    /// [1,1] masked mean of `step_ll` over active rows.
    pub term: TID,
}

/// Record the likelihood head for one step.
///
/// `h` is the step's [B,H] state. `mark_in` masks rows (active iff > 0),
/// `mark_out` selects the target class, and `Δt = time_out − time_in`.
pub fn step(
    g: &mut Graph,
    p: &ParamStore,
    h: TID,
    mark_in: TID,
    mark_out: TID,
    time_in: TID,
    time_out: TID,
) -> StepHead {
    // Time
    let delta_t = g.sub(time_out, time_in);
    let hv = g.matmul(h, p.v_time);
    let base = g.broadcast_add(hv, p.b_time);
    let decay = g.broadcast_mul(delta_t, p.w_decay);
    let log_lambda = g.add(base, decay);

    let capped = g.min_scalar(log_lambda, LOG_CAP);
    let lambda = g.exp(capped);

    let w_eff = g.away_from_zero(p.w_decay, DECAY_FLOOR);
    let inv_w = g.recip(w_eff);
    let base_capped = g.min_scalar(base, LOG_CAP);
    let at_zero = g.exp(base_capped);
    let at_zero = g.broadcast_mul(at_zero, inv_w);
    let at_dt = g.broadcast_mul(lambda, inv_w);
    let log_f_star = g.add(log_lambda, at_zero);
    let log_f_star = g.sub(log_f_star, at_dt);

    // Mark
    let logits = g.matmul(h, p.v_mark);
    let logits = g.broadcast_add(logits, p.b_mark);
    let logits = g.min_scalar(logits, LOG_CAP);
    let mark_probs = g.softmax_rows(logits);
    let picked = g.pick_cols(mark_probs, mark_out);
    let picked = g.max_scalar(picked, PROB_FLOOR);
    let mark_ll = g.log(picked);

    let step_ll = g.add(log_f_star, mark_ll);
    let term = g.masked_mean(step_ll, mark_in);

    StepHead { lambda, log_f_star, mark_probs, step_ll, term }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Trapezoid rule over [0, upper] in f64.
    fn total_mass(hv: f32, wt: f32, bt: f32, upper: f64, n: usize) -> f64 {
        let h = upper / n as f64;
        let f = |i: usize| (log_density(hv, (i as f64 * h) as f32, wt, bt) as f64).exp();
        let inner: f64 = (1..n).map(f).sum();
        h * (0.5 * f(0) + inner + 0.5 * f(n))
    }

    #[test]
    fn density_integrates_to_one_with_decaying_intensity() {
        let mass = total_mass(1.5, -0.5, 0.5, 60.0, 600_000);
        assert!((mass - 1.0).abs() < 1e-3, "mass = {}", mass);
    }

    #[test]
    fn density_integrates_to_one_with_growing_intensity() {
        let mass = total_mass(-0.4, 0.3, -0.1, 40.0, 400_000);
        assert!((mass - 1.0).abs() < 1e-3, "mass = {}", mass);
    }

    #[test]
    fn zero_decay_weight_stays_finite() {
        let v = log_density(0.2, 1.0, 0.0, 0.1);
        assert!(v.is_finite());
        let v = log_density(0.2, 1.0, -0.0, 0.1);
        assert!(v.is_finite());
    }

    #[test]
    fn intensity_exponent_is_capped() {
        assert_eq!(intensity(1e4, 0.0, 1.0, 0.0), LOG_CAP.exp());
        assert!(log_density(1e4, 2.0, 0.5, 0.0).is_finite());
    }

    #[test]
    fn graph_head_agrees_with_scalar_form() {
        let mut g = Graph::new();
        let p = ParamStore::new(3, 2, 2, &mut g, &mut ChaCha8Rng::seed_from_u64(5));
        let h = g.input(2, 3);
        let mark_in = g.input(2, 1);
        let mark_out = g.input(2, 1);
        let t_in = g.input(2, 1);
        let t_out = g.input(2, 1);
        let head = step(&mut g, &p, h, mark_in, mark_out, t_in, t_out);
        g.bind(p.w_decay, &[-0.8]);
        g.bind(p.b_time, &[0.2]);
        let state = [0.3, 0.0, 1.2, 0.7, 0.4, 0.0];
        g.bind(h, &state);
        g.bind(mark_in, &[1.0, 2.0]);
        g.bind(mark_out, &[2.0, 1.0]);
        g.bind(t_in, &[1.0, 3.0]);
        g.bind(t_out, &[1.5, 5.0]);
        g.forward();

        let vt = g.data(p.v_time).to_vec();
        let wt = g.data(p.w_decay)[0];
        let bt = g.data(p.b_time)[0];
        for (r, dt) in [0.5f32, 2.0].into_iter().enumerate() {
            let hv: f32 = (0..3).map(|j| state[r * 3 + j] * vt[j]).sum();
            let expect = log_density(hv, dt, wt, bt);
            let got = g.data(head.log_f_star)[r];
            assert!((got - expect).abs() < 1e-4 * (1.0 + expect.abs()), "row {}: {} vs {}", r, got, expect);
            let lam = intensity(hv, dt, wt, bt);
            assert!((g.data(head.lambda)[r] - lam).abs() < 1e-4 * (1.0 + lam));
        }
        let row_sums: Vec<f32> = g.data(head.mark_probs).chunks(3).map(|r| r.iter().sum()).collect();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn all_padding_step_contributes_nothing() {
        let mut g = Graph::new();
        let p = ParamStore::new(2, 2, 3, &mut g, &mut ChaCha8Rng::seed_from_u64(9));
        let h = g.input(3, 2);
        let mark_in = g.input(3, 1);
        let mark_out = g.input(3, 1);
        let t_in = g.input(3, 1);
        let t_out = g.input(3, 1);
        let head = step(&mut g, &p, h, mark_in, mark_out, t_in, t_out);
        g.bind(h, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        g.bind(mark_in, &[0.0, 0.0, 0.0]);
        g.bind(mark_out, &[1.0, 3.0, 2.0]);
        g.bind(t_in, &[0.0, 1.0, 2.0]);
        g.bind(t_out, &[4.0, 9.0, 2.5]);
        g.forward();
        assert_eq!(g.data(head.term), &[0.0]);
    }

    proptest! {
        #[test]
        fn intensity_is_positive_and_finite(
            hv in -20.0f32..20.0,
            dt in 0.0f32..10.0,
            wt in -2.0f32..2.0,
            bt in -5.0f32..5.0,
        ) {
            let lam = intensity(hv, dt, wt, bt);
            prop_assert!(lam.is_finite());
            prop_assert!(lam > 0.0);
            prop_assert!(log_density(hv, dt, wt, bt).is_finite());
        }

        #[test]
        fn mark_probabilities_lie_in_unit_interval(
            state in proptest::collection::vec(0.0f32..5.0, 8),
            seed in 0u64..1000,
        ) {
            let mut g = Graph::new();
            let p = ParamStore::new(4, 3, 4, &mut g, &mut ChaCha8Rng::seed_from_u64(seed));
            let h = g.input(2, 4);
            let mark_in = g.input(2, 1);
            let mark_out = g.input(2, 1);
            let t_in = g.input(2, 1);
            let t_out = g.input(2, 1);
            let head = step(&mut g, &p, h, mark_in, mark_out, t_in, t_out);
            g.bind(h, &state);
            g.bind(mark_in, &[1.0, 4.0]);
            g.bind(mark_out, &[3.0, 1.0]);
            g.bind(t_out, &[0.5, 1.5]);
            g.forward();
            for &pr in g.data(head.mark_probs) {
                prop_assert!(pr.is_finite() && pr > 0.0 && pr <= 1.0);
            }
            for &lam in g.data(head.lambda) {
                prop_assert!(lam.is_finite() && lam > 0.0);
            }
            prop_assert!(g.data(head.term)[0].is_finite());
        }
    }
}
