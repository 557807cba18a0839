// ============================================================================
// VECTORIZED TENSOR AUTODIFF ENGINE
// Each node = dense row-major f32 matrix. The node list is built once as a
// compute plan, then re-evaluated by `forward` for every new set of input
// bindings and differentiated by `backward`.
// ============================================================================

use rayon::prelude::*;

#[inline]
pub(crate) fn vec_add(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

#[inline]
pub(crate) fn vec_add_inplace(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter_mut().zip(b.iter()) { *x += y; }
}

#[inline]
pub(crate) fn vec_sub(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

#[inline]
pub(crate) fn vec_scale_inplace(a: &mut [f32], s: f32) {
    for x in a.iter_mut() { *x *= s; }
}

#[inline]
pub(crate) fn vec_clamp(a: &[f32], lo: f32, hi: f32) -> Vec<f32> {
    a.iter().map(|&x| x.clamp(lo, hi)).collect()
}

#[inline]
pub(crate) fn vec_max(a: &[f32]) -> f32 {
    a.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

/// `sign(x) * max(|x|, eps)`, with sign(0) taken as +1 so the result is never 0.
#[inline]
pub fn away_from_zero(x: f32, eps: f32) -> f32 {
    let mag = x.abs().max(eps);
    if x < 0.0 { -mag } else { mag }
}

/// Handle to a node of the compute plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TID(usize);

#[derive(Clone, Debug)]
enum TensorOp {
    Param,
    Input,
    MatMul { a: TID, b: TID, m: usize, k: usize, n: usize },
    Add { a: TID, b: TID },
    Sub { a: TID, b: TID },
    BroadcastAdd { a: TID, bias: TID, rows: usize, cols: usize },
    BroadcastMul { a: TID, scale: TID, rows: usize, cols: usize },
    Clamp { a: TID, lo: f32, hi: f32 },
    Exp { a: TID },
    Log { a: TID },
    Recip { a: TID },
    AwayFromZero { a: TID, eps: f32 },
    Gather { table: TID, idx: TID, vocab: usize, cols: usize },
    SoftmaxRows { a: TID, cols: usize },
    PickCols { a: TID, idx: TID, cols: usize },
    MaskedMean { a: TID, mask: TID },
}

struct TensorNode {
    data: Vec<f32>,
    grad: Vec<f32>,
    rows: usize,
    cols: usize,
    op: TensorOp,
}

pub struct Graph {
    nodes: Vec<TensorNode>,
    finalized: bool,
}

impl Default for Graph {
    fn default() -> Self { Self::new() }
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::with_capacity(1024), finalized: false }
    }

    fn push(&mut self, op: TensorOp, rows: usize, cols: usize) -> TID {
        assert!(!self.finalized, "compute plan is finalized; no new nodes may be added");
        let len = rows * cols;
        let id = self.nodes.len();
        self.nodes.push(TensorNode { data: vec![0.0; len], grad: vec![0.0; len], rows, cols, op });
        TID(id)
    }

    /// Lock the plan. Later structural changes panic; data bindings stay writable.
    pub fn finalize(&mut self) { self.finalized = true; }

    pub fn is_finalized(&self) -> bool { self.finalized }

    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn data(&self, t: TID) -> &[f32] { &self.nodes[t.0].data }

    pub fn grad(&self, t: TID) -> &[f32] { &self.nodes[t.0].grad }

    pub fn rows(&self, t: TID) -> usize { self.nodes[t.0].rows }

    pub fn cols(&self, t: TID) -> usize { self.nodes[t.0].cols }

    /// Trainable leaf.
    pub fn param(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        debug_assert_eq!(data.len(), rows * cols);
        let id = self.push(TensorOp::Param, rows, cols);
        self.nodes[id.0].data = data;
        id
    }

    /// Leaf whose value is bound before each `forward`.
    pub fn input(&mut self, rows: usize, cols: usize) -> TID {
        self.push(TensorOp::Input, rows, cols)
    }

    /// Overwrite the value of a leaf node.
    pub fn bind(&mut self, t: TID, values: &[f32]) {
        let node = &mut self.nodes[t.0];
        debug_assert!(matches!(node.op, TensorOp::Param | TensorOp::Input), "bind on a computed node");
        assert_eq!(node.data.len(), values.len(), "binding shape mismatch");
        node.data.copy_from_slice(values);
    }

    /// Parameter data and gradient, borrowed together for the optimizer.
    pub(crate) fn param_mut(&mut self, t: TID) -> (&mut [f32], &[f32]) {
        let node = &mut self.nodes[t.0];
        (node.data.as_mut_slice(), node.grad.as_slice())
    }

    pub(crate) fn grad_mut(&mut self, t: TID) -> &mut [f32] { &mut self.nodes[t.0].grad }

    // ------------------------------------------------------------------
    // Plan construction: each op records one node, shapes checked here
    // ------------------------------------------------------------------

    pub fn matmul(&mut self, a: TID, b: TID) -> TID {
        let m = self.rows(a);
        let k = self.cols(a);
        let n = self.cols(b);
        assert_eq!(k, self.rows(b), "matmul shape [{},{}] @ [{},{}]", m, k, self.rows(b), n);
        self.push(TensorOp::MatMul { a, b, m, k, n }, m, n)
    }

    pub fn add(&mut self, a: TID, b: TID) -> TID {
        self.same_shape(a, b);
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Add { a, b }, r, c)
    }

    pub fn sub(&mut self, a: TID, b: TID) -> TID {
        self.same_shape(a, b);
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Sub { a, b }, r, c)
    }

    /// [m,n] + [1,n] broadcast bias add
    pub fn broadcast_add(&mut self, a: TID, bias: TID) -> TID {
        let (rows, cols) = (self.rows(a), self.cols(a));
        assert_eq!((self.rows(bias), self.cols(bias)), (1, cols), "broadcast_add bias shape");
        self.push(TensorOp::BroadcastAdd { a, bias, rows, cols }, rows, cols)
    }

    /// [m,n] * [1,n] broadcast element multiply
    pub fn broadcast_mul(&mut self, a: TID, scale: TID) -> TID {
        let (rows, cols) = (self.rows(a), self.cols(a));
        assert_eq!((self.rows(scale), self.cols(scale)), (1, cols), "broadcast_mul scale shape");
        self.push(TensorOp::BroadcastMul { a, scale, rows, cols }, rows, cols)
    }

    pub fn clamp(&mut self, a: TID, lo: f32, hi: f32) -> TID {
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Clamp { a, lo, hi }, r, c)
    }

    /// `min(x, hi)`
    pub fn min_scalar(&mut self, a: TID, hi: f32) -> TID { self.clamp(a, f32::NEG_INFINITY, hi) }

    /// `max(x, lo)`
    pub fn max_scalar(&mut self, a: TID, lo: f32) -> TID { self.clamp(a, lo, f32::INFINITY) }

    pub fn exp(&mut self, a: TID) -> TID {
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Exp { a }, r, c)
    }

    pub fn log(&mut self, a: TID) -> TID {
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Log { a }, r, c)
    }

    pub fn recip(&mut self, a: TID) -> TID {
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::Recip { a }, r, c)
    }

    pub fn away_from_zero(&mut self, a: TID, eps: f32) -> TID {
        let (r, c) = (self.rows(a), self.cols(a));
        self.push(TensorOp::AwayFromZero { a, eps }, r, c)
    }

    /// Row lookup: `table[idx[r], :]` for every row r of the [B,1] index node.
    pub fn gather(&mut self, table: TID, idx: TID) -> TID {
        assert_eq!(self.cols(idx), 1, "gather index must be a column");
        let (vocab, cols) = (self.rows(table), self.cols(table));
        let rows = self.rows(idx);
        self.push(TensorOp::Gather { table, idx, vocab, cols }, rows, cols)
    }

    pub fn softmax_rows(&mut self, a: TID) -> TID {
        let (r, cols) = (self.rows(a), self.cols(a));
        self.push(TensorOp::SoftmaxRows { a, cols }, r, cols)
    }

    /// `a[r, idx[r]]` as a [B,1] column.
    pub fn pick_cols(&mut self, a: TID, idx: TID) -> TID {
        assert_eq!(self.rows(a), self.rows(idx), "pick_cols row mismatch");
        assert_eq!(self.cols(idx), 1, "pick_cols index must be a column");
        let (rows, cols) = (self.rows(a), self.cols(a));
        self.push(TensorOp::PickCols { a, idx, cols }, rows, 1)
    }

    /// Mean of the [B,1] column `a` over rows whose `mask` entry is > 0.
    /// Yields exactly 0 when no row is active.
    pub fn masked_mean(&mut self, a: TID, mask: TID) -> TID {
        assert_eq!(self.cols(a), 1, "masked_mean expects a column");
        assert_eq!(self.rows(a), self.rows(mask), "masked_mean row mismatch");
        self.push(TensorOp::MaskedMean { a, mask }, 1, 1)
    }

    fn same_shape(&self, a: TID, b: TID) {
        assert_eq!(
            (self.rows(a), self.cols(a)),
            (self.rows(b), self.cols(b)),
            "elementwise shape mismatch"
        );
    }

    // ------------------------------------------------------------------
    // Forward: evaluate every computed node in plan order
    // ------------------------------------------------------------------

    pub fn forward(&mut self) {
        for i in 0..self.nodes.len() {
            if let Some(out) = self.eval(i) {
                self.nodes[i].data = out;
            }
        }
    }

    fn eval(&self, i: usize) -> Option<Vec<f32>> {
        let out = match self.nodes[i].op {
            TensorOp::Param | TensorOp::Input => return None,

            TensorOp::MatMul { a, b, m, k, n } => {
                let (a_data, b_data) = (self.data(a), self.data(b));
                let mut out = vec![0.0f32; m * n];
                // SAFETY: both operands and `out` are row-major buffers of exactly
                // [m,k], [k,n] and [m,n] elements, checked when the node was built.
                unsafe {
                    matrixmultiply::sgemm(
                        m, k, n,
                        1.0,
                        a_data.as_ptr(), k as isize, 1,
                        b_data.as_ptr(), n as isize, 1,
                        0.0,
                        out.as_mut_ptr(), n as isize, 1,
                    );
                }
                out
            }

            TensorOp::Add { a, b } => vec_add(self.data(a), self.data(b)),
            TensorOp::Sub { a, b } => vec_sub(self.data(a), self.data(b)),

            TensorOp::BroadcastAdd { a, bias, rows, cols } => {
                let mut out = self.data(a).to_vec();
                let bd = self.data(bias);
                for r in 0..rows {
                    let off = r * cols;
                    for j in 0..cols { out[off + j] += bd[j]; }
                }
                out
            }

            TensorOp::BroadcastMul { a, scale, rows, cols } => {
                let mut out = self.data(a).to_vec();
                let sd = self.data(scale);
                for r in 0..rows {
                    let off = r * cols;
                    for j in 0..cols { out[off + j] *= sd[j]; }
                }
                out
            }

            TensorOp::Clamp { a, lo, hi } => vec_clamp(self.data(a), lo, hi),
            TensorOp::Exp { a } => self.data(a).iter().map(|x| x.exp()).collect(),
            TensorOp::Log { a } => self.data(a).iter().map(|x| x.ln()).collect(),
            TensorOp::Recip { a } => self.data(a).iter().map(|x| 1.0 / x).collect(),
            TensorOp::AwayFromZero { a, eps } => self.data(a).iter().map(|&x| away_from_zero(x, eps)).collect(),

            TensorOp::Gather { table, idx, vocab, cols } => {
                let td = self.data(table);
                let mut out = vec![0.0f32; self.nodes[i].rows * cols];
                out.par_chunks_mut(cols).zip(self.data(idx).par_iter()).for_each(|(row, &ix)| {
                    let r = ix as usize;
                    debug_assert!(r < vocab, "gather index {} outside table of {} rows", r, vocab);
                    row.copy_from_slice(&td[r * cols..(r + 1) * cols]);
                });
                out
            }

            TensorOp::SoftmaxRows { a, cols } => {
                let mut out = self.data(a).to_vec();
                out.par_chunks_mut(cols).for_each(|row| {
                    let mx = vec_max(row);
                    let mut sum = 0.0f32;
                    for x in row.iter_mut() { *x = (*x - mx).exp(); sum += *x; }
                    for x in row.iter_mut() { *x /= sum; }
                });
                out
            }

            TensorOp::PickCols { a, idx, cols } => {
                let ad = self.data(a);
                self.data(idx).iter().enumerate()
                    .map(|(r, &ix)| {
                        let c = ix as usize;
                        debug_assert!(c < cols, "pick index {} outside {} columns", c, cols);
                        ad[r * cols + c]
                    })
                    .collect()
            }

            TensorOp::MaskedMean { a, mask } => {
                let (ad, md) = (self.data(a), self.data(mask));
                let count = md.iter().filter(|&&m| m > 0.0).count();
                if count > 0 {
                    let sum: f32 = ad.iter().zip(md.iter()).filter(|(_, m)| **m > 0.0).map(|(x, _)| *x).sum();
                    vec![sum / count as f32]
                } else {
                    vec![0.0]
                }
            }
        };
        Some(out)
    }

    // ------------------------------------------------------------------
    // Backward: vectorized gradient propagation
    // ------------------------------------------------------------------

    pub fn zero_grad(&mut self) {
        for node in self.nodes.iter_mut() {
            for g in node.grad.iter_mut() { *g = 0.0; }
        }
    }

    /// Accumulate d(loss)/d(node) into every node's gradient. `loss` must be [1,1].
    pub fn backward(&mut self, loss: TID) {
        assert_eq!(self.nodes[loss.0].data.len(), 1, "backward expects a scalar loss");
        self.zero_grad();
        self.nodes[loss.0].grad[0] = 1.0;

        for i in (0..=loss.0).rev() {
            let has_grad = self.nodes[i].grad.iter().any(|&g| g != 0.0);
            if !has_grad { continue; }

            let op = self.nodes[i].op.clone();
            let g = self.nodes[i].grad.clone();
            match op {
                TensorOp::Param | TensorOp::Input => {}

                TensorOp::MatMul { a, b, m, k, n } => {
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    // dA = dOut @ B^T
                    let mut da_buf = vec![0.0f32; m * k];
                    // dB = A^T @ dOut
                    let mut db_buf = vec![0.0f32; k * n];
                    // SAFETY: transposes are expressed through swapped strides over
                    // buffers whose lengths match the recorded [m,k], [k,n], [m,n].
                    unsafe {
                        matrixmultiply::sgemm(
                            m, n, k,
                            1.0,
                            g.as_ptr(), n as isize, 1,
                            b_d.as_ptr(), 1, n as isize,
                            0.0,
                            da_buf.as_mut_ptr(), k as isize, 1,
                        );
                        matrixmultiply::sgemm(
                            k, m, n,
                            1.0,
                            a_d.as_ptr(), 1, k as isize,
                            g.as_ptr(), n as isize, 1,
                            0.0,
                            db_buf.as_mut_ptr(), n as isize, 1,
                        );
                    }
                    vec_add_inplace(&mut self.nodes[a.0].grad, &da_buf);
                    vec_add_inplace(&mut self.nodes[b.0].grad, &db_buf);
                }

                TensorOp::Add { a, b } => {
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    vec_add_inplace(&mut self.nodes[b.0].grad, &g);
                }

                TensorOp::Sub { a, b } => {
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for (bg, &og) in self.nodes[b.0].grad.iter_mut().zip(g.iter()) { *bg -= og; }
                }

                TensorOp::BroadcastAdd { a, bias, rows, cols } => {
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for r in 0..rows {
                        let off = r * cols;
                        for j in 0..cols { self.nodes[bias.0].grad[j] += g[off + j]; }
                    }
                }

                TensorOp::BroadcastMul { a, scale, rows, cols } => {
                    let a_d = self.nodes[a.0].data.clone();
                    let s_d = self.nodes[scale.0].data.clone();
                    for r in 0..rows {
                        let off = r * cols;
                        for j in 0..cols {
                            self.nodes[a.0].grad[off + j] += g[off + j] * s_d[j];
                            self.nodes[scale.0].grad[j] += g[off + j] * a_d[off + j];
                        }
                    }
                }

                TensorOp::Clamp { a, lo, hi } => {
                    let a_d = self.nodes[a.0].data.clone();
                    for j in 0..g.len() {
                        if a_d[j] >= lo && a_d[j] <= hi { self.nodes[a.0].grad[j] += g[j]; }
                    }
                }

                TensorOp::Exp { a } => {
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * od[j]; }
                }

                TensorOp::Log { a } => {
                    let a_d = self.nodes[a.0].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] / a_d[j]; }
                }

                TensorOp::Recip { a } => {
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] -= g[j] * od[j] * od[j]; }
                }

                TensorOp::AwayFromZero { a, eps } => {
                    // Identity above the floor, flat inside it.
                    let a_d = self.nodes[a.0].data.clone();
                    for j in 0..g.len() {
                        if a_d[j].abs() > eps { self.nodes[a.0].grad[j] += g[j]; }
                    }
                }

                TensorOp::Gather { table, idx, vocab, cols } => {
                    let ix = self.nodes[idx.0].data.clone();
                    for (r, &x) in ix.iter().enumerate() {
                        let row = x as usize;
                        debug_assert!(row < vocab);
                        let dst = &mut self.nodes[table.0].grad[row * cols..(row + 1) * cols];
                        vec_add_inplace(dst, &g[r * cols..(r + 1) * cols]);
                    }
                }

                TensorOp::SoftmaxRows { a, cols } => {
                    let p = self.nodes[i].data.clone();
                    let mut da = vec![0.0f32; p.len()];
                    da.par_chunks_mut(cols)
                        .zip(p.par_chunks(cols))
                        .zip(g.par_chunks(cols))
                        .for_each(|((dst, pr), gr)| {
                            let dot: f32 = pr.iter().zip(gr.iter()).map(|(x, y)| x * y).sum();
                            for j in 0..cols { dst[j] = pr[j] * (gr[j] - dot); }
                        });
                    vec_add_inplace(&mut self.nodes[a.0].grad, &da);
                }

                TensorOp::PickCols { a, idx, cols } => {
                    let ix = self.nodes[idx.0].data.clone();
                    for (r, &x) in ix.iter().enumerate() {
                        let c = x as usize;
                        debug_assert!(c < cols);
                        self.nodes[a.0].grad[r * cols + c] += g[r];
                    }
                }

                TensorOp::MaskedMean { a, mask } => {
                    let md = self.nodes[mask.0].data.clone();
                    let count = md.iter().filter(|&&m| m > 0.0).count();
                    if count > 0 {
                        let share = g[0] / count as f32;
                        for (r, &m) in md.iter().enumerate() {
                            if m > 0.0 { self.nodes[a.0].grad[r] += share; }
                        }
                    }
                }
            }
        }
    }
}
