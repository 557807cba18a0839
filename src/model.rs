// ============================================================================
// MODEL: chunk plan and training loop
// ============================================================================

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::cell;
use crate::config::RmtppConfig;
use crate::data::{Batch, TrainingData};
use crate::error::{Result, RmtppError};
use crate::graph::{Graph, TID};
use crate::likelihood::{self, StepHead};
use crate::optim::{clip_by_global_norm, Adam, InverseTimeDecay};
use crate::params::ParamStore;

/// Input slots of one unrolled step, each [B,1].
#[derive(Clone, Copy, Debug)]
struct StepSlots {
    mark_in: TID,
    mark_out: TID,
    time_in: TID,
    time_out: TID,
}

/// A `bptt`-step unroll recorded once and re-run for every chunk.
struct ChunkPlan {
    /// [B,H] state carried in from the previous chunk. Bound as data, so no
    /// gradient reaches earlier chunks.
    initial_state: TID,
    steps: Vec<StepSlots>,
    heads: Vec<StepHead>,
    final_state: TID,
    loss: TID,
}

impl ChunkPlan {
    fn build(g: &mut Graph, p: &ParamStore, batch: usize, hidden: usize, bptt: usize) -> Self {
        let initial_state = g.input(batch, hidden);
        // Never bound; stays at zero and anchors the loss sum.
        let zero = g.input(1, 1);
        let mut state = initial_state;
        let mut loss = zero;
        let mut steps = Vec::with_capacity(bptt);
        let mut heads = Vec::with_capacity(bptt);
        for _ in 0..bptt {
            let slots = StepSlots {
                mark_in: g.input(batch, 1),
                mark_out: g.input(batch, 1),
                time_in: g.input(batch, 1),
                time_out: g.input(batch, 1),
            };
            state = cell::step(g, p, state, slots.mark_in, slots.time_in);
            let head = likelihood::step(g, p, state, slots.mark_in, slots.mark_out, slots.time_in, slots.time_out);
            loss = g.sub(loss, head.term);
            steps.push(slots);
            heads.push(head);
        }
        ChunkPlan { initial_state, steps, heads, final_state: state, loss }
    }
}

/// Result of running one chunk.
#[derive(Clone, Debug)]
pub struct ChunkOutput {
    /// `-Σ step_term` over the chunk.
    pub loss: f32,
    /// [B,H] row-major state after the last step.
    pub final_state: Vec<f32>,
    /// Masked mean log-likelihood per step.
    pub step_terms: Vec<f32>,
    /// Gradient norm before clipping; `None` when no update was applied.
    pub grad_norm: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    /// Sum of batch losses over the number of batches.
    pub mean_loss: f64,
    pub learning_rate: f32,
    pub global_step: u64,
}

pub struct Rmtpp {
    config: RmtppConfig,
    num_categories: usize,
    graph: Graph,
    params: ParamStore,
    param_ids: Vec<TID>,
    plan: ChunkPlan,
    optimizer: Adam,
    schedule: InverseTimeDecay,
    global_step: u64,
    last_epoch: usize,
}

impl Rmtpp {
    /// Validate the config, draw parameters from `config.seed` and record the
    /// chunk plan for `[batch_size, bptt]` windows.
    pub fn new(config: RmtppConfig) -> Result<Self> {
        let num_categories = config.validate()?;
        let mut graph = Graph::new();
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let params = ParamStore::new(
            config.hidden_layer_size,
            config.embed_size,
            num_categories,
            &mut graph,
            &mut rng,
        );
        let plan = ChunkPlan::build(
            &mut graph,
            &params,
            config.batch_size,
            config.hidden_layer_size,
            config.bptt,
        );
        let param_ids = params.ids();
        let optimizer = Adam::new(config.momentum, &param_ids, &graph);
        let schedule = InverseTimeDecay {
            base_lr: config.learning_rate,
            decay_rate: config.lr_decay_rate,
            decay_steps: config.lr_decay_steps,
        };
        debug!(
            nodes = graph.len(),
            params = params.total_params(&graph),
            bptt = config.bptt,
            "Built chunk plan"
        );

        Ok(Rmtpp {
            config,
            num_categories,
            graph,
            params,
            param_ids,
            plan,
            optimizer,
            schedule,
            global_step: 0,
            last_epoch: 0,
        })
    }

    /// Redraw every parameter from the seeded initializers and clear the
    /// optimizer. With `finalize`, the plan refuses further structural changes.
    pub fn initialize(&mut self, finalize: bool) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        self.params.reinitialize(&mut self.graph, &mut rng);
        self.optimizer.reset();
        self.graph.zero_grad();
        self.global_step = 0;
        if finalize {
            self.graph.finalize();
        }
        debug!(finalize, "Initialized parameters");
    }

    /// Train for `num_epochs` passes over `data`.
    pub fn train(&mut self, data: &TrainingData, num_epochs: usize, check_nans: bool) -> Result<Vec<EpochReport>> {
        if check_nans {
            return Err(RmtppError::NotImplemented("check_nans".into()));
        }
        if num_epochs == 0 {
            return Err(RmtppError::InvalidArgument("num_epochs must be at least 1".into()));
        }
        data.validate(self.num_categories)?;

        let batch_size = self.config.batch_size;
        let bptt = self.config.bptt;
        let num_seqs = data.num_sequences();
        let num_batches = num_seqs / batch_size;
        if num_batches == 0 {
            return Err(RmtppError::Data(format!(
                "{} sequences do not fill one batch of {}",
                num_seqs, batch_size
            )));
        }
        if data.seq_len() < bptt {
            return Err(RmtppError::Data(format!(
                "sequence length {} is shorter than bptt {}",
                data.seq_len(),
                bptt
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut idxes: Vec<usize> = (0..num_seqs).collect();
        let mut reports = Vec::with_capacity(num_epochs);

        for epoch in self.last_epoch..self.last_epoch + num_epochs {
            info!(epoch, "Starting epoch");
            for i in (1..idxes.len()).rev() {
                let j = rng.gen_range(0..=i);
                idxes.swap(i, j);
            }

            let mut total_loss = 0.0f64;
            for batch_idx in 0..num_batches {
                let batch = data.batch(&idxes[batch_idx * batch_size..(batch_idx + 1) * batch_size]);
                let mut state = vec![0.0f32; batch_size * self.config.hidden_layer_size];
                let mut batch_loss = 0.0f64;
                for c in 0..batch.num_chunks(bptt) {
                    let out = self.train_chunk(&batch.chunk(c, bptt), &state)?;
                    batch_loss += out.loss as f64;
                    state = out.final_state;
                }
                let every = self.config.log_every_batches;
                if every > 0 && batch_idx % every == 0 {
                    info!(
                        batch = batch_idx,
                        loss = batch_loss,
                        lr = self.learning_rate(),
                        global_step = self.global_step,
                        "Loss during batch"
                    );
                }
                total_loss += batch_loss;
            }

            let report = EpochReport {
                epoch,
                mean_loss: total_loss / num_batches as f64,
                learning_rate: self.learning_rate(),
                global_step: self.global_step,
            };
            info!(
                epoch,
                loss = report.mean_loss,
                lr = report.learning_rate,
                global_step = report.global_step,
                "Finished epoch"
            );
            reports.push(report);
        }

        self.last_epoch += num_epochs;
        Ok(reports)
    }

    /// Inference hook. Accepts the data and performs no work.
    pub fn predict(&self, data: &TrainingData) -> Result<()> {
        debug!(sequences = data.num_sequences(), "predict is a no-op");
        Ok(())
    }

    /// Forward pass over one chunk starting from `state`, with no update.
    pub fn evaluate_chunk(&mut self, chunk: &Batch, state: &[f32]) -> Result<ChunkOutput> {
        self.run_forward(chunk, state)?;
        Ok(self.collect())
    }

    /// Forward, backward, clip and one Adam update. The learning rate comes from
    /// `global_step` before it is incremented.
    pub fn train_chunk(&mut self, chunk: &Batch, state: &[f32]) -> Result<ChunkOutput> {
        let lr = self.learning_rate();
        self.run_forward(chunk, state)?;
        let out = self.collect();

        self.graph.backward(self.plan.loss);
        let norm = clip_by_global_norm(&mut self.graph, &self.param_ids, self.config.max_grad_norm);
        self.optimizer.step(&mut self.graph, &self.param_ids, lr);
        self.global_step += 1;

        debug!(
            loss = out.loss,
            grad_norm = norm,
            lr,
            global_step = self.global_step,
            "Applied chunk update"
        );
        Ok(ChunkOutput { grad_norm: Some(norm), ..out })
    }

    fn run_forward(&mut self, chunk: &Batch, state: &[f32]) -> Result<()> {
        chunk.validate(self.num_categories)?;
        let (batch, hidden, bptt) = (self.config.batch_size, self.config.hidden_layer_size, self.config.bptt);
        if chunk.rows() != batch || chunk.len() != bptt {
            return Err(RmtppError::InvalidArgument(format!(
                "chunk is [{}, {}], plan expects [{}, {}]",
                chunk.rows(),
                chunk.len(),
                batch,
                bptt
            )));
        }
        if state.len() != batch * hidden {
            return Err(RmtppError::InvalidArgument(format!(
                "state has {} values, plan expects {}",
                state.len(),
                batch * hidden
            )));
        }

        self.graph.bind(self.plan.initial_state, state);
        for (t, slots) in self.plan.steps.iter().enumerate() {
            let [mark_in, mark_out, time_in, time_out] = chunk.step_columns(t);
            self.graph.bind(slots.mark_in, &mark_in);
            self.graph.bind(slots.mark_out, &mark_out);
            self.graph.bind(slots.time_in, &time_in);
            self.graph.bind(slots.time_out, &time_out);
        }
        self.graph.forward();
        Ok(())
    }

    fn collect(&self) -> ChunkOutput {
        ChunkOutput {
            loss: self.graph.data(self.plan.loss)[0],
            final_state: self.graph.data(self.plan.final_state).to_vec(),
            step_terms: self.plan.heads.iter().map(|h| self.graph.data(h.term)[0]).collect(),
            grad_norm: None,
        }
    }

    /// [B] intensities at step `t` of the last chunk run.
    pub fn intensity(&self, t: usize) -> Option<&[f32]> {
        self.plan.heads.get(t).map(|h| self.graph.data(h.lambda))
    }

    /// [B,K+1] row-major mark distribution at step `t` of the last chunk run.
    pub fn mark_probs(&self, t: usize) -> Option<&[f32]> {
        self.plan.heads.get(t).map(|h| self.graph.data(h.mark_probs))
    }

    /// Learning rate the next update will use.
    pub fn learning_rate(&self) -> f32 { self.schedule.learning_rate(self.global_step) }

    pub fn global_step(&self) -> u64 { self.global_step }

    pub fn last_epoch(&self) -> usize { self.last_epoch }

    pub fn num_categories(&self) -> usize { self.num_categories }

    pub fn config(&self) -> &RmtppConfig { &self.config }

    pub fn is_finalized(&self) -> bool { self.graph.is_finalized() }

    /// Current values of a named parameter (`"Wh"`, `"Vt"`, ...).
    pub fn parameter(&self, name: &str) -> Option<&[f32]> {
        self.params.get(name).map(|t| self.graph.data(t))
    }

    pub fn parameter_names(&self) -> Vec<&'static str> {
        self.params.names().map(|(n, _)| n).collect()
    }
}
