// ============================================================================
// CONFIGURATION
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Result, RmtppError};

/// Numeric precision of parameters and activations.
///
/// The tensor engine stores every node as `f32` and calls `sgemm`, so only
/// `F32` passes [`RmtppConfig::validate`]. `F64` is accepted by the parser and
/// JSON loader but rejected at model construction with a config error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F64,
}

/// Model and optimizer hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RmtppConfig {
    pub hidden_layer_size: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// First-moment decay rate of Adam.
    pub momentum: f32,
    /// Carried for parity with saved hyperparameter sets; not part of the loss.
    pub l2_penalty: f32,
    pub embed_size: usize,
    pub precision: Precision,
    pub seed: u64,
    pub bptt: usize,
    /// Number of real event categories K. Mark 0 is the padding sentinel.
    pub num_categories: Option<usize>,
    pub lr_decay_steps: u64,
    pub lr_decay_rate: f32,
    pub max_grad_norm: f32,
    pub log_every_batches: usize,
}

impl Default for RmtppConfig {
    fn default() -> Self {
        RmtppConfig {
            hidden_layer_size: 64,
            batch_size: 64,
            learning_rate: 0.1,
            momentum: 0.9,
            l2_penalty: 0.001,
            embed_size: 64,
            precision: Precision::F32,
            seed: 42,
            bptt: 10,
            num_categories: None,
            lr_decay_steps: 10,
            lr_decay_rate: 0.001,
            max_grad_norm: 100.0,
            log_every_batches: 10,
        }
    }
}

impl RmtppConfig {
    pub fn with_categories(num_categories: usize) -> Self {
        RmtppConfig { num_categories: Some(num_categories), ..Self::default() }
    }

    /// Apply one `key=value` override. Keys are matched case-insensitively with
    /// underscores ignored, so `--hiddenLayerSize=32` and `--hidden_layer_size=32`
    /// are the same flag. Returns `Ok(false)` for keys this struct does not own.
    pub fn apply_arg(&mut self, key: &str, value: &str) -> Result<bool> {
        let key = key.to_lowercase().replace('_', "");
        match key.as_str() {
            "hiddenlayersize" | "hiddensize" => self.hidden_layer_size = parse(&key, value)?,
            "batchsize" => self.batch_size = parse(&key, value)?,
            "learningrate" => self.learning_rate = parse(&key, value)?,
            "momentum" => self.momentum = parse(&key, value)?,
            "l2penalty" => self.l2_penalty = parse(&key, value)?,
            "embedsize" => self.embed_size = parse(&key, value)?,
            "precision" | "floattype" => {
                self.precision = match value.to_lowercase().as_str() {
                    "f32" | "float32" => Precision::F32,
                    "f64" | "float64" => Precision::F64,
                    other => {
                        return Err(RmtppError::Config(format!("unknown precision '{}'", other)))
                    }
                }
            }
            "seed" => self.seed = parse(&key, value)?,
            "bptt" => self.bptt = parse(&key, value)?,
            "numcategories" => self.num_categories = Some(parse(&key, value)?),
            "lrdecaysteps" => self.lr_decay_steps = parse(&key, value)?,
            "lrdecayrate" => self.lr_decay_rate = parse(&key, value)?,
            "maxgradnorm" => self.max_grad_norm = parse(&key, value)?,
            "logeverybatches" | "logevery" => self.log_every_batches = parse(&key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Check every size and rate. Returns the category count on success.
    pub fn validate(&self) -> Result<usize> {
        let k = self
            .num_categories
            .ok_or_else(|| RmtppError::Config("num_categories is required".into()))?;
        let positive = [
            ("num_categories", k),
            ("hidden_layer_size", self.hidden_layer_size),
            ("batch_size", self.batch_size),
            ("embed_size", self.embed_size),
            ("bptt", self.bptt),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(RmtppError::Config(format!("{} must be positive", name)));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(RmtppError::Config("learning_rate must be a positive number".into()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(RmtppError::Config("momentum must lie in [0, 1)".into()));
        }
        if self.lr_decay_steps == 0 {
            return Err(RmtppError::Config("lr_decay_steps must be positive".into()));
        }
        if !(self.lr_decay_rate.is_finite() && self.lr_decay_rate >= 0.0) {
            return Err(RmtppError::Config("lr_decay_rate must be non-negative".into()));
        }
        if !(self.max_grad_norm.is_finite() && self.max_grad_norm > 0.0) {
            return Err(RmtppError::Config("max_grad_norm must be positive".into()));
        }
        if self.precision != Precision::F32 {
            return Err(RmtppError::Config(
                "only f32 precision is supported by the tensor engine".into(),
            ));
        }
        Ok(k)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RmtppError::Config(format!("invalid value '{}' for {}", value, key)))
}
