// ============================================================================
// DATA PREPARATION
// Padded in/out views of event sequences, batching and BPTT windows.
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Result, RmtppError};

/// Four parallel `[num_sequences, sequence_length]` arrays. Mark 0 is padding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    #[serde(rename = "train_event_in_seq")]
    pub event_in: Vec<Vec<usize>>,
    #[serde(rename = "train_time_in_seq")]
    pub time_in: Vec<Vec<f32>>,
    #[serde(rename = "train_event_out_seq")]
    pub event_out: Vec<Vec<usize>>,
    #[serde(rename = "train_time_out_seq")]
    pub time_out: Vec<Vec<f32>>,
}

impl TrainingData {
    /// Build the shifted views from raw `(mark, timestamp)` sequences. The "in"
    /// view holds events `0..n-1`, the "out" view events `1..n`; both are
    /// right-padded with mark 0 and time 0 to the longest sequence.
    pub fn from_sequences(seqs: &[Vec<(usize, f32)>]) -> Self {
        let width = seqs.iter().map(|s| s.len().saturating_sub(1)).max().unwrap_or(0);
        let mut data = TrainingData::default();
        for s in seqs {
            let n = s.len().saturating_sub(1);
            let mut ev_in = vec![0usize; width];
            let mut t_in = vec![0.0f32; width];
            let mut ev_out = vec![0usize; width];
            let mut t_out = vec![0.0f32; width];
            for i in 0..n {
                (ev_in[i], t_in[i]) = s[i];
                (ev_out[i], t_out[i]) = s[i + 1];
            }
            data.event_in.push(ev_in);
            data.time_in.push(t_in);
            data.event_out.push(ev_out);
            data.time_out.push(t_out);
        }
        data
    }

    pub fn num_sequences(&self) -> usize { self.event_in.len() }

    pub fn seq_len(&self) -> usize { self.event_in.first().map_or(0, |r| r.len()) }

    /// Check equal rectangular shapes, marks within `0..=num_categories` and
    /// finite times.
    pub fn validate(&self, num_categories: usize) -> Result<()> {
        check_views(&self.event_in, &self.time_in, &self.event_out, &self.time_out, num_categories)
            .map_err(RmtppError::Data)
    }

    /// Gather the rows named by `idxes` into a batch.
    pub fn batch(&self, idxes: &[usize]) -> Batch {
        Batch {
            event_in: idxes.iter().map(|&i| self.event_in[i].clone()).collect(),
            time_in: idxes.iter().map(|&i| self.time_in[i].clone()).collect(),
            event_out: idxes.iter().map(|&i| self.event_out[i].clone()).collect(),
            time_out: idxes.iter().map(|&i| self.time_out[i].clone()).collect(),
        }
    }
}

/// Rows of a batch, or a window of columns of one.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub event_in: Vec<Vec<usize>>,
    pub time_in: Vec<Vec<f32>>,
    pub event_out: Vec<Vec<usize>>,
    pub time_out: Vec<Vec<f32>>,
}

impl Batch {
    pub fn rows(&self) -> usize { self.event_in.len() }

    /// Same checks as [`TrainingData::validate`], reported as an invalid argument.
    pub fn validate(&self, num_categories: usize) -> Result<()> {
        check_views(&self.event_in, &self.time_in, &self.event_out, &self.time_out, num_categories)
            .map_err(RmtppError::InvalidArgument)
    }

    pub fn len(&self) -> usize { self.event_in.first().map_or(0, |r| r.len()) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of full `bptt`-wide windows. A trailing partial window is dropped.
    pub fn num_chunks(&self, bptt: usize) -> usize { self.len() / bptt }

    /// Columns `[idx * bptt, (idx + 1) * bptt)`.
    pub fn chunk(&self, idx: usize, bptt: usize) -> Batch {
        self.columns(idx * bptt, (idx + 1) * bptt)
    }

    pub fn columns(&self, start: usize, end: usize) -> Batch {
        Batch {
            event_in: self.event_in.iter().map(|r| r[start..end].to_vec()).collect(),
            time_in: self.time_in.iter().map(|r| r[start..end].to_vec()).collect(),
            event_out: self.event_out.iter().map(|r| r[start..end].to_vec()).collect(),
            time_out: self.time_out.iter().map(|r| r[start..end].to_vec()).collect(),
        }
    }

    /// Column `t` of the four views as f32 vectors (marks are exact small ints).
    pub(crate) fn step_columns(&self, t: usize) -> [Vec<f32>; 4] {
        [
            self.event_in.iter().map(|r| r[t] as f32).collect(),
            self.event_out.iter().map(|r| r[t] as f32).collect(),
            self.time_in.iter().map(|r| r[t]).collect(),
            self.time_out.iter().map(|r| r[t]).collect(),
        ]
    }
}

fn check_views(
    event_in: &[Vec<usize>],
    time_in: &[Vec<f32>],
    event_out: &[Vec<usize>],
    time_out: &[Vec<f32>],
    num_categories: usize,
) -> std::result::Result<(), String> {
    let n = event_in.len();
    if time_in.len() != n || event_out.len() != n || time_out.len() != n {
        return Err(format!(
            "array lengths differ: event_in={} time_in={} event_out={} time_out={}",
            n, time_in.len(), event_out.len(), time_out.len()
        ));
    }
    let width = event_in.first().map_or(0, |r| r.len());
    for i in 0..n {
        let lens = [event_in[i].len(), time_in[i].len(), event_out[i].len(), time_out[i].len()];
        if lens.iter().any(|&l| l != width) {
            return Err(format!("sequence {} has lengths {:?}, expected {}", i, lens, width));
        }
        if let Some(m) = event_in[i].iter().chain(event_out[i].iter()).find(|&&m| m > num_categories) {
            return Err(format!("sequence {} has mark {} outside 0..={}", i, m, num_categories));
        }
        if time_in[i].iter().chain(time_out[i].iter()).any(|t| !t.is_finite()) {
            return Err(format!("sequence {} has a non-finite time", i));
        }
    }
    Ok(())
}
