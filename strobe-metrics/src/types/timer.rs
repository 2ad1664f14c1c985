// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./timer_test.rs"]
mod timer_test;

use super::KindDescriptor;
use crate::protos::metric::Metric;

const MIN_CHANNEL: usize = 0;
const MAX_CHANNEL: usize = 4;
const CNT_CHANNEL: usize = 5;

pub(super) const DESCRIPTOR: KindDescriptor = KindDescriptor {
  channels: &[
    "timer-min",
    "timer-quart1",
    "timer-median",
    "timer-quart3",
    "timer-max",
    "timer-cnt",
  ],
  defaults: &[f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN, 0.0],
  persist: &[false; 6],
};

//
// TimerState
//

// Weighted observation buffers: one for the current second, one for the current minute. A tick
// snapshots the second buffer and rolls it into the minute buffer; a flush snapshots and clears
// the minute buffer.
#[derive(Default)]
pub struct TimerState {
  tick_data: Vec<f64>,
  tick_weight: Vec<f64>,
  data: Vec<f64>,
  weight: Vec<f64>,
}

impl TimerState {
  pub fn inject(&mut self, metric: &Metric) {
    self.tick_data.push(metric.value);
    self.tick_weight.push(1.0 / metric.sample_rate);
  }

  pub fn tick(&mut self) -> Vec<f64> {
    let stats = timer_stats(&self.tick_data, &self.tick_weight);
    self.data.append(&mut self.tick_data);
    self.weight.append(&mut self.tick_weight);
    stats
  }

  pub fn flush(&mut self) -> Vec<f64> {
    let stats = timer_stats(&self.data, &self.weight);
    self.data.clear();
    self.weight.clear();
    stats
  }
}

// Quantile snapshot over weighted observations: with total weight N, quantile q is the first
// value (ascending) whose cumulative weight reaches or crosses qN.
fn timer_stats(data: &[f64], weight: &[f64]) -> Vec<f64> {
  if data.is_empty() {
    return vec![f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN, 0.0];
  }

  let mut samples: Vec<(f64, f64)> = data
    .iter()
    .copied()
    .zip(weight.iter().copied())
    .collect();
  samples.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

  let total: f64 = weight.iter().sum();
  let (mut quart1, mut median, mut quart3) = (0.0, 0.0, 0.0);
  let mut cumulative = 0.0;
  for (value, w) in &samples {
    if cumulative + w >= total * 0.25 && cumulative < total * 0.25 {
      quart1 = *value;
    }
    if cumulative + w >= total * 0.50 && cumulative < total * 0.50 {
      median = *value;
    }
    if cumulative + w >= total * 0.75 && cumulative < total * 0.75 {
      quart3 = *value;
    }
    cumulative += w;
  }

  vec![
    samples[0].0,
    quart1,
    median,
    quart3,
    samples[samples.len() - 1].0,
    total,
  ]
}

//
// TimerAggregator
//

// Recombines per-minute quantile snapshots: extremes combine exactly, counts sum, and the inner
// quantiles degrade to count-weighted means of the per-minute values. The count channel is
// always consumed as an input for weighting.
pub struct TimerAggregator {
  requested: Vec<usize>,
  inputs: Vec<usize>,
  cnt_pos: usize,
  acc: Vec<f64>,
  weight: f64,
}

impl TimerAggregator {
  pub fn new(requested: Vec<usize>) -> Self {
    let mut inputs = requested.clone();
    if !inputs.contains(&CNT_CHANNEL) {
      inputs.push(CNT_CHANNEL);
    }
    let cnt_pos = inputs
      .iter()
      .position(|channel| *channel == CNT_CHANNEL)
      .unwrap_or(inputs.len() - 1);
    let acc = vec![f64::NAN; requested.len()];
    Self {
      requested,
      inputs,
      cnt_pos,
      acc,
      weight: 0.0,
    }
  }

  pub fn channels(&self) -> Vec<usize> {
    self.inputs.clone()
  }

  pub fn put(&mut self, row: &[f64]) {
    let w = row[self.cnt_pos];
    if !(w > 0.0) {
      // Empty minutes carry NaN quantiles and a zero count.
      return;
    }
    for (k, channel) in self.requested.iter().enumerate() {
      let value = row[k];
      match *channel {
        MIN_CHANNEL => self.acc[k] = self.acc[k].min(value),
        MAX_CHANNEL => self.acc[k] = self.acc[k].max(value),
        CNT_CHANNEL => {
          if self.acc[k].is_nan() {
            self.acc[k] = 0.0;
          }
          self.acc[k] += w;
        },
        _ => {
          if self.acc[k].is_nan() {
            self.acc[k] = 0.0;
          }
          self.acc[k] += value * w;
        },
      }
    }
    self.weight += w;
  }

  pub fn get(&mut self) -> Vec<f64> {
    let weight = std::mem::take(&mut self.weight);
    let out = self
      .requested
      .iter()
      .enumerate()
      .map(|(k, channel)| match *channel {
        MIN_CHANNEL | MAX_CHANNEL => self.acc[k],
        CNT_CHANNEL => {
          if self.acc[k].is_nan() {
            0.0
          } else {
            self.acc[k]
          }
        },
        _ => self.acc[k] / weight,
      })
      .collect();
    self.acc = vec![f64::NAN; self.requested.len()];
    out
  }
}
