// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::KindDescriptor;
use crate::protos::metric::Metric;

const MEAN_CHANNEL: usize = 0;
const COUNT_CHANNEL: usize = 1;

pub(super) const DESCRIPTOR: KindDescriptor = KindDescriptor {
  channels: &["mean", "count"],
  defaults: &[f64::NAN, 0.0],
  persist: &[true, true],
};

//
// AvgState
//

// Running sum plus a sample-rate weighted count per interval. An interval with no samples
// reports a NaN mean and a zero count.
#[derive(Default)]
pub struct AvgState {
  tick_sum: f64,
  tick_count: f64,
  sum: f64,
  count: f64,
}

impl AvgState {
  pub fn inject(&mut self, metric: &Metric) {
    let weight = 1.0 / metric.sample_rate;
    self.tick_sum += metric.value;
    self.tick_count += weight;
    self.sum += metric.value;
    self.count += weight;
  }

  pub fn tick(&mut self) -> Vec<f64> {
    let sum = std::mem::take(&mut self.tick_sum);
    let count = std::mem::take(&mut self.tick_count);
    vec![sum / count, count]
  }

  pub fn flush(&mut self) -> Vec<f64> {
    let sum = std::mem::take(&mut self.sum);
    let count = std::mem::take(&mut self.count);
    vec![sum / count, count]
  }
}

//
// AvgAggregator
//

// Count-weighted recombination of per-minute means. Both channels are always consumed as inputs
// so that a mean-only request still weighs correctly; get() emits only what was requested.
pub struct AvgAggregator {
  requested: Vec<usize>,
  sum: f64,
  count: f64,
}

impl AvgAggregator {
  pub fn new(requested: Vec<usize>) -> Self {
    Self {
      requested,
      sum: 0.0,
      count: 0.0,
    }
  }

  pub fn channels(&self) -> Vec<usize> {
    vec![MEAN_CHANNEL, COUNT_CHANNEL]
  }

  pub fn put(&mut self, row: &[f64]) {
    // Minutes with no samples carry (NaN, 0) and must not poison the window.
    if row[COUNT_CHANNEL] > 0.0 {
      self.sum += row[MEAN_CHANNEL] * row[COUNT_CHANNEL];
      self.count += row[COUNT_CHANNEL];
    }
  }

  pub fn get(&mut self) -> Vec<f64> {
    let sum = std::mem::take(&mut self.sum);
    let count = std::mem::take(&mut self.count);
    self
      .requested
      .iter()
      .map(|channel| match *channel {
        MEAN_CHANNEL => sum / count,
        _ => count,
      })
      .collect()
  }
}
