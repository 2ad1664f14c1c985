// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::KindDescriptor;
use crate::protos::metric::Metric;

pub(super) const DESCRIPTOR: KindDescriptor = KindDescriptor {
  channels: &["count"],
  defaults: &[0.0],
  persist: &[true],
};

//
// CounterState
//

// Sample-rate corrected event counting. Tick and flush each drain their own accumulator, so a
// sample injected mid-minute shows up in exactly one tick and exactly one flush.
#[derive(Default)]
pub struct CounterState {
  tick_count: f64,
  flush_count: f64,
}

impl CounterState {
  pub fn inject(&mut self, metric: &Metric) {
    let weighted = metric.value / metric.sample_rate;
    self.tick_count += weighted;
    self.flush_count += weighted;
  }

  pub fn tick(&mut self) -> Vec<f64> {
    vec![std::mem::take(&mut self.tick_count)]
  }

  pub fn flush(&mut self) -> Vec<f64> {
    vec![std::mem::take(&mut self.flush_count)]
  }
}

//
// CounterAggregator
//

// Window sums: get() drains the accumulator so each output row covers exactly one window. Rows
// with no underlying records sum to zero.
#[derive(Default)]
pub struct CounterAggregator {
  acc: f64,
}

impl CounterAggregator {
  pub fn channels(&self) -> Vec<usize> {
    vec![0]
  }

  pub fn put(&mut self, row: &[f64]) {
    self.acc += row[0];
  }

  pub fn get(&mut self) -> Vec<f64> {
    vec![std::mem::take(&mut self.acc)]
  }
}
