// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::KindDescriptor;
use crate::protos::metric::Metric;

pub(super) const DESCRIPTOR: KindDescriptor = KindDescriptor {
  channels: &["value"],
  defaults: &[0.0],
  persist: &[true],
};

//
// GaugeState
//

// Last-write-wins. The initial value comes from the last persisted record, so a gauge survives
// entry eviction and process restarts.
#[derive(Default)]
pub struct GaugeState {
  value: f64,
}

impl GaugeState {
  pub fn init(&mut self, defaults: &[f64]) {
    self.value = defaults[0];
  }

  pub fn inject(&mut self, metric: &Metric) {
    self.value = metric.value;
  }

  pub fn tick(&mut self) -> Vec<f64> {
    vec![self.value]
  }

  pub fn flush(&mut self) -> Vec<f64> {
    vec![self.value]
  }
}

//
// GaugeAggregator
//

// Holds the most recent value across windows; a window without records repeats the previous one.
// init() seeds from the value persisted before the query range so leading empty windows are
// meaningful.
#[derive(Default)]
pub struct GaugeAggregator {
  value: f64,
}

impl GaugeAggregator {
  pub fn channels(&self) -> Vec<usize> {
    vec![0]
  }

  pub fn init(&mut self, defaults: &[f64]) {
    self.value = defaults[0];
  }

  pub fn put(&mut self, row: &[f64]) {
    self.value = row[0];
  }

  pub fn get(&mut self) -> Vec<f64> {
    vec![self.value]
  }
}
