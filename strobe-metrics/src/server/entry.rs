// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::watcher::WatcherSink;
use super::LIVE_LOG_SIZE;
use crate::protos::metric::{Metric, MetricKind};
use crate::types::MetricState;

//
// MetricEntry
//

// In-memory state of one live metric: the kind state machine, the per-channel ring of the last
// 600 per-second samples, idle accounting for eviction, and the attached watchers. Guarded by a
// per-entry mutex owned by the server; the server lock is always taken first.
pub(super) struct MetricEntry {
  pub kind: MetricKind,
  pub name: String,
  pub state: MetricState,
  pub live_log: Vec<Box<[f64; LIVE_LOG_SIZE]>>,
  pub live_ptr: usize,
  pub last_tick: i64,
  pub recvd_input_tick: bool,
  pub recvd_input_since_flush: bool,
  pub idle_ticks: usize,
  pub watchers: Vec<WatcherSink>,
}

impl MetricEntry {
  pub fn new(kind: MetricKind, name: String, last_tick: i64, init: &[f64]) -> Self {
    let mut state = MetricState::new(kind);
    state.init(init);
    Self {
      kind,
      name,
      state,
      live_log: init.iter().map(|def| Box::new([*def; LIVE_LOG_SIZE])).collect(),
      live_ptr: 0,
      last_tick,
      recvd_input_tick: false,
      recvd_input_since_flush: false,
      idle_ticks: 0,
      watchers: Vec::new(),
    }
  }

  pub fn inject(&mut self, metric: &Metric) {
    self.state.inject(metric);
    self.recvd_input_tick = true;
    self.recvd_input_since_flush = true;
  }

  pub fn update_idle(&mut self) {
    if self.recvd_input_tick {
      self.idle_ticks = 0;
      self.recvd_input_tick = false;
    } else {
      self.idle_ticks += 1;
    }
  }

  // Advance one second: write the per-second snapshot into the ring and push a row to every
  // live watcher.
  pub fn tick(&mut self, ts: i64) {
    let data = self.state.tick();
    for (c, ring) in self.live_log.iter_mut().enumerate() {
      ring[self.live_ptr] = data[c];
    }
    self.live_ptr = (self.live_ptr + 1) % LIVE_LOG_SIZE;
    self.last_tick = ts;

    for w in &self.watchers {
      if w.aggregator.is_some() {
        continue;
      }
      let row: Vec<f64> = w.channels.iter().map(|c| data[*c]).collect();
      let _ = w.tx.send(row);
    }
  }

  // Minute boundary: close out the terminal second, feed aggregating watchers, and return the
  // minute aggregate for persistence.
  pub fn flush(&mut self, ts: i64) -> Vec<f64> {
    self.tick(ts);
    let data = self.state.flush();

    for w in &mut self.watchers {
      let Some(aggregator) = &mut w.aggregator else {
        continue;
      };
      let row: Vec<f64> = w.channels.iter().map(|c| data[*c]).collect();
      aggregator.put(&row);
      if (ts - w.offs) % w.gran == 0 {
        let _ = w.tx.send(aggregator.get());
      }
    }
    data
  }

  pub fn eligible_for_eviction(&self) -> bool {
    !self.recvd_input_since_flush && self.watchers.is_empty() && self.idle_ticks > LIVE_LOG_SIZE
  }
}
