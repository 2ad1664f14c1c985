// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

mod avg;
mod counter;
mod gauge;
mod timer;

use self::avg::{AvgAggregator, AvgState};
use self::counter::{CounterAggregator, CounterState};
use self::gauge::{GaugeAggregator, GaugeState};
use self::timer::{TimerAggregator, TimerState};
use crate::protos::metric::{Metric, MetricKind};
use thiserror::Error;

//
// ChannelError
//

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ChannelError {
  #[error("no such channel")]
  NoSuchChannel,
  #[error("cannot mix channels of different metric kinds")]
  MixedTypes,
  #[error("no channels specified")]
  NoChannels,
  #[error("channel names must be unique")]
  NonUniqueChannels,
}

//
// KindDescriptor
//

// The static catalog entry for a metric kind: its ordered channel names, the default value a
// channel takes before anything was observed, and whether the channel is written to the
// datastore at flush time.
pub struct KindDescriptor {
  pub channels: &'static [&'static str],
  pub defaults: &'static [f64],
  pub persist: &'static [bool],
}

impl MetricKind {
  #[must_use]
  pub const fn descriptor(self) -> &'static KindDescriptor {
    match self {
      Self::Counter => &counter::DESCRIPTOR,
      Self::Gauge => &gauge::DESCRIPTOR,
      Self::Avg => &avg::DESCRIPTOR,
      Self::Timer => &timer::DESCRIPTOR,
    }
  }
}

// Resolve a channel set back to the unique kind that carries all of them. Kinds are searched in
// declaration order, so a name that exists in several kinds ("count" lives in both Counter and
// Avg) resolves to the first one.
pub fn kind_by_channels(channels: &[&str]) -> Result<MetricKind, ChannelError> {
  if channels.is_empty() {
    return Err(ChannelError::NoChannels);
  }
  for (i, channel) in channels.iter().enumerate() {
    if channels[.. i].iter().any(|c| *c == *channel) {
      return Err(ChannelError::NonUniqueChannels);
    }
  }

  for kind in MetricKind::ALL {
    let descriptor = kind.descriptor();
    if channels
      .iter()
      .all(|channel| descriptor.channels.iter().any(|c| *c == *channel))
    {
      return Ok(kind);
    }
  }

  let all_known = channels.iter().all(|channel| {
    MetricKind::ALL
      .iter()
      .any(|kind| kind.descriptor().channels.iter().any(|c| *c == *channel))
  });
  if all_known {
    Err(ChannelError::MixedTypes)
  } else {
    Err(ChannelError::NoSuchChannel)
  }
}

pub fn channel_index(kind: MetricKind, channel: &str) -> Result<usize, ChannelError> {
  kind
    .descriptor()
    .channels
    .iter()
    .position(|c| *c == channel)
    .ok_or(ChannelError::NoSuchChannel)
}

//
// MetricState
//

// Per-entry aggregation state, dispatched as a tagged variant over the closed kind set.
pub enum MetricState {
  Counter(CounterState),
  Gauge(GaugeState),
  Avg(AvgState),
  Timer(TimerState),
}

impl MetricState {
  #[must_use]
  pub fn new(kind: MetricKind) -> Self {
    match kind {
      MetricKind::Counter => Self::Counter(CounterState::default()),
      MetricKind::Gauge => Self::Gauge(GaugeState::default()),
      MetricKind::Avg => Self::Avg(AvgState::default()),
      MetricKind::Timer => Self::Timer(TimerState::default()),
    }
  }

  // Seed from the per-channel defaults computed at entry creation. Only gauges carry state
  // across process lifetimes.
  pub fn init(&mut self, defaults: &[f64]) {
    if let Self::Gauge(state) = self {
      state.init(defaults);
    }
  }

  pub fn inject(&mut self, metric: &Metric) {
    match self {
      Self::Counter(state) => state.inject(metric),
      Self::Gauge(state) => state.inject(metric),
      Self::Avg(state) => state.inject(metric),
      Self::Timer(state) => state.inject(metric),
    }
  }

  // The per-second snapshot, one value per channel.
  pub fn tick(&mut self) -> Vec<f64> {
    match self {
      Self::Counter(state) => state.tick(),
      Self::Gauge(state) => state.tick(),
      Self::Avg(state) => state.tick(),
      Self::Timer(state) => state.tick(),
    }
  }

  // The per-minute aggregate, one value per channel.
  pub fn flush(&mut self) -> Vec<f64> {
    match self {
      Self::Counter(state) => state.flush(),
      Self::Gauge(state) => state.flush(),
      Self::Avg(state) => state.flush(),
      Self::Timer(state) => state.flush(),
    }
  }
}

//
// Aggregator
//

// Recombines per-minute flushed values into coarser windows for range queries and aggregating
// watchers. An aggregator may require more input channels than were requested (an average needs
// the count to weigh means, a timer needs it to weigh quantiles); `channels()` names the inputs
// and `get()` emits only the requested channels, in request order.
pub enum Aggregator {
  Counter(CounterAggregator),
  Gauge(GaugeAggregator),
  Avg(AvgAggregator),
  Timer(TimerAggregator),
}

impl Aggregator {
  pub fn new(kind: MetricKind, channels: &[&str]) -> Result<Self, ChannelError> {
    let requested = channels
      .iter()
      .map(|channel| channel_index(kind, channel))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(match kind {
      MetricKind::Counter => Self::Counter(CounterAggregator::default()),
      MetricKind::Gauge => Self::Gauge(GaugeAggregator::default()),
      MetricKind::Avg => Self::Avg(AvgAggregator::new(requested)),
      MetricKind::Timer => Self::Timer(TimerAggregator::new(requested)),
    })
  }

  // Indices of the input channels a put() row must carry, in row order.
  #[must_use]
  pub fn channels(&self) -> Vec<usize> {
    match self {
      Self::Counter(aggregator) => aggregator.channels(),
      Self::Gauge(aggregator) => aggregator.channels(),
      Self::Avg(aggregator) => aggregator.channels(),
      Self::Timer(aggregator) => aggregator.channels(),
    }
  }

  pub fn init(&mut self, defaults: &[f64]) {
    if let Self::Gauge(aggregator) = self {
      aggregator.init(defaults);
    }
  }

  pub fn put(&mut self, row: &[f64]) {
    match self {
      Self::Counter(aggregator) => aggregator.put(row),
      Self::Gauge(aggregator) => aggregator.put(row),
      Self::Avg(aggregator) => aggregator.put(row),
      Self::Timer(aggregator) => aggregator.put(row),
    }
  }

  pub fn get(&mut self) -> Vec<f64> {
    match self {
      Self::Counter(aggregator) => aggregator.get(),
      Self::Gauge(aggregator) => aggregator.get(),
      Self::Avg(aggregator) => aggregator.get(),
      Self::Timer(aggregator) => aggregator.get(),
    }
  }
}
