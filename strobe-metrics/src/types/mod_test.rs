// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

fn sample(kind: MetricKind, value: f64, sample_rate: f64) -> Metric {
  Metric {
    name: "m".into(),
    kind,
    value,
    sample_rate,
  }
}

#[test]
fn kind_resolution() {
  assert_eq!(kind_by_channels(&["count"]), Ok(MetricKind::Counter));
  assert_eq!(kind_by_channels(&["value"]), Ok(MetricKind::Gauge));
  assert_eq!(kind_by_channels(&["mean", "count"]), Ok(MetricKind::Avg));
  assert_eq!(kind_by_channels(&["mean"]), Ok(MetricKind::Avg));
  assert_eq!(
    kind_by_channels(&["timer-median", "timer-cnt"]),
    Ok(MetricKind::Timer)
  );

  assert_eq!(kind_by_channels(&[]), Err(ChannelError::NoChannels));
  assert_eq!(
    kind_by_channels(&["count", "count"]),
    Err(ChannelError::NonUniqueChannels)
  );
  assert_eq!(
    kind_by_channels(&["count", "value"]),
    Err(ChannelError::MixedTypes)
  );
  assert_eq!(kind_by_channels(&["bogus"]), Err(ChannelError::NoSuchChannel));
  assert_eq!(
    kind_by_channels(&["count", "bogus"]),
    Err(ChannelError::NoSuchChannel)
  );
}

#[test]
fn channel_indices() {
  assert_eq!(channel_index(MetricKind::Counter, "count"), Ok(0));
  assert_eq!(channel_index(MetricKind::Avg, "count"), Ok(1));
  assert_eq!(channel_index(MetricKind::Timer, "timer-max"), Ok(4));
  assert_eq!(
    channel_index(MetricKind::Gauge, "count"),
    Err(ChannelError::NoSuchChannel)
  );
}

#[test]
fn descriptors_are_consistent() {
  for kind in MetricKind::ALL {
    let descriptor = kind.descriptor();
    assert_eq!(descriptor.channels.len(), descriptor.defaults.len());
    assert_eq!(descriptor.channels.len(), descriptor.persist.len());
    assert!(!descriptor.channels.is_empty());
  }
}

#[test]
fn counter_state_drains_per_interval() {
  let mut state = MetricState::new(MetricKind::Counter);
  state.inject(&sample(MetricKind::Counter, 3.0, 1.0));
  state.inject(&sample(MetricKind::Counter, 3.0, 0.5));

  // 3 + 3/0.5.
  assert_eq!(state.tick(), vec![9.0]);
  assert_eq!(state.tick(), vec![0.0]);

  state.inject(&sample(MetricKind::Counter, 1.0, 1.0));
  assert_eq!(state.tick(), vec![1.0]);
  // The flush accumulator is independent of the tick accumulator.
  assert_eq!(state.flush(), vec![10.0]);
  assert_eq!(state.flush(), vec![0.0]);
}

#[test]
fn gauge_state_holds_last_write() {
  let mut state = MetricState::new(MetricKind::Gauge);
  state.init(&[42.0]);
  assert_eq!(state.tick(), vec![42.0]);

  state.inject(&sample(MetricKind::Gauge, 7.0, 1.0));
  assert_eq!(state.tick(), vec![7.0]);
  assert_eq!(state.flush(), vec![7.0]);
  assert_eq!(state.tick(), vec![7.0]);
}

#[test]
fn avg_state_weighs_by_sample_rate() {
  let mut state = MetricState::new(MetricKind::Avg);
  state.inject(&sample(MetricKind::Avg, 10.0, 1.0));
  state.inject(&sample(MetricKind::Avg, 20.0, 0.5));

  // sum = 30 over weight 3.
  assert_eq!(state.tick(), vec![10.0, 3.0]);
  let empty = state.tick();
  assert!(empty[0].is_nan());
  assert_eq!(empty[1], 0.0);
  assert_eq!(state.flush(), vec![10.0, 3.0]);
}

#[test]
fn counter_aggregator_sums_per_window() {
  let mut aggregator = Aggregator::new(MetricKind::Counter, &["count"]).unwrap();
  assert_eq!(aggregator.channels(), vec![0]);

  aggregator.init(&[123.0]);
  aggregator.put(&[5.0]);
  aggregator.put(&[7.0]);
  assert_eq!(aggregator.get(), vec![12.0]);
  // Empty windows sum to zero; the seeded default does not leak in.
  assert_eq!(aggregator.get(), vec![0.0]);
}

#[test]
fn gauge_aggregator_holds_across_windows() {
  let mut aggregator = Aggregator::new(MetricKind::Gauge, &["value"]).unwrap();
  aggregator.init(&[42.0]);
  assert_eq!(aggregator.get(), vec![42.0]);
  aggregator.put(&[7.0]);
  assert_eq!(aggregator.get(), vec![7.0]);
  assert_eq!(aggregator.get(), vec![7.0]);
}

#[test]
fn avg_aggregator_weighs_means_by_count() {
  let mut aggregator = Aggregator::new(MetricKind::Avg, &["mean", "count"]).unwrap();
  assert_eq!(aggregator.channels(), vec![0, 1]);

  aggregator.put(&[10.0, 1.0]);
  aggregator.put(&[20.0, 3.0]);
  assert_eq!(aggregator.get(), vec![17.5, 4.0]);

  // Minutes without samples are ignored rather than poisoning the window.
  aggregator.put(&[f64::NAN, 0.0]);
  aggregator.put(&[8.0, 2.0]);
  assert_eq!(aggregator.get(), vec![8.0, 2.0]);
}

#[test]
fn avg_aggregator_mean_only_request_still_weighs() {
  let mut aggregator = Aggregator::new(MetricKind::Avg, &["mean"]).unwrap();
  // Both channels are inputs even though only the mean was requested.
  assert_eq!(aggregator.channels(), vec![0, 1]);
  aggregator.put(&[10.0, 1.0]);
  aggregator.put(&[20.0, 3.0]);
  assert_eq!(aggregator.get(), vec![17.5]);
}
