// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::protos::metric::MetricKind;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn forwarder_buffers_and_preserves_order() {
  let (in_tx, in_rx) = mpsc::unbounded_channel();
  let (out_tx, mut out_rx) = mpsc::channel(1);
  let task = tokio::spawn(run(in_rx, out_tx));

  // Produce far more than the output channel can hold before anything is consumed.
  for i in 0 .. 100 {
    in_tx.send(vec![f64::from(i)]).unwrap();
  }
  for i in 0 .. 100 {
    assert_eq!(out_rx.recv().await, Some(vec![f64::from(i)]));
  }

  drop(in_tx);
  assert_eq!(out_rx.recv().await, None);
  task.await.unwrap();
}

#[tokio::test]
async fn forwarder_drains_after_input_closes() {
  let (in_tx, in_rx) = mpsc::unbounded_channel();
  let (out_tx, mut out_rx) = mpsc::channel(1);
  let task = tokio::spawn(run(in_rx, out_tx));

  in_tx.send(vec![1.0]).unwrap();
  in_tx.send(vec![2.0]).unwrap();
  in_tx.send(vec![3.0]).unwrap();
  drop(in_tx);

  assert_eq!(out_rx.recv().await, Some(vec![1.0]));
  assert_eq!(out_rx.recv().await, Some(vec![2.0]));
  assert_eq!(out_rx.recv().await, Some(vec![3.0]));
  assert_eq!(out_rx.recv().await, None);
  task.await.unwrap();
}

#[tokio::test]
async fn close_detaches_from_the_entry() {
  let entry = Arc::new(Mutex::new(MetricEntry::new(
    MetricKind::Counter,
    "x".to_string(),
    0,
    &[0.0],
  )));

  let (first, second) = {
    let mut me = entry.lock();
    let first = Watcher::attach(&entry, &mut me, vec![0], None, 0, 0, 0);
    let second = Watcher::attach(&entry, &mut me, vec![0], None, 0, 0, 0);
    (first, second)
  };
  assert_eq!(entry.lock().watchers.len(), 2);

  first.close();
  assert_eq!(entry.lock().watchers.len(), 1);
  // Closing twice is harmless.
  first.close();
  assert_eq!(entry.lock().watchers.len(), 1);

  second.close();
  assert!(entry.lock().watchers.is_empty());
}

#[tokio::test]
async fn closed_watcher_drains_then_ends() {
  let entry = Arc::new(Mutex::new(MetricEntry::new(
    MetricKind::Counter,
    "x".to_string(),
    0,
    &[0.0],
  )));
  let mut watcher = {
    let mut me = entry.lock();
    Watcher::attach(&entry, &mut me, vec![0], None, 0, 0, 0)
  };

  entry.lock().tick(1);
  watcher.close();

  // The tick row produced before the close still arrives, then the stream ends.
  assert_eq!(watcher.recv().await, Some(vec![0.0]));
  assert_eq!(watcher.recv().await, None);
}
