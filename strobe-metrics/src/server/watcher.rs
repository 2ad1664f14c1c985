// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./watcher_test.rs"]
mod watcher_test;

use super::entry::MetricEntry;
use crate::types::Aggregator;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(0);

//
// WatcherSink
//

// The server-side half of a watcher, stored on the metric entry and fed under the entry lock.
// Live watchers (no aggregator) get one row per tick; aggregating watchers are fed at flush and
// emit at aligned boundaries. Sends never block: the channel is unbounded and the forwarder
// task buffers for slow consumers.
pub(super) struct WatcherSink {
  pub id: u64,
  pub channels: Vec<usize>,
  pub aggregator: Option<Aggregator>,
  pub offs: i64,
  pub gran: i64,
  pub tx: mpsc::UnboundedSender<Vec<f64>>,
}

//
// Watcher
//

// The consumer handle. Must be explicitly closed; an unclosed watcher keeps its metric entry
// alive and receiving pushes until the server stops.
pub struct Watcher {
  ts: i64,
  out: mpsc::Receiver<Vec<f64>>,
  entry: Arc<Mutex<MetricEntry>>,
  id: u64,
}

impl Watcher {
  pub(super) fn attach(
    entry: &Arc<Mutex<MetricEntry>>,
    me: &mut MetricEntry,
    channels: Vec<usize>,
    aggregator: Option<Aggregator>,
    offs: i64,
    gran: i64,
    ts: i64,
  ) -> Self {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(1);
    let id = NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed);
    me.watchers.push(WatcherSink {
      id,
      channels,
      aggregator,
      offs,
      gran,
      tx: in_tx,
    });
    tokio::spawn(run(in_rx, out_tx));
    Self {
      ts,
      out: out_rx,
      entry: Arc::clone(entry),
      id,
    }
  }

  // The timestamp the first emitted row corresponds to (exclusive: the first row covers the
  // second or window immediately after it).
  #[must_use]
  pub const fn ts(&self) -> i64 {
    self.ts
  }

  pub async fn recv(&mut self) -> Option<Vec<f64>> {
    self.out.recv().await
  }

  // Detach from the metric entry. Rows already buffered still drain to recv() before it reports
  // end of stream.
  pub fn close(&self) {
    let mut me = self.entry.lock();
    if let Some(i) = me.watchers.iter().position(|w| w.id == self.id) {
      me.watchers.swap_remove(i);
      if me.watchers.capacity() > 2 * me.watchers.len() {
        me.watchers.shrink_to_fit();
      }
    }
  }
}

// The buffered bridge between the tick loop and a consumer of unknown speed. The input side
// never blocks; once the input closes the buffer drains and the output closes.
async fn run(mut rx: mpsc::UnboundedReceiver<Vec<f64>>, tx: mpsc::Sender<Vec<f64>>) {
  let mut buffer: VecDeque<Vec<f64>> = VecDeque::new();
  loop {
    if buffer.is_empty() {
      match rx.recv().await {
        Some(row) => buffer.push_back(row),
        None => break,
      }
    } else {
      tokio::select! {
        permit = tx.reserve() => match permit {
          Ok(permit) => {
            if let Some(row) = buffer.pop_front() {
              permit.send(row);
            }
          },
          // Consumer dropped the receiving end.
          Err(_) => return,
        },
        row = rx.recv() => match row {
          Some(row) => buffer.push_back(row),
          None => break,
        },
      }
    }
  }
  for row in buffer {
    if tx.send(row).await.is_err() {
      return;
    }
  }
}
