// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


mod entry;
mod watcher;

pub use self::watcher::Watcher;

use self::entry::MetricEntry;
use crate::protos::metric::{Metric, MetricKind, ParseError, NUM_KINDS};
use crate::protos::statsd;
use crate::stats::Scope;
use crate::time::TimeProvider;
use crate::types::{self, Aggregator, ChannelError};
use bytes::Bytes;
use memchr::memchr;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use std::collections::HashMap;
use std::sync::Arc;
use strobe_store::{Datastore, Error as StoreError, Record};
use thiserror::Error;
use tokio::time::MissedTickBehavior;

pub const LIVE_LOG_SIZE: usize = 600;

type EntryGuard = parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, MetricEntry>;

//
// ServerError
//

#[derive(Debug, Error)]
pub enum ServerError {
  #[error("invalid parameter")]
  InvalidParameter,
  #[error("server not running")]
  NotRunning,
  #[error("server already running")]
  AlreadyRunning,
  #[error("server stopping")]
  Stopping,
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Channel(#[from] ChannelError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

//
// LiveLogSnapshot
//

// What Stop() hands back: every live entry's ring state, sufficient for a later Start() to
// resume the live log where it left off.
pub struct LiveLogSnapshot {
  entries: Vec<EntrySnapshot>,
}

impl LiveLogSnapshot {
  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

struct EntrySnapshot {
  kind: MetricKind,
  name: String,
  rings: Vec<Box<[f64; LIVE_LOG_SIZE]>>,
  live_ptr: usize,
  last_tick: i64,
}

//
// ServerStats
//

struct ServerStats {
  injected: IntCounter,
  unparsable: IntCounter,
  flushed_records: IntCounter,
  evicted_entries: IntCounter,
  entries: IntGauge,
}

impl ServerStats {
  fn new(scope: &Scope) -> Self {
    Self {
      injected: scope.counter("injected"),
      unparsable: scope.counter("unparsable"),
      flushed_records: scope.counter("flushed_records"),
      evicted_entries: scope.counter("evicted_entries"),
      entries: scope.gauge("entries"),
    }
  }
}

//
// Server
//

#[derive(Clone, Copy, PartialEq)]
enum Phase {
  Idle,
  Running,
  Stopping,
}

struct ServerState {
  phase: Phase,
  entries: [HashMap<String, Arc<Mutex<MetricEntry>>>; NUM_KINDS],
  last_tick: i64,
  tick_task: Option<tokio::task::JoinHandle<()>>,
}

struct Shared {
  prefix: String,
  ds: Arc<dyn Datastore>,
  time_provider: Arc<dyn TimeProvider>,
  stats: ServerStats,
  state: Mutex<ServerState>,
}

// One metric aggregation server. Many servers can share a datastore; the prefix namespaces this
// server's streams within it. The server is inert until start() spawns the tick task.
#[derive(Clone)]
pub struct Server {
  shared: Arc<Shared>,
}

impl Server {
  #[must_use]
  pub fn new(
    prefix: &str,
    ds: Arc<dyn Datastore>,
    time_provider: Arc<dyn TimeProvider>,
    scope: &Scope,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        prefix: prefix.to_string(),
        ds,
        time_provider,
        stats: ServerStats::new(scope),
        state: Mutex::new(ServerState {
          phase: Phase::Idle,
          entries: std::array::from_fn(|_| HashMap::new()),
          last_tick: 0,
          tick_task: None,
        }),
      }),
    }
  }

  // Start ticking. When a live-log snapshot from a previous stop() is supplied, its entries are
  // rehydrated before the first tick.
  pub fn start(&self, restored: Option<LiveLogSnapshot>) -> Result<(), ServerError> {
    let mut state = self.shared.state.lock();
    match state.phase {
      Phase::Running => return Err(ServerError::AlreadyRunning),
      Phase::Stopping => return Err(ServerError::Stopping),
      Phase::Idle => {},
    }

    state.last_tick = self.shared.time_provider.unix_now();
    if let Some(snapshot) = restored {
      for entry in snapshot.entries {
        self.shared.restore_entry(&mut state, entry);
      }
    }
    state.phase = Phase::Running;
    state.tick_task = Some(tokio::spawn(tick_loop(Arc::clone(&self.shared))));
    Ok(())
  }

  // Cooperative shutdown: the tick loop runs until the next minute boundary so the final minute
  // is flushed, then watcher inputs close and the entry tables are drained into a snapshot.
  pub async fn stop(&self) -> Result<LiveLogSnapshot, ServerError> {
    let task = {
      let mut state = self.shared.state.lock();
      match state.phase {
        Phase::Idle => return Err(ServerError::NotRunning),
        Phase::Stopping => return Err(ServerError::Stopping),
        Phase::Running => {},
      }
      state.phase = Phase::Stopping;
      state.tick_task.take()
    };
    if let Some(task) = task {
      if let Err(e) = task.await {
        log::warn!("tick task terminated abnormally: {e}");
      }
    }

    let mut state = self.shared.state.lock();
    let mut entries = Vec::new();
    for table in &mut state.entries {
      for (name, entry) in table.drain() {
        let mut me = entry.lock();
        // Dropping the sinks closes every watcher input channel.
        me.watchers.clear();
        entries.push(EntrySnapshot {
          kind: me.kind,
          name,
          rings: std::mem::take(&mut me.live_log),
          live_ptr: me.live_ptr,
          last_tick: me.last_tick,
        });
      }
    }
    self.shared.stats.entries.set(0);
    state.phase = Phase::Idle;
    Ok(LiveLogSnapshot { entries })
  }

  // Validate and route one sample to its entry, creating the entry on first reference.
  pub fn inject(&self, metric: &Metric) -> Result<(), ServerError> {
    if !metric.sample_rate.is_finite() || metric.sample_rate <= 0.0 {
      return Err(ParseError::SamplingInvalid.into());
    }
    if !metric.value.is_finite() {
      return Err(ParseError::ValueInvalid.into());
    }
    if metric.name.is_empty() {
      return Err(ParseError::NameMissing.into());
    }
    if metric.name.iter().any(|&b| b == b':' || b == b'/' || b == 0) {
      return Err(ParseError::NameInvalid.into());
    }
    let name = std::str::from_utf8(&metric.name).map_err(|_| ParseError::NameInvalid)?;

    let (_, mut me) = self.shared.metric_entry(metric.kind, name)?;
    me.inject(metric);
    self.shared.stats.injected.inc();
    Ok(())
  }

  // Ingest a raw datagram payload: one sample per line. Bad lines are logged and dropped; a
  // datagram never fails as a whole.
  pub fn inject_bytes(&self, buf: &Bytes) {
    let mut scan = buf.clone();
    loop {
      let (line, done) = match memchr(b'\n', &scan) {
        Some(i) => {
          let line = scan.slice(0 .. i);
          scan = scan.slice(i + 1 ..);
          (line, false)
        },
        None => (scan.clone(), true),
      };
      if !line.is_empty() {
        self.inject_line(line);
      }
      if done {
        return;
      }
    }
  }

  fn inject_line(&self, line: Bytes) {
    match statsd::parse(&line) {
      Ok(metric) => {
        if let Err(e) = self.inject(&metric) {
          self.shared.stats.unparsable.inc();
          log::warn!("dropping sample: {e} (line: {line:?})");
        }
      },
      Err(e) => {
        self.shared.stats.unparsable.inc();
        log::warn!("dropping unparsable line: {e} (line: {line:?})");
      },
    }
  }

  // The last 600 per-second samples for the requested channels, oldest first, together with the
  // timestamp of the first row.
  pub fn live_log(
    &self,
    name: &str,
    channels: &[&str],
  ) -> Result<(Vec<Vec<f64>>, i64), ServerError> {
    let kind = types::kind_by_channels(channels)?;
    let indices = channels
      .iter()
      .map(|channel| types::channel_index(kind, channel))
      .collect::<Result<Vec<_>, _>>()?;

    let (_, me) = self.shared.metric_entry(kind, name)?;
    let mut result = Vec::with_capacity(LIVE_LOG_SIZE);
    for k in 0 .. LIVE_LOG_SIZE {
      let slot = (me.live_ptr + k) % LIVE_LOG_SIZE;
      result.push(indices.iter().map(|c| me.live_log[*c][slot]).collect());
    }
    Ok((result, me.last_tick - LIVE_LOG_SIZE as i64))
  }

  // Historic range query: up to `length` rows starting at `from`, each aggregating the minute
  // records in a `gran`-second window. `from` and `gran` must be minute aligned. A minute is
  // only fed to the aggregator if every input channel has a record for it.
  pub fn log(
    &self,
    name: &str,
    channels: &[&str],
    from: i64,
    length: i64,
    gran: i64,
  ) -> Result<Vec<Vec<f64>>, ServerError> {
    if from % 60 != 0 || gran <= 0 || gran % 60 != 0 || length < 0 {
      return Err(ServerError::InvalidParameter);
    }
    let kind = types::kind_by_channels(channels)?;

    let length = length.min((self.shared.running_last_tick()? - from) / gran);
    if length <= 0 {
      return Ok(Vec::new());
    }

    let mut aggregator = Aggregator::new(kind, channels)?;
    let mut input =
      self
        .shared
        .init_aggregator(&mut aggregator, kind, name, from, from + gran * length)?;

    let mut output = Vec::with_capacity(length as usize);
    let mut ts = from;
    for _ in 0 .. length {
      feed_aggregator(&mut aggregator, &mut input, ts, gran);
      ts += gran;
      output.push(aggregator.get());
    }
    Ok(output)
  }

  // A watcher that receives one row of the requested channels per second, starting with the
  // tick after `ts()`.
  pub fn live_watch(&self, name: &str, channels: &[&str]) -> Result<Watcher, ServerError> {
    let kind = types::kind_by_channels(channels)?;
    let indices = channels
      .iter()
      .map(|channel| types::channel_index(kind, channel))
      .collect::<Result<Vec<_>, _>>()?;

    let (entry, mut me) = self.shared.metric_entry(kind, name)?;
    let ts = me.last_tick;
    Ok(Watcher::attach(&entry, &mut me, indices, None, 0, 0, ts))
  }

  // A watcher that emits one aggregated row per `gran`-second window, aligned to `offs`. The
  // first emission covers the window starting at `ts()`, pre-seeded from the datastore.
  pub fn watch(
    &self,
    name: &str,
    channels: &[&str],
    offs: i64,
    gran: i64,
  ) -> Result<Watcher, ServerError> {
    if offs % 60 != 0 || gran <= 0 || gran % 60 != 0 {
      return Err(ServerError::InvalidParameter);
    }
    let kind = types::kind_by_channels(channels)?;
    let mut aggregator = Aggregator::new(kind, channels)?;

    let (entry, mut me) = self.shared.metric_entry(kind, name)?;
    let ts = me.last_tick - ((me.last_tick - offs) % gran + gran) % gran;
    let mut input = self
      .shared
      .init_aggregator(&mut aggregator, kind, name, ts, ts + gran)?;
    feed_aggregator(&mut aggregator, &mut input, ts, gran);

    let inputs = aggregator.channels();
    Ok(Watcher::attach(
      &entry,
      &mut me,
      inputs,
      Some(aggregator),
      offs,
      gran,
      ts,
    ))
  }
}

impl Shared {
  fn stream_name(&self, name: &str, channel: &str) -> String {
    format!("{}{name}:{channel}", self.prefix)
  }

  fn running_last_tick(&self) -> Result<i64, ServerError> {
    let state = self.state.lock();
    match state.phase {
      Phase::Idle => Err(ServerError::NotRunning),
      Phase::Stopping => Err(ServerError::Stopping),
      Phase::Running => Ok(state.last_tick),
    }
  }

  // Look up or create an entry. The entry lock is taken while the server lock is still held so
  // a concurrent flush cannot evict the entry in between; the server lock is released when the
  // guard for the state goes out of scope right after.
  fn metric_entry(
    &self,
    kind: MetricKind,
    name: &str,
  ) -> Result<(Arc<Mutex<MetricEntry>>, EntryGuard), ServerError> {
    let mut state = self.state.lock();
    match state.phase {
      Phase::Idle => return Err(ServerError::NotRunning),
      Phase::Stopping => return Err(ServerError::Stopping),
      Phase::Running => {},
    }

    if let Some(entry) = state.entries[kind.index()].get(name) {
      let entry = Arc::clone(entry);
      let guard = entry.lock_arc();
      return Ok((entry, guard));
    }

    let init = self.channel_defaults(kind, name, state.last_tick);
    let entry = Arc::new(Mutex::new(MetricEntry::new(
      kind,
      name.to_string(),
      state.last_tick,
      &init,
    )));
    let guard = entry.lock_arc();
    state.entries[kind.index()].insert(name.to_string(), Arc::clone(&entry));
    self.stats.entries.inc();
    Ok((entry, guard))
  }

  fn channel_defaults(&self, kind: MetricKind, name: &str, ts: i64) -> Vec<f64> {
    (0 .. kind.descriptor().channels.len())
      .map(|i| self.channel_default(kind, name, i, ts))
      .collect()
  }

  // The value a channel takes before any input: its static default, or for persisted channels
  // the last value recorded at or before `ts`. Read errors degrade to the static default.
  fn channel_default(&self, kind: MetricKind, name: &str, i: usize, ts: i64) -> f64 {
    let descriptor = kind.descriptor();
    if !descriptor.persist[i] {
      return descriptor.defaults[i];
    }
    match self
      .ds
      .latest_before(&self.stream_name(name, descriptor.channels[i]), ts)
    {
      Ok(record) => record.value,
      Err(StoreError::NoData) => descriptor.defaults[i],
      Err(e) => {
        log::warn!("channel default read failed for {name}: {e}");
        descriptor.defaults[i]
      },
    }
  }

  fn restore_entry(&self, state: &mut ServerState, snapshot: EntrySnapshot) {
    let descriptor = snapshot.kind.descriptor();
    if snapshot.rings.len() != descriptor.channels.len() || snapshot.live_ptr >= LIVE_LOG_SIZE {
      log::warn!("discarding malformed live log snapshot for {}", snapshot.name);
      return;
    }
    let init = self.channel_defaults(snapshot.kind, &snapshot.name, state.last_tick);
    let mut me = MetricEntry::new(
      snapshot.kind,
      snapshot.name.clone(),
      snapshot.last_tick,
      &init,
    );
    me.live_log = snapshot.rings;
    me.live_ptr = snapshot.live_ptr;
    state.entries[snapshot.kind.index()].insert(snapshot.name, Arc::new(Mutex::new(me)));
    self.stats.entries.inc();
  }

  // One non-minute second: advance every entry. The server lock freezes the table for the
  // duration of the fan-out.
  fn tick_metrics(&self, ts: i64) {
    let mut state = self.state.lock();
    state.last_tick = ts;
    for table in &state.entries {
      for entry in table.values() {
        let mut me = entry.lock();
        me.update_idle();
        me.tick(ts);
      }
    }
  }

  // Minute boundary: flush entries with input or watchers, evict entries that have been idle
  // for longer than the live log covers. Returns whether the server is stopping.
  fn flush_metrics(&self, ts: i64) -> bool {
    let mut state = self.state.lock();
    state.last_tick = ts;
    let ServerState { entries, phase, .. } = &mut *state;
    for table in entries {
      table.retain(|_, entry| {
        let mut me = entry.lock();
        me.update_idle();
        if me.recvd_input_since_flush || !me.watchers.is_empty() {
          me.recvd_input_since_flush = false;
          let data = me.flush(ts);
          let descriptor = me.kind.descriptor();
          for (i, channel) in descriptor.channels.iter().enumerate() {
            if !descriptor.persist[i] {
              continue;
            }
            let stream = self.stream_name(&me.name, channel);
            match self.ds.insert(&stream, Record { ts, value: data[i] }) {
              Ok(()) => self.stats.flushed_records.inc(),
              Err(e) => log::warn!("flush insert into {stream} failed: {e}"),
            }
          }
          true
        } else if me.eligible_for_eviction() {
          self.stats.evicted_entries.inc();
          self.stats.entries.dec();
          false
        } else {
          true
        }
      });
    }
    *phase == Phase::Stopping
  }

  fn init_aggregator(
    &self,
    aggregator: &mut Aggregator,
    kind: MetricKind,
    name: &str,
    from: i64,
    until: i64,
  ) -> Result<AggregatorInput, ServerError> {
    let inputs = aggregator.channels();
    let mut records = Vec::with_capacity(inputs.len());
    let mut defaults = Vec::with_capacity(inputs.len());
    for &j in &inputs {
      let channel = kind.descriptor().channels[j];
      records.push(self.ds.query(&self.stream_name(name, channel), from, until)?);
      defaults.push(self.channel_default(kind, name, j, from));
    }
    aggregator.init(&defaults);
    Ok(AggregatorInput {
      records,
      cursors: vec![0; inputs.len()],
    })
  }
}

//
// AggregatorInput
//

// Per-input-channel record streams with a read cursor each, consumed minute by minute.
struct AggregatorInput {
  records: Vec<Vec<Record>>,
  cursors: Vec<usize>,
}

// Feed one `gran`-second window starting (exclusive) at `start`: a minute is fed only when every
// input channel has a record exactly at it.
fn feed_aggregator(aggregator: &mut Aggregator, input: &mut AggregatorInput, start: i64, gran: i64) {
  let mut row = vec![0.0; input.records.len()];
  let mut ts = start + 60;
  for _ in 0 .. gran / 60 {
    let mut missing = false;
    for k in 0 .. input.records.len() {
      let records = &input.records[k];
      let cursor = &mut input.cursors[k];
      while *cursor < records.len() && records[*cursor].ts < ts {
        *cursor += 1;
      }
      if *cursor < records.len() && records[*cursor].ts == ts {
        row[k] = records[*cursor].value;
      } else {
        missing = true;
      }
    }
    if !missing {
      aggregator.put(&row);
    }
    ts += 60;
  }
}

// The 1 Hz heart of the engine. Seconds that are not minute boundaries tick the live state;
// minute boundaries flush. A stop request is honored at the next minute boundary, after its
// flush.
async fn tick_loop(shared: Arc<Shared>) {
  let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
  // The first tick of a tokio interval completes immediately.
  interval.tick().await;
  loop {
    interval.tick().await;
    let ts = shared.time_provider.unix_now();
    if ts % 60 != 0 {
      shared.tick_metrics(ts);
    } else if shared.flush_metrics(ts) {
      break;
    }
  }
  log::info!("tick loop stopped");
}
