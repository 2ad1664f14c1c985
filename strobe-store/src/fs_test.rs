// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;

fn record(ts: i64, value: f64) -> Record {
  Record { ts, value }
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
  for _ in 0 .. 1000 {
    if f() {
      return;
    }
    std::thread::sleep(Duration::from_millis(10));
  }
  panic!("timed out waiting for {what}");
}

fn wait_for_dat_len(dir: &Path, name: &str, len: u64) {
  let (dat, _) = stream_paths(dir, name);
  wait_until("dat file length", || {
    fs::metadata(&dat).map(|m| m.len()).ok() == Some(len)
  });
}

#[test]
fn write_and_query_round_trip() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();

  ds.insert("cpu", record(60, 1.0)).unwrap();
  ds.insert("cpu", record(120, 2.0)).unwrap();
  ds.insert("cpu", record(180, 3.0)).unwrap();
  wait_for_dat_len(tmp.path(), "cpu", 24);

  assert_eq!(
    ds.query("cpu", 0, 180).unwrap(),
    vec![record(60, 1.0), record(120, 2.0), record(180, 3.0)]
  );

  // Post-write size invariants.
  let (dat, idx) = stream_paths(tmp.path(), "cpu");
  assert_eq!(fs::metadata(&dat).unwrap().len() % 8, 0);
  assert_eq!(fs::metadata(&idx).unwrap().len() % 16, 0);
  assert_eq!(fs::metadata(&idx).unwrap().len(), 16);

  ds.close().unwrap();
}

#[test]
fn query_window_is_half_open() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();

  for ts in [60, 120, 180, 240, 300] {
    ds.insert("reqs", record(ts, ts as f64)).unwrap();
  }
  wait_for_dat_len(tmp.path(), "reqs", 40);

  // (from, until]: from excluded, until included.
  assert_eq!(
    ds.query("reqs", 60, 180).unwrap(),
    vec![record(120, 120.0), record(180, 180.0)]
  );
  assert_eq!(ds.query("reqs", 300, 400).unwrap(), vec![]);
  ds.close().unwrap();
}

#[test]
fn tail_records_participate_in_reads() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();

  // Whether or not the writer has drained the tail yet, the record is visible.
  ds.insert("mem", record(60, 7.0)).unwrap();
  assert_eq!(ds.query("mem", 0, 60).unwrap(), vec![record(60, 7.0)]);
  assert_eq!(ds.latest_before("mem", 100).unwrap(), record(60, 7.0));
  ds.close().unwrap();
}

#[test]
fn latest_before_respects_gaps_and_bounds() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();

  for (ts, value) in [(60, 1.0), (120, 2.0), (300, 5.0), (360, 6.0)] {
    ds.insert("gappy", record(ts, value)).unwrap();
  }
  wait_for_dat_len(tmp.path(), "gappy", 32);

  // Exactly at a record, inside a segment.
  assert_eq!(ds.latest_before("gappy", 125).unwrap(), record(120, 2.0));
  // Inside the gap: the last record of the earlier segment wins.
  assert_eq!(ds.latest_before("gappy", 200).unwrap(), record(120, 2.0));
  // Mid second segment.
  assert_eq!(ds.latest_before("gappy", 310).unwrap(), record(300, 5.0));
  // Past the end.
  assert_eq!(ds.latest_before("gappy", 100_000).unwrap(), record(360, 6.0));
  // Before the first record.
  assert_matches!(ds.latest_before("gappy", 59), Err(Error::NoData));
  ds.close().unwrap();
}

#[test]
fn latest_before_on_unknown_stream_is_no_data() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();
  assert_matches!(ds.latest_before("nope", 1000), Err(Error::NoData));
  assert_eq!(ds.query("nope", 0, 1000).unwrap(), vec![]);
  ds.close().unwrap();
}

#[test]
fn writer_rejects_unaligned_and_stale_timestamps() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();

  ds.insert("odd", record(61, 1.0)).unwrap();
  ds.insert("odd", record(120, 2.0)).unwrap();
  ds.insert("odd", record(60, 3.0)).unwrap();
  wait_for_dat_len(tmp.path(), "odd", 8);

  assert_eq!(ds.query("odd", 0, 600).unwrap(), vec![record(120, 2.0)]);
  ds.close().unwrap();
}

#[test]
fn tails_survive_clean_close_and_reopen() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();
  ds.insert("uptime", record(60, 1.0)).unwrap();
  ds.close().unwrap();
  assert!(tmp.path().join(TAIL_FILE).exists());

  ds.open().unwrap();
  assert_eq!(ds.query("uptime", 0, 60).unwrap(), vec![record(60, 1.0)]);
  ds.close().unwrap();
}

#[test]
fn committed_records_survive_a_crash_without_checkpoint() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();
  ds.insert("disk", record(60, 1.0)).unwrap();
  ds.insert("disk", record(120, 2.0)).unwrap();
  wait_for_dat_len(tmp.path(), "disk", 16);
  ds.close().unwrap();

  // Simulate a crash that never checkpointed: the on-disk records are still there.
  fs::remove_file(tmp.path().join(TAIL_FILE)).unwrap();
  ds.open().unwrap();
  assert_eq!(
    ds.query("disk", 0, 120).unwrap(),
    vec![record(60, 1.0), record(120, 2.0)]
  );
  ds.close().unwrap();
}

#[test]
fn corrupt_checkpoint_is_discarded() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join(TAIL_FILE), b"not a checkpoint").unwrap();

  let ds = FsDatastore::new(tmp.path());
  ds.open().unwrap();
  assert_eq!(ds.query("anything", 0, 1000).unwrap(), vec![]);
  assert!(!tmp.path().join(TAIL_FILE).exists());
  ds.close().unwrap();
}

#[test]
fn lifecycle_errors() {
  let tmp = TempDir::new().unwrap();
  let ds = FsDatastore::new(tmp.path());
  assert_matches!(ds.insert("x", record(60, 0.0)), Err(Error::NotRunning));
  assert_matches!(ds.close(), Err(Error::NotRunning));

  ds.open().unwrap();
  assert_matches!(ds.open(), Err(Error::AlreadyRunning));
  ds.close().unwrap();

  // Reopen after close works.
  ds.open().unwrap();
  ds.close().unwrap();
}

#[test]
fn open_requires_a_directory() {
  let tmp = TempDir::new().unwrap();
  let file = tmp.path().join("plain");
  fs::write(&file, b"").unwrap();
  let ds = FsDatastore::new(&file);
  assert_matches!(ds.open(), Err(Error::NotADirectory(_)));
}

#[test]
fn partitions_are_in_range() {
  for name in ["a", "some:stream", "srv0/foo:count", ""] {
    assert!(FsDatastore::partition(name) < PARTITIONS);
  }
}
