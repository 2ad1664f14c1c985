// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod fs;

use std::path::PathBuf;
use thiserror::Error;

//
// Record
//

// One persisted sample of a stream. Timestamps are unix seconds and must be divisible by 60 to be
// accepted by the writer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Record {
  pub ts: i64,
  pub value: f64,
}

//
// Error
//

#[derive(Debug, Error)]
pub enum Error {
  #[error("no data")]
  NoData,

  #[error("datastore not running")]
  NotRunning,

  #[error("datastore already running")]
  AlreadyRunning,

  #[error("not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("invalid file size: {0}")]
  InvalidFileSize(String),

  #[error("invalid index data: {0}")]
  InvalidIndexData(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

//
// Datastore
//

// The read/write surface the metric engine consumes. Streams are identified by name and created
// implicitly on first use. Implementations must allow insert() to complete without blocking on
// disk I/O.
pub trait Datastore: Send + Sync {
  // Append a record to the stream's in-memory tail. The record becomes durable asynchronously.
  fn insert(&self, name: &str, record: Record) -> Result<(), Error>;

  // All records with `from < ts <= until`, oldest first. Unwritten tail records participate.
  fn query(&self, name: &str, from: i64, until: i64) -> Result<Vec<Record>, Error>;

  // The record with the greatest timestamp <= ts, after rounding ts down to a minute. NoData if
  // the stream has no record at or before the bound.
  fn latest_before(&self, name: &str, ts: i64) -> Result<Record, Error>;
}
