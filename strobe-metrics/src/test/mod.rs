// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use parking_lot::Mutex;
use std::collections::HashMap;
use strobe_store::{Datastore, Error, Record};

//
// MemoryDatastore
//

// In-memory datastore for engine tests: inserts are immediately visible, queries follow the
// (from, until] window contract, latest_before rounds down to a minute.
#[derive(Default)]
pub struct MemoryDatastore {
  streams: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryDatastore {
  pub fn seed(&self, name: &str, records: &[(i64, f64)]) {
    self.streams.lock().insert(
      name.to_string(),
      records
        .iter()
        .map(|(ts, value)| Record {
          ts: *ts,
          value: *value,
        })
        .collect(),
    );
  }

  pub fn records(&self, name: &str) -> Vec<Record> {
    self.streams.lock().get(name).cloned().unwrap_or_default()
  }
}

impl Datastore for MemoryDatastore {
  fn insert(&self, name: &str, record: Record) -> Result<(), Error> {
    self
      .streams
      .lock()
      .entry(name.to_string())
      .or_default()
      .push(record);
    Ok(())
  }

  fn query(&self, name: &str, from: i64, until: i64) -> Result<Vec<Record>, Error> {
    Ok(
      self
        .streams
        .lock()
        .get(name)
        .map(|records| {
          records
            .iter()
            .filter(|r| r.ts > from && r.ts <= until)
            .copied()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn latest_before(&self, name: &str, ts: i64) -> Result<Record, Error> {
    let ts = ts - ts.rem_euclid(60);
    self
      .streams
      .lock()
      .get(name)
      .and_then(|records| {
        records
          .iter()
          .filter(|r| r.ts <= ts)
          .max_by_key(|r| r.ts)
          .copied()
      })
      .ok_or(Error::NoData)
  }
}
