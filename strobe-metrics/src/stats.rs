// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

// Make an arbitrary scope/name pair into a legal prometheus metric name.
fn sanitize(name: &str) -> String {
  let mut out: String = name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
    .collect();
  if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
    out.insert(0, '_');
  }
  out
}

//
// Scope
//

// A named slice of a prometheus registry. Components hold a scope and mint their counters from
// it so that every stat they emit shares the component prefix.
#[derive(Clone)]
pub struct Scope {
  registry: Arc<Registry>,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn new(registry: Arc<Registry>, prefix: &str) -> Self {
    Self {
      registry,
      prefix: if prefix.is_empty() {
        String::new()
      } else {
        sanitize(prefix)
      },
    }
  }

  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
      prefix: self.join(name),
    }
  }

  #[must_use]
  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  fn join(&self, name: &str) -> String {
    if self.prefix.is_empty() {
      sanitize(name)
    } else {
      format!("{}_{}", self.prefix, sanitize(name))
    }
  }

  pub fn counter(&self, name: &str) -> IntCounter {
    let full = self.join(name);
    let counter = IntCounter::new(full.clone(), full.clone()).unwrap();
    if let Err(e) = self.registry.register(Box::new(counter.clone())) {
      log::debug!("stats: could not register {full}: {e}");
    }
    counter
  }

  pub fn gauge(&self, name: &str) -> IntGauge {
    let full = self.join(name);
    let gauge = IntGauge::new(full.clone(), full.clone()).unwrap();
    if let Err(e) = self.registry.register(Box::new(gauge.clone())) {
      log::debug!("stats: could not register {full}: {e}");
    }
    gauge
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new(Arc::new(Registry::new()), "")
  }
}
