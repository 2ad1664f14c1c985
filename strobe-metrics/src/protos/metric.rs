// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use bytes::Bytes;
use thiserror::Error;

pub const NUM_KINDS: usize = 4;

//
// MetricKind
//

// The closed set of metric kinds the engine aggregates. The order is load bearing: it doubles as
// the entry table index and as the search order when resolving a channel set back to a kind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
  Counter,
  Gauge,
  Avg,
  Timer,
}

impl MetricKind {
  pub const ALL: [Self; NUM_KINDS] = [Self::Counter, Self::Gauge, Self::Avg, Self::Timer];

  pub const fn from_statsd(t: &[u8]) -> Result<Self, ParseError> {
    match t {
      b"c" => Ok(Self::Counter),
      b"g" => Ok(Self::Gauge),
      b"a" => Ok(Self::Avg),
      b"ms" => Ok(Self::Timer),
      _ => Err(ParseError::TypeInvalid),
    }
  }

  #[must_use]
  pub const fn to_statsd(self) -> &'static [u8] {
    match self {
      Self::Counter => b"c",
      Self::Gauge => b"g",
      Self::Avg => b"a",
      Self::Timer => b"ms",
    }
  }

  #[must_use]
  pub const fn index(self) -> usize {
    self as usize
  }
}

//
// ParseError
//

// Wire parse failures. Missing fields and malformed fields are distinct so that callers can tell
// a truncated line from a corrupt one.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ParseError {
  #[error("name missing")]
  NameMissing,
  #[error("type missing")]
  TypeMissing,
  #[error("value missing")]
  ValueMissing,
  #[error("sample rate missing")]
  SamplingMissing,
  #[error("invalid characters in name")]
  NameInvalid,
  #[error("invalid type")]
  TypeInvalid,
  #[error("invalid value")]
  ValueInvalid,
  #[error("invalid sample rate")]
  SamplingInvalid,
}

//
// Metric
//

// One parsed wire sample. Immutable once parsed.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
  pub name: Bytes,
  pub kind: MetricKind,
  pub value: f64,
  pub sample_rate: f64,
}
