// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./statsd_test.rs"]
mod statsd_test;

use super::metric::{Metric, MetricKind, ParseError};
use bytes::{Bytes, BytesMut};
use memchr::{memchr, memchr3};

// Parse a single statsd protocol unit: `NAME ':' VALUE '|' TYPE ['|@' SAMPLE_RATE]`. The name
// must be non-empty and free of ':', '/', and NUL; the value must be a finite float; the sample
// rate, when present, must be a finite float greater than zero.
pub fn parse(input: &Bytes) -> Result<Metric, ParseError> {
  if input.is_empty() {
    return Err(ParseError::NameMissing);
  }

  // The name runs to the first ':'. Seeing '/' or NUL before it makes the name invalid.
  let name_end = match memchr3(b':', b'/', b'\0', input) {
    Some(i) if input[i] == b':' => i,
    Some(_) => return Err(ParseError::NameInvalid),
    None => return Err(ParseError::ValueMissing),
  };
  if name_end == 0 {
    return Err(ParseError::NameMissing);
  }
  if name_end == input.len() - 1 {
    return Err(ParseError::ValueMissing);
  }
  let name = input.slice(0 .. name_end);

  let rest = &input[name_end + 1 ..];
  let value_end = match memchr(b'|', rest) {
    Some(0) => return Err(ParseError::ValueMissing),
    None => return Err(ParseError::TypeMissing),
    Some(i) if i == rest.len() - 1 => return Err(ParseError::TypeMissing),
    Some(i) => i,
  };
  let value = std::str::from_utf8(&rest[.. value_end])
    .map_err(|_| ParseError::ValueInvalid)?
    .parse::<f64>()
    .map_err(|_| ParseError::ValueInvalid)?;
  if !value.is_finite() {
    return Err(ParseError::ValueInvalid);
  }

  let rest = &rest[value_end + 1 ..];
  let type_end = memchr(b'|', rest).unwrap_or(rest.len());
  let kind = MetricKind::from_statsd(&rest[.. type_end])?;

  let mut sample_rate = 1.0;
  if type_end != rest.len() {
    if type_end == rest.len() - 1 {
      return Err(ParseError::SamplingMissing);
    }
    if rest[type_end + 1] != b'@' {
      return Err(ParseError::SamplingInvalid);
    }
    let rate = std::str::from_utf8(&rest[type_end + 2 ..])
      .map_err(|_| ParseError::SamplingInvalid)?
      .parse::<f64>()
      .map_err(|_| ParseError::SamplingInvalid)?;
    if !rate.is_finite() || rate <= 0.0 {
      return Err(ParseError::SamplingInvalid);
    }
    sample_rate = rate;
  }

  Ok(Metric {
    name,
    kind,
    value,
    sample_rate,
  })
}

#[must_use]
pub fn to_line(metric: &Metric) -> Bytes {
  let mut line = BytesMut::new();
  line.extend_from_slice(&metric.name);
  line.extend_from_slice(b":");
  line.extend_from_slice(metric.value.to_string().as_bytes());
  line.extend_from_slice(b"|");
  line.extend_from_slice(metric.kind.to_statsd());
  if metric.sample_rate != 1.0 {
    line.extend_from_slice(b"|@");
    line.extend_from_slice(metric.sample_rate.to_string().as_bytes());
  }
  line.freeze()
}
