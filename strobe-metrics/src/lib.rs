// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod inflow;
pub mod protos;
pub mod server;
pub mod stats;
#[cfg(test)]
mod test;
pub mod time;
pub mod types;
