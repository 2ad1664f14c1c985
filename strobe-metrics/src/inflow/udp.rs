// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./udp_test.rs"]
mod udp_test;

use crate::server::{Server, ServerError};
use crate::stats::Scope;
use bytes::BytesMut;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// The statsd wire caps datagrams well below this; anything longer is truncated by the read.
pub const MAX_DATAGRAM_SIZE: usize = 512;

//
// UdpInjectorStats
//

#[derive(Clone)]
struct UdpInjectorStats {
  incoming_bytes: IntCounter,
  datagrams: IntCounter,
}

impl UdpInjectorStats {
  fn new(scope: &Scope) -> Self {
    Self {
      incoming_bytes: scope.counter("incoming_bytes"),
      datagrams: scope.counter("datagrams"),
    }
  }
}

//
// UdpInjector
//

// Feeds raw statsd datagrams into a server. One injector per server instance; each datagram may
// carry multiple newline separated samples.
pub struct UdpInjector {
  addr: String,
  server: Server,
  stats: UdpInjectorStats,
  state: Mutex<InjectorState>,
}

#[derive(Default)]
struct InjectorState {
  running: bool,
  local_addr: Option<SocketAddr>,
  shutdown: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<()>>,
}

impl UdpInjector {
  #[must_use]
  pub fn new(addr: &str, server: Server, scope: &Scope) -> Self {
    Self {
      addr: addr.to_string(),
      server,
      stats: UdpInjectorStats::new(scope),
      state: Mutex::new(InjectorState::default()),
    }
  }

  pub async fn start(&self) -> anyhow::Result<()> {
    {
      let state = self.state.lock();
      if state.running {
        return Err(ServerError::AlreadyRunning.into());
      }
    }

    let socket = UdpSocket::bind(self.addr.as_str()).await?;
    let local_addr = socket.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let mut state = self.state.lock();
    if state.running {
      return Err(ServerError::AlreadyRunning.into());
    }
    state.running = true;
    state.local_addr = Some(local_addr);
    state.shutdown = Some(shutdown_tx);
    state.task = Some(tokio::spawn(run(
      self.server.clone(),
      socket,
      self.stats.clone(),
      shutdown_rx,
    )));
    log::info!("udp injector running on {local_addr}");
    Ok(())
  }

  // Signal the receive loop and wait for it to finish; any injection already read from the
  // socket completes before this returns.
  pub async fn stop(&self) -> anyhow::Result<()> {
    let (shutdown, task) = {
      let mut state = self.state.lock();
      if !state.running {
        return Err(ServerError::NotRunning.into());
      }
      state.running = false;
      state.local_addr = None;
      (state.shutdown.take(), state.task.take())
    };
    if let Some(shutdown) = shutdown {
      let _ = shutdown.send(());
    }
    if let Some(task) = task {
      if let Err(e) = task.await {
        log::warn!("udp injector task terminated abnormally: {e}");
      }
    }
    Ok(())
  }

  #[must_use]
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.state.lock().local_addr
  }
}

async fn run(
  server: Server,
  socket: UdpSocket,
  stats: UdpInjectorStats,
  mut shutdown: oneshot::Receiver<()>,
) {
  let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
  loop {
    buf.reserve(MAX_DATAGRAM_SIZE);
    select! {
      result = socket.recv_buf_from(&mut buf) => match result {
        Ok((bytes, peer_addr)) => {
          log::trace!("udp recv from={peer_addr} len={bytes}");
          stats.incoming_bytes.inc_by(bytes as u64);
          stats.datagrams.inc();
          server.inject_bytes(&buf.split().freeze());
        },
        Err(e) => {
          log::warn!("udp receive error: {e}");
          break;
        },
      },
      _ = &mut shutdown => break,
    }
  }
  log::info!("terminated udp injector");
}
