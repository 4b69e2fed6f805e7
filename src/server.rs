//! Socket setup and the main event loop.
//!
//! The server owns three UDP sockets: discovery broadcasts, authentication,
//! and RPC. One cooperative loop multiplexes them with a one-second tick for
//! periodic work. Requests are handled to completion in arrival order; within
//! a tick RPC traffic is drained before auth, then discovery. All mutable
//! state lives in the loop, so nothing needs locking.

use crate::auth;
use crate::broadcast;
use crate::config::Config;
use crate::error::ServerError;
use crate::ops::{self, Engine};
use crate::printer::PrinterPool;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Discovery announcements and client announcements.
pub const PORT_BROADCAST: u16 = 32770;
/// Authentication probes and reveal replies.
pub const PORT_AUTH: u16 = 32771;
/// All file-operation traffic.
pub const PORT_RPC: u16 = 49171;

/// The UDP ports to bind. Production uses the well-known set; tests bind
/// ephemeral ports instead.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub broadcast: u16,
    pub auth: u16,
    pub rpc: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            broadcast: PORT_BROADCAST,
            auth: PORT_AUTH,
            rpc: PORT_RPC,
        }
    }
}

pub struct Server {
    config: Arc<Config>,
    broadcast_sock: UdpSocket,
    auth_sock: UdpSocket,
    rpc_sock: UdpSocket,
    engine: Engine,
    printers: PrinterPool,
}

fn bind_udp(role: &'static str, ip: Option<IpAddr>, port: u16) -> Result<UdpSocket, ServerError> {
    let map = |source: io::Error| ServerError::Bind { role, port, source };
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map)?;
    sock.set_reuse_address(true).map_err(map)?;
    sock.set_broadcast(true).map_err(map)?;
    sock.set_nonblocking(true).map_err(map)?;
    let addr = SocketAddr::new(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
    sock.bind(&addr.into()).map_err(map)?;
    UdpSocket::from_std(sock.into()).map_err(map)
}

impl Server {
    /// Binds the three well-known ports.
    pub fn bind(config: Arc<Config>, bind_ip: Option<IpAddr>) -> Result<Self, ServerError> {
        Self::bind_with(config, bind_ip, Ports::default())
    }

    /// Binds a specific port set; prepares printers and warns about
    /// misconfigured paths.
    pub fn bind_with(
        config: Arc<Config>,
        bind_ip: Option<IpAddr>,
        ports: Ports,
    ) -> Result<Self, ServerError> {
        for share in &config.shares {
            if !share.path.exists() {
                warn!(share = %share.name, path = %share.path.display(), "share path missing");
            }
        }
        for printer in &config.printers {
            if !printer.path.exists() {
                warn!(printer = %printer.name, path = %printer.path.display(), "printer path missing");
            }
        }
        PrinterPool::setup(&config);

        let broadcast_sock = bind_udp("broadcast", bind_ip, ports.broadcast)?;
        let auth_sock = bind_udp("auth", bind_ip, ports.auth)?;
        let rpc_sock = bind_udp("rpc", bind_ip, ports.rpc)?;
        info!(
            broadcast = ports.broadcast,
            auth = ports.auth,
            rpc = ports.rpc,
            "sockets bound"
        );

        Ok(Self {
            engine: Engine::new(Arc::clone(&config)),
            printers: PrinterPool::new(&config),
            config,
            broadcast_sock,
            auth_sock,
            rpc_sock,
        })
    }

    pub fn rpc_addr(&self) -> io::Result<SocketAddr> {
        self.rpc_sock.local_addr()
    }

    pub fn auth_addr(&self) -> io::Result<SocketAddr> {
        self.auth_sock.local_addr()
    }

    /// Runs the event loop. Protocol errors never end the loop; only socket
    /// receive errors are surfaced as warnings and retried.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            broadcast_sock,
            auth_sock,
            rpc_sock,
            mut engine,
            mut printers,
        } = self;

        info!(
            shares = config.shares.len(),
            printers = config.printers.len(),
            "server running"
        );

        // Announce immediately so clients do not wait a full interval.
        if let Err(e) = broadcast::broadcast_shares(&config, &broadcast_sock).await {
            warn!(error = %e, "initial share broadcast failed");
        }
        if let Err(e) = broadcast::broadcast_printers(&config, &broadcast_sock).await {
            warn!(error = %e, "initial printer broadcast failed");
        }
        let mut last_broadcast = Instant::now();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rpc_buf = vec![0u8; 4096];
        let mut auth_buf = vec![0u8; 1024];
        let mut discovery_buf = vec![0u8; 1024];

        loop {
            tokio::select! {
                biased;

                result = rpc_sock.recv_from(&mut rpc_buf) => match result {
                    Ok((n, peer)) => {
                        trace!(len = n, %peer, "rpc datagram");
                        if let Err(e) = engine.handle_rpc(&rpc_sock, &rpc_buf[..n], peer).await {
                            warn!(error = %e, %peer, "rpc reply failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "rpc receive failed"),
                },

                result = auth_sock.recv_from(&mut auth_buf), if config.server.access_plus => match result {
                    Ok((n, peer)) => {
                        trace!(len = n, %peer, "auth datagram");
                        if let Err(e) = auth::handle_frame(
                            &config,
                            &mut engine.auth,
                            &auth_sock,
                            &auth_buf[..n],
                            peer,
                        )
                        .await
                        {
                            warn!(error = %e, %peer, "auth reply failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "auth receive failed"),
                },

                result = broadcast_sock.recv_from(&mut discovery_buf) => match result {
                    // Client announcements; nothing to do beyond noting them.
                    Ok((n, peer)) => trace!(len = n, %peer, "discovery datagram"),
                    Err(e) => warn!(error = %e, "discovery receive failed"),
                },

                _ = tick.tick() => {
                    let now = Instant::now();
                    let interval = config.server.broadcast_interval;
                    if interval > 0 && last_broadcast.elapsed() >= Duration::from_secs(interval) {
                        if let Err(e) = broadcast::broadcast_shares(&config, &broadcast_sock).await {
                            warn!(error = %e, "share broadcast failed");
                        }
                        if let Err(e) = broadcast::broadcast_printers(&config, &broadcast_sock).await {
                            warn!(error = %e, "printer broadcast failed");
                        }
                        let dead = engine.handles.take_dead_handles();
                        if let Err(e) = broadcast::broadcast_dead_handles(&dead, &rpc_sock).await {
                            warn!(error = %e, "dead-handle broadcast failed");
                        }
                        last_broadcast = now;
                    }

                    for stale in engine.writes.reap_idle(now) {
                        warn!(rid = %stale.rid, peer = %stale.peer, "write transfer timed out");
                        if let Err(e) =
                            ops::send_err(&rpc_sock, stale.rid, ops::EIO, stale.peer).await
                        {
                            debug!(error = %e, "timeout notification failed");
                        }
                    }

                    printers.poll();
                }
            }
        }
    }
}
