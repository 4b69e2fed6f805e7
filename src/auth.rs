//! Pass-PIN authentication for protected shares.
//!
//! Protected shares are never announced openly. A client proves knowledge of
//! the share password by sending its derived PIN on the auth port; the
//! server then reveals the share to that client and records a time-bounded
//! `(client-ip, share)` entry consulted on every subsequent path operation.

use crate::config::Config;
use crate::wire::read_u32;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

/// At most this many authenticated (client, share) pairs are tracked.
pub const MAX_AUTH_ENTRIES: usize = 64;

/// Sliding expiry window for an authenticated pair.
pub const AUTH_TTL: Duration = Duration::from_secs(600);

// Discovery message words (major << 16 | minor).
const MSG_STARTUP: u32 = 0x0001_0001;
const MSG_PERIODIC: u32 = 0x0001_0004;
const SHARE_TYPE_DISC: u32 = 0x0001_0001;

/// A reveal reply never exceeds this many bytes.
const MAX_REVEAL: usize = 256;

/// Derives the 32-bit PIN from a share password: up to six characters,
/// each folded case-insensitively into base 37.
pub fn password_to_pin(password: &str) -> u32 {
    let mut pin: u32 = 0;
    for c in password.chars().take(6) {
        let c = c.to_ascii_uppercase();
        let enc = match c {
            '0'..='9' => c as u32 - '0' as u32 + 1,
            'A'..='Z' => c as u32 - 'A' as u32 + 11,
            _ => 0,
        };
        pin = pin.wrapping_mul(0x25).wrapping_add(enc);
    }
    pin
}

#[derive(Debug)]
struct AuthEntry {
    client: IpAddr,
    share: String,
    expiry: Instant,
}

/// The time-bounded authentication cache.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: Vec<AuthEntry>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `client` as authenticated for `share`, refreshing the expiry
    /// if the pair is already present. Silently drops the entry when the
    /// cache is full.
    pub fn add(&mut self, client: IpAddr, share: &str) {
        self.add_at(Instant::now(), client, share);
    }

    fn add_at(&mut self, now: Instant, client: IpAddr, share: &str) {
        if let Some(entry) = self.find(client, share) {
            entry.expiry = now + AUTH_TTL;
            return;
        }
        if self.entries.len() < MAX_AUTH_ENTRIES {
            self.entries.push(AuthEntry {
                client,
                share: share.to_string(),
                expiry: now + AUTH_TTL,
            });
            info!(%client, share, "client authenticated for share");
        }
    }

    /// Checks whether `client` holds a live entry for `share`; a hit
    /// refreshes the sliding expiry.
    pub fn check(&mut self, client: IpAddr, share: &str) -> bool {
        self.check_at(Instant::now(), client, share)
    }

    fn check_at(&mut self, now: Instant, client: IpAddr, share: &str) -> bool {
        match self.find(client, share) {
            Some(entry) if entry.expiry > now => {
                entry.expiry = now + AUTH_TTL;
                true
            }
            _ => false,
        }
    }

    fn find(&mut self, client: IpAddr, share: &str) -> Option<&mut AuthEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.client == client && e.share.eq_ignore_ascii_case(share))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handles one inbound frame on the auth port.
///
/// An authentication probe carries `msg_type`, `share_type` and the PIN.
/// Every protected share whose password derives to that PIN is revealed to
/// the sender with a directed reply. Other discovery messages with the same
/// major are accepted silently.
pub async fn handle_frame(
    config: &Config,
    cache: &mut AuthCache,
    sock: &UdpSocket,
    buf: &[u8],
    peer: SocketAddr,
) -> io::Result<()> {
    if buf.len() < 8 {
        return Ok(());
    }
    let msg_type = read_u32(buf, 0);
    let share_type = read_u32(buf, 4);
    trace!(msg_type, share_type, %peer, "auth frame");

    if msg_type == MSG_STARTUP && share_type == SHARE_TYPE_DISC && buf.len() >= 12 {
        let key = read_u32(buf, 8);
        for share in config.shares.iter().filter(|s| s.is_protected()) {
            let Some(password) = share.password.as_deref() else {
                continue;
            };
            if password_to_pin(password) != key {
                continue;
            }
            cache.add(peer.ip(), &share.name);
            let reply = reveal_reply(&share.name, share.attribute_bits(), key);
            if reply.len() > MAX_REVEAL {
                debug!(share = %share.name, "share name too long to reveal");
                continue;
            }
            sock.send_to(&reply, peer).await?;
            debug!(share = %share.name, %peer, "revealed protected share");
        }
        return Ok(());
    }

    if msg_type >> 16 == 0x0001 {
        trace!(minor = msg_type & 0xFFFF, "discovery message ignored");
        return Ok(());
    }

    debug!(msg_type, %peer, "unknown auth-port message");
    Ok(())
}

/// Builds the directed reveal reply for one protected share.
fn reveal_reply(name: &str, attrs: u32, key: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + name.len() + 2);
    out.extend_from_slice(&MSG_PERIODIC.to_le_bytes());
    out.extend_from_slice(&SHARE_TYPE_DISC.to_le_bytes());
    out.extend_from_slice(&(0x0001_0000 | name.len() as u32).to_le_bytes());
    out.extend_from_slice(&key.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(attrs as u8);
    out.push(0);
    out
}
