//! Periodic discovery announcements.
//!
//! Unprotected shares and printers are announced to the limited broadcast
//! address so clients can populate their discovery lists; protected shares
//! are only ever revealed over the auth port. Recently closed handle ids go
//! out on the RPC port so clients drop stale references.

use crate::config::Config;
use crate::server::{PORT_BROADCAST, PORT_RPC};
use std::io;
use std::net::Ipv4Addr;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Discovery word for a share announcement (type 1, minor 2).
pub const SHARE_ADD: u32 = 0x0001_0002;
/// Discovery word for a printer announcement (type 2, minor 2).
pub const PRINTER_ADD: u32 = 0x0002_0002;

/// Operation byte of the dead-handle broadcast.
const DEAD_HANDLES_OP: u8 = 19;

/// Frames cap at this size, matching the protocol's buffer expectations.
const MAX_FRAME: usize = 512;

/// Builds one announcement: header words, then the NUL-terminated name and
/// description. The length word counts both terminators.
pub fn announce_frame(word0: u32, name: &str, desc: &str) -> Option<Vec<u8>> {
    let name_len = name.len() + 1;
    let desc_len = desc.len() + 1;
    if 12 + name_len + desc_len > MAX_FRAME {
        return None;
    }
    let mut out = Vec::with_capacity(12 + name_len + desc_len);
    out.extend_from_slice(&word0.to_le_bytes());
    out.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    out.extend_from_slice(&(((desc_len as u32) << 16) | name_len as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(desc.as_bytes());
    out.push(0);
    Some(out)
}

/// Builds the dead-handle frame: op byte, padding, count, then the ids.
pub fn dead_handles_frame(ids: &[u32]) -> Vec<u8> {
    let max_ids = (MAX_FRAME - 8) / 4;
    let ids = &ids[..ids.len().min(max_ids)];
    let mut out = Vec::with_capacity(8 + ids.len() * 4);
    out.push(DEAD_HANDLES_OP);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

/// Announces every unprotected share.
pub async fn broadcast_shares(config: &Config, sock: &UdpSocket) -> io::Result<()> {
    for share in &config.shares {
        if share.is_protected() {
            continue;
        }
        let Some(frame) = announce_frame(SHARE_ADD, &share.name, "") else {
            warn!(share = %share.name, "share name too long to announce");
            continue;
        };
        sock.send_to(&frame, (Ipv4Addr::BROADCAST, PORT_BROADCAST))
            .await?;
        debug!(share = %share.name, "announced share");
    }
    Ok(())
}

/// Announces every printer.
pub async fn broadcast_printers(config: &Config, sock: &UdpSocket) -> io::Result<()> {
    for printer in &config.printers {
        let Some(frame) = announce_frame(PRINTER_ADD, &printer.name, &printer.description)
        else {
            warn!(printer = %printer.name, "printer name too long to announce");
            continue;
        };
        sock.send_to(&frame, (Ipv4Addr::BROADCAST, PORT_BROADCAST))
            .await?;
        debug!(printer = %printer.name, "announced printer");
    }
    Ok(())
}

/// Broadcasts recently closed handle ids on the RPC port.
pub async fn broadcast_dead_handles(ids: &[u32], sock: &UdpSocket) -> io::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let frame = dead_handles_frame(ids);
    sock.send_to(&frame, (Ipv4Addr::BROADCAST, PORT_RPC)).await?;
    debug!(count = ids.len(), "broadcast dead handles");
    Ok(())
}
