//! The protocol engine.
//!
//! Every RPC datagram is dispatched on its command byte. `A`, `B`, `a` and
//! `F` requests share one operation sub-code space but differ in framing;
//! `d` packets feed the pull-style write machine. Each request is handled
//! to completion: the handler either emits the documented success frames or
//! exactly one `E` frame, and protocol failures never unwind past the
//! dispatcher.

use crate::auth::AuthCache;
use crate::config::{Config, ShareConfig};
use crate::handle::{HandleKind, HandleTable};
use crate::path;
use crate::riscos::{self, FILETYPE_DATA, FILETYPE_DIR, OBJECT_DIR, OBJECT_FILE};
use crate::transfer::{WriteTable, WRITE_CHUNK};
use crate::wire::{self, read_u32, write_u32, Rid};
use std::borrow::Cow;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Operation sub-codes shared by the `A`, `B`, `a` and `F` framings.
mod op {
    pub const FIND: u32 = 0x00;
    pub const OPEN_IN: u32 = 0x01;
    pub const OPEN_UP: u32 = 0x02;
    pub const OPEN_DIR: u32 = 0x03;
    pub const CREATE: u32 = 0x04;
    pub const CREATE_DIR: u32 = 0x05;
    pub const DELETE: u32 = 0x06;
    pub const ACCESS: u32 = 0x07;
    pub const FREE_SPACE: u32 = 0x08;
    pub const RENAME: u32 = 0x09;
    pub const CLOSE: u32 = 0x0A;
    pub const READ: u32 = 0x0B;
    pub const WRITE: u32 = 0x0C;
    pub const READ_DIR: u32 = 0x0D;
    pub const ENSURE: u32 = 0x0E;
    pub const SET_LENGTH: u32 = 0x0F;
    pub const SET_INFO: u32 = 0x10;
    pub const GET_SEQ_PTR: u32 = 0x11;
    pub const SET_SEQ_PTR: u32 = 0x12;
    pub const DEAD_HANDLES: u32 = 0x13;
    pub const ZERO: u32 = 0x14;
    pub const VERSION: u32 = 0x15;
    pub const FREE_SPACE64: u32 = 0x16;
}

// Error codes carried in `E` frames.
const ENOENT: u8 = libc::ENOENT as u8;
const EACCES: u8 = libc::EACCES as u8;
const ENOTDIR: u8 = libc::ENOTDIR as u8;
const EBADF: u8 = libc::EBADF as u8;
const EMFILE: u8 = libc::EMFILE as u8;
const ENOMEM: u8 = libc::ENOMEM as u8;
const EINVAL: u8 = libc::EINVAL as u8;
const ENOSYS: u8 = libc::ENOSYS as u8;
pub(crate) const EIO: u8 = libc::EIO as u8;

/// A single read reply carries at most this much file data.
const MAX_READ: usize = 16_384;
/// The raw-data (`D`) framing is capped much lower.
const MAX_RAW_READ: usize = 2_048;
/// Catalogue entries stop at this many bytes per reply.
const MAX_CATALOGUE: usize = 1_800;

const PROTOCOL_VERSION: u32 = 2;

fn io_code(e: &io::Error) -> u8 {
    e.raw_os_error().unwrap_or(libc::EIO as i32) as u8
}

/// The engine owns every piece of per-connection state for the lifetime of
/// the main loop: the handle table, the auth cache and the write table.
pub struct Engine {
    config: Arc<Config>,
    pub handles: HandleTable,
    pub auth: AuthCache,
    pub writes: WriteTable,
}

pub(crate) async fn send_err(
    sock: &UdpSocket,
    rid: Rid,
    code: u8,
    peer: SocketAddr,
) -> io::Result<()> {
    trace!(%rid, code, "E reply");
    sock.send_to(&wire::error_frame(rid, code), peer).await?;
    Ok(())
}

async fn send_reply(
    sock: &UdpSocket,
    rid: Rid,
    payload: &[u8],
    peer: SocketAddr,
) -> io::Result<()> {
    trace!(%rid, len = payload.len(), "R reply");
    sock.send_to(&wire::reply_frame(rid, payload), peer).await?;
    Ok(())
}

/// NUL- or datagram-terminated path field starting at `off`.
fn frame_path(buf: &[u8], off: usize) -> Cow<'_, str> {
    let bytes = &buf[off.min(buf.len())..];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

/// The 20-byte object record: load, exec, length, attributes, object type.
fn filedesc(meta: &Metadata, filetype: u32) -> [u8; 20] {
    let cs = riscos::time_to_centiseconds(riscos::mtime_secs(meta));
    let mut out = [0u8; 20];
    write_u32(&mut out, 0, riscos::make_load_addr(filetype, cs));
    write_u32(&mut out, 4, riscos::make_exec_addr(cs));
    let (length, object) = if meta.is_dir() {
        (0x800, OBJECT_DIR)
    } else {
        (meta.len().min(u32::MAX as u64) as u32, OBJECT_FILE)
    };
    write_u32(&mut out, 8, length);
    write_u32(&mut out, 12, riscos::attrs_from_metadata(meta));
    write_u32(&mut out, 16, object);
    out
}

fn filedesc_with_handle(meta: &Metadata, filetype: u32, handle_id: u32) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..20].copy_from_slice(&filedesc(meta, filetype));
    write_u32(&mut out, 20, handle_id);
    out
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_window(file: &mut File, offset: u32, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(u64::from(offset)))?;
    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < data.len() {
        match file.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    data.truncate(filled);
    Ok(data)
}

fn write_window(file: &mut File, offset: u32, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(u64::from(offset)))?;
    file.write_all(data)
}

/// OPENDIR trailer words: fixed load/exec, the entry bytes rounded up to a
/// 2 KiB granule, an access word, the share value derived from the handle,
/// the handle itself, the true length, and the end marker.
fn opendir_trailer(handle_id: u32, entries_len: usize) -> [u32; 8] {
    [
        0xFFFF_CD00,
        0,
        (entries_len as u32 + 2047) & !2047,
        0x13,
        (handle_id & 0xFFFF_FF00) ^ 0xFFFF_FF02,
        handle_id,
        entries_len as u32,
        0xFFFF_FFFF,
    ]
}

fn readdir_trailer(entries_len: usize) -> [u32; 2] {
    [entries_len as u32, 0xFFFF_FFFF]
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            handles: HandleTable::new(),
            auth: AuthCache::new(),
            writes: WriteTable::new(),
        }
    }

    /// Dispatches one RPC datagram.
    pub async fn handle_rpc(
        &mut self,
        sock: &UdpSocket,
        buf: &[u8],
        peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < wire::HEADER_LEN {
            trace!(len = buf.len(), %peer, "runt datagram dropped");
            return Ok(());
        }
        let cmd = buf[0];
        let rid = Rid::from_frame(buf);
        trace!(cmd = %(cmd as char), %rid, len = buf.len(), %peer, "rpc");
        match cmd {
            b'A' => self.path_command(sock, rid, buf, peer).await,
            b'B' => self.path_command_ext(sock, rid, buf, peer).await,
            b'a' => self.handle_command(sock, rid, buf, peer).await,
            b'F' => self.query_command(sock, rid, buf, peer).await,
            b'd' => self.data_packet(sock, rid, buf, peer).await,
            _ => {
                debug!(cmd, %peer, "unknown command byte");
                send_err(sock, rid, ENOSYS, peer).await
            }
        }
    }

    /// True when the path names a protected share the peer has not unlocked.
    /// Unknown shares fall through so resolution reports `ENOENT` instead.
    fn access_denied(&mut self, platform_path: &str, peer: SocketAddr) -> bool {
        if platform_path.is_empty() {
            return false;
        }
        let share_name = platform_path.split('.').next().unwrap_or("");
        let config = Arc::clone(&self.config);
        match config.find_share(share_name) {
            Some(share) if share.is_protected() => !self.auth.check(peer.ip(), &share.name),
            _ => false,
        }
    }

    /// Filetype for a host name, honoring the share's `default_type` for
    /// extensionless files.
    fn filetype_for(&self, host: &Path, share: Option<&ShareConfig>) -> u32 {
        let name = host.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let filetype = riscos::filetype_from_ext(name, &self.config.mime_types);
        if filetype == FILETYPE_DATA && !name.contains('.') && !name.contains(',') {
            if let Some(default) = share.and_then(|s| s.default_filetype()) {
                return default;
            }
        }
        filetype
    }

    /// Catalogue entries for one directory, starting at `start`: each is a
    /// FileDesc, the NUL-terminated display name, and padding to 4 bytes.
    /// Dotfiles and unstattable entries are skipped; iteration stops at the
    /// first entry that would not fit.
    fn build_dir_entries(&self, dir: &Path, start: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let Ok(reader) = fs::read_dir(dir) else {
            return out;
        };
        let mut index = 0usize;
        for entry in reader.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if index < start {
                index += 1;
                continue;
            }
            let Ok(meta) = fs::metadata(entry.path()) else {
                continue;
            };
            let filetype = if meta.is_dir() {
                FILETYPE_DIR
            } else {
                riscos::filetype_from_ext(name, &self.config.mime_types)
            };
            let display = riscos::strip_type_suffix(name);
            let entry_size = (20 + display.len() + 1 + 3) & !3;
            if out.len() + entry_size > MAX_CATALOGUE {
                break;
            }
            out.extend_from_slice(&filedesc(&meta, filetype));
            out.extend_from_slice(display.as_bytes());
            out.resize(out.len() + entry_size - 20 - display.len(), 0);
            index += 1;
        }
        out
    }

    async fn send_catalogue(
        &self,
        sock: &UdpSocket,
        rid: Rid,
        dir: &Path,
        handle_id: u32,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let entries = self.build_dir_entries(dir, 0);
        let frame = wire::catalogue_reply(rid, &entries, &opendir_trailer(handle_id, entries.len()));
        trace!(%rid, entries = entries.len(), handle_id, "catalogue reply");
        sock.send_to(&frame, peer).await?;
        Ok(())
    }

    async fn send_readdir(
        &self,
        sock: &UdpSocket,
        rid: Rid,
        dir: &Path,
        start: usize,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let entries = self.build_dir_entries(dir, start);
        let frame = wire::catalogue_reply(rid, &entries, &readdir_trailer(entries.len()));
        sock.send_to(&frame, peer).await?;
        Ok(())
    }

    /// `A` framing: `cmd + rid + code(4) + handle(4) + path`, except that
    /// ACCESS and RENAME carry an extra word before the handle.
    async fn path_command(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        buf: &[u8],
        peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < 12 {
            return send_err(sock, rid, EINVAL, peer).await;
        }
        let code = read_u32(buf, 4);
        let handle_id = read_u32(buf, 8);
        let path_off = match code {
            op::ACCESS | op::RENAME => 16,
            _ => 12,
        };
        let platform_path = frame_path(buf, path_off).into_owned();
        debug!(code, handle_id, path = %platform_path, "A command");

        if self.access_denied(&platform_path, peer) {
            return send_err(sock, rid, EACCES, peer).await;
        }
        let config = Arc::clone(&self.config);

        match code {
            op::FIND => {
                let Some((share, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let Some(actual) = path::find_with_suffix(&host) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let meta = match fs::metadata(&actual) {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let filetype = if meta.is_dir() {
                    FILETYPE_DIR
                } else {
                    self.filetype_for(&actual, Some(share))
                };
                send_reply(sock, rid, &filedesc(&meta, filetype), peer).await
            }

            op::OPEN_IN | op::OPEN_UP => {
                let Some((share, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let Some(actual) = path::find_with_suffix(&host) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let meta = match fs::metadata(&actual) {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                if meta.is_dir() {
                    let cs = riscos::time_to_centiseconds(riscos::mtime_secs(&meta));
                    let added = self.handles.add(
                        HandleKind::Dir,
                        None,
                        actual.clone(),
                        riscos::make_load_addr(FILETYPE_DIR, cs),
                        riscos::make_exec_addr(cs),
                        0,
                        riscos::attrs_from_metadata(&meta),
                    );
                    let Some((id, _)) = added else {
                        return send_err(sock, rid, EMFILE, peer).await;
                    };
                    return send_reply(sock, rid, &filedesc_with_handle(&meta, FILETYPE_DIR, id), peer)
                        .await;
                }
                let file = match OpenOptions::new()
                    .read(true)
                    .write(code == op::OPEN_UP)
                    .open(&actual)
                {
                    Ok(file) => file,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let filetype = self.filetype_for(&actual, Some(share));
                let cs = riscos::time_to_centiseconds(riscos::mtime_secs(&meta));
                let added = self.handles.add(
                    HandleKind::File,
                    Some(file),
                    actual.clone(),
                    riscos::make_load_addr(filetype, cs),
                    riscos::make_exec_addr(cs),
                    meta.len().min(u32::MAX as u64) as u32,
                    riscos::attrs_from_metadata(&meta),
                );
                let Some((id, _)) = added else {
                    return send_err(sock, rid, EMFILE, peer).await;
                };
                send_reply(sock, rid, &filedesc_with_handle(&meta, filetype, id), peer).await
            }

            op::OPEN_DIR => {
                let Some((_, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let meta = match fs::metadata(&host) {
                    Ok(meta) if meta.is_dir() => meta,
                    _ => return send_err(sock, rid, ENOTDIR, peer).await,
                };
                let added = self.handles.add(
                    HandleKind::Dir,
                    None,
                    host,
                    0,
                    0,
                    0,
                    riscos::attrs_from_metadata(&meta),
                );
                let Some((id, token)) = added else {
                    return send_err(sock, rid, EMFILE, peer).await;
                };
                let mut reply = [0u8; 8];
                write_u32(&mut reply, 0, id);
                write_u32(&mut reply, 4, u32::from(token));
                send_reply(sock, rid, &reply, peer).await
            }

            op::CREATE => {
                let Some((share, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                if let Some(parent) = host.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                let file = match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&host)
                {
                    Ok(file) => file,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let meta = match file.metadata() {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let filetype = self.filetype_for(&host, Some(share));
                let cs = riscos::time_to_centiseconds(unix_now());
                let added = self.handles.add(
                    HandleKind::File,
                    Some(file),
                    host.clone(),
                    riscos::make_load_addr(filetype, cs),
                    riscos::make_exec_addr(cs),
                    0,
                    riscos::ATTR_R | riscos::ATTR_W | riscos::ATTR_PUB_R,
                );
                let Some((id, _)) = added else {
                    return send_err(sock, rid, EMFILE, peer).await;
                };
                send_reply(sock, rid, &filedesc_with_handle(&meta, filetype, id), peer).await
            }

            op::CREATE_DIR => {
                let Some((_, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                if let Err(e) = fs::create_dir_all(&host) {
                    return send_err(sock, rid, io_code(&e), peer).await;
                }
                let meta = match fs::metadata(&host) {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let added = self.handles.add(
                    HandleKind::Dir,
                    None,
                    host,
                    0,
                    0,
                    0,
                    riscos::attrs_from_metadata(&meta),
                );
                let Some((id, _)) = added else {
                    return send_err(sock, rid, EMFILE, peer).await;
                };
                send_reply(sock, rid, &filedesc_with_handle(&meta, FILETYPE_DIR, id), peer).await
            }

            op::DELETE => {
                let Some((share, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let Some(actual) = path::find_with_suffix(&host) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let meta = match fs::metadata(&actual) {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let filetype = if meta.is_dir() {
                    FILETYPE_DIR
                } else {
                    self.filetype_for(&actual, Some(share))
                };
                let desc = filedesc(&meta, filetype);
                let removed = if meta.is_dir() {
                    fs::remove_dir(&actual)
                } else {
                    fs::remove_file(&actual)
                };
                if let Err(e) = removed {
                    return send_err(sock, rid, io_code(&e), peer).await;
                }
                send_reply(sock, rid, &desc, peer).await
            }

            op::ACCESS => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let new_attrs = read_u32(buf, 8);
                let Some((share, host)) = path::resolve(&config, &platform_path) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let Some(actual) = path::find_with_suffix(&host) else {
                    return send_err(sock, rid, ENOENT, peer).await;
                };
                let meta = match fs::metadata(&actual) {
                    Ok(meta) => meta,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = riscos::attrs_to_mode(new_attrs);
                    let _ = fs::set_permissions(&actual, fs::Permissions::from_mode(mode));
                }
                let filetype = if meta.is_dir() {
                    FILETYPE_DIR
                } else {
                    self.filetype_for(&actual, Some(share))
                };
                send_reply(sock, rid, &filedesc(&meta, filetype), peer).await
            }

            op::FREE_SPACE => {
                let host = match path::resolve(&config, &platform_path) {
                    Some((_, host)) if !platform_path.is_empty() => host,
                    _ => match config.shares.first() {
                        Some(share) => share.path.clone(),
                        None => return send_err(sock, rid, ENOENT, peer).await,
                    },
                };
                let info = match crate::hostfs::fsinfo(&host) {
                    Ok(info) => info,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
                let mut reply = [0u8; 12];
                write_u32(&mut reply, 0, clamp(info.free_bytes));
                write_u32(&mut reply, 4, clamp(info.free_bytes));
                write_u32(&mut reply, 8, clamp(info.total_bytes));
                send_reply(sock, rid, &reply, peer).await
            }

            op::FREE_SPACE64 => {
                let info = config
                    .shares
                    .first()
                    .and_then(|share| crate::hostfs::fsinfo(&share.path).ok())
                    .unwrap_or_default();
                let mut reply = [0u8; 24];
                write_u32(&mut reply, 0, (info.free_bytes & 0xFFFF_FFFF) as u32);
                write_u32(&mut reply, 4, (info.free_bytes >> 32) as u32);
                write_u32(&mut reply, 8, (info.free_bytes & 0xFFFF_FFFF) as u32);
                write_u32(&mut reply, 12, (info.free_bytes >> 32) as u32);
                write_u32(&mut reply, 16, (info.total_bytes & 0xFFFF_FFFF) as u32);
                write_u32(&mut reply, 20, (info.total_bytes >> 32) as u32);
                send_reply(sock, rid, &reply, peer).await
            }

            op::RENAME => {
                // The new name arrives in a follow-up data packet; the
                // second phase is not implemented, so validate and decline.
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                if path::resolve(&config, &platform_path).is_none() {
                    return send_err(sock, rid, ENOENT, peer).await;
                }
                debug!(path = %platform_path, "rename declined");
                send_err(sock, rid, ENOSYS, peer).await
            }

            op::CLOSE => {
                self.handles.remove(handle_id);
                send_reply(sock, rid, &[], peer).await
            }

            op::READ => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let length = read_u32(buf, 16) as usize;
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let Some(file) = handle.file.as_mut() else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let data = match read_window(file, offset, length.min(MAX_READ)) {
                    Ok(data) => data,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let new_pos = offset.wrapping_add(data.len() as u32);
                handle.seq_ptr = new_pos;
                sock.send_to(&wire::read_reply(rid, &data, new_pos), peer)
                    .await?;
                Ok(())
            }

            op::WRITE => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let amount = read_u32(buf, 16);
                self.begin_write(sock, rid, handle_id, offset, amount, peer)
                    .await
            }

            op::READ_DIR => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let start = read_u32(buf, 12) as usize;
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                if handle.kind != HandleKind::Dir {
                    return send_err(sock, rid, ENOTDIR, peer).await;
                }
                let dir = handle.host_path.clone();
                self.send_readdir(sock, rid, &dir, start, peer).await
            }

            op::ENSURE => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let size = read_u32(buf, 12);
                self.ensure_length(sock, rid, handle_id, size, peer).await
            }

            op::SET_LENGTH => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let new_len = read_u32(buf, 12);
                self.set_length(sock, rid, handle_id, new_len, peer).await
            }

            op::SET_INFO => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let load = read_u32(buf, 12);
                let exec = read_u32(buf, 16);
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                handle.load_addr = load;
                handle.exec_addr = exec;
                let is_file = handle.kind == HandleKind::File;
                let mut host = handle.host_path.clone();

                let mut new_filetype = 0;
                if load & 0xFFF0_0000 == 0xFFF0_0000 {
                    new_filetype = riscos::filetype_from_load(load);
                    // Files carry their type as a name suffix on the host.
                    if is_file {
                        if let Some(name) = host.file_name().and_then(|n| n.to_str()) {
                            let renamed = host
                                .with_file_name(riscos::append_type_suffix(name, new_filetype));
                            if renamed != host && fs::rename(&host, &renamed).is_ok() {
                                host = renamed;
                            }
                        }
                    }
                    let cs = riscos::centiseconds_from_addrs(load, exec);
                    if cs >= riscos::EPOCH_SHIFT * 100 {
                        let _ =
                            crate::hostfs::set_mtime(&host, riscos::time_from_centiseconds(cs));
                    }
                }
                if let Some(handle) = self.handles.get(handle_id) {
                    handle.host_path = host.clone();
                }
                match fs::metadata(&host) {
                    Ok(meta) => {
                        send_reply(sock, rid, &filedesc(&meta, new_filetype), peer).await
                    }
                    Err(_) => send_reply(sock, rid, &[], peer).await,
                }
            }

            op::GET_SEQ_PTR => {
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let Some(file) = handle.file.as_mut() else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let pos = match file.stream_position() {
                    Ok(pos) => pos as u32,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                send_reply(sock, rid, &pos.to_le_bytes(), peer).await
            }

            op::SET_SEQ_PTR => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let pos = read_u32(buf, 12);
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let Some(file) = handle.file.as_mut() else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                if let Err(e) = file.seek(SeekFrom::Start(u64::from(pos))) {
                    return send_err(sock, rid, io_code(&e), peer).await;
                }
                handle.seq_ptr = pos;
                send_reply(sock, rid, &pos.to_le_bytes(), peer).await
            }

            op::ZERO => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let zero_len = read_u32(buf, 16);
                self.zero_extend(sock, rid, handle_id, offset, zero_len, peer)
                    .await
            }

            _ => {
                debug!(code, "unsupported A sub-code");
                send_err(sock, rid, ENOSYS, peer).await
            }
        }
    }

    /// `B` framing: `cmd + rid + code(4) + handle(4) + extra(4) + path`.
    async fn path_command_ext(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        buf: &[u8],
        peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < 16 {
            return send_err(sock, rid, EINVAL, peer).await;
        }
        let code = read_u32(buf, 4);
        let handle_id = read_u32(buf, 8);
        let extra = read_u32(buf, 12);
        let platform_path = frame_path(buf, 16).into_owned();
        debug!(code, handle_id, extra, path = %platform_path, "B command");

        if self.access_denied(&platform_path, peer) {
            return send_err(sock, rid, EACCES, peer).await;
        }
        let config = Arc::clone(&self.config);

        match code {
            op::OPEN_DIR => {
                // The path may be a bare share name the resolver cannot
                // split; fall back to an exact share match.
                let host = match path::resolve(&config, &platform_path) {
                    Some((_, host)) => host,
                    None => match config.find_share(&platform_path) {
                        Some(share) => share.path.clone(),
                        None => return send_err(sock, rid, ENOENT, peer).await,
                    },
                };
                let meta = match fs::metadata(&host) {
                    Ok(meta) if meta.is_dir() => meta,
                    _ => return send_err(sock, rid, ENOTDIR, peer).await,
                };
                let added = self.handles.add(
                    HandleKind::Dir,
                    None,
                    host.clone(),
                    0,
                    0,
                    0,
                    riscos::attrs_from_metadata(&meta),
                );
                let Some((id, _)) = added else {
                    return send_err(sock, rid, EMFILE, peer).await;
                };
                self.send_catalogue(sock, rid, &host, id, peer).await
            }

            op::READ => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = extra;
                let length = read_u32(buf, 16) as usize;
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let Some(file) = handle.file.as_mut() else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let data = match read_window(file, offset, length.min(MAX_READ)) {
                    Ok(data) => data,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                let new_pos = offset.wrapping_add(data.len() as u32);
                handle.seq_ptr = new_pos;
                sock.send_to(&wire::read_reply(rid, &data, new_pos), peer)
                    .await?;
                Ok(())
            }

            op::READ_DIR => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                if handle.kind != HandleKind::Dir {
                    return send_err(sock, rid, EBADF, peer).await;
                }
                let dir = handle.host_path.clone();
                self.send_readdir(sock, rid, &dir, 0, peer).await
            }

            _ => {
                debug!(code, "unsupported B sub-code");
                send_err(sock, rid, ENOSYS, peer).await
            }
        }
    }

    /// `a` framing: `cmd + rid + code(4) + handle(4) + args`.
    async fn handle_command(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        buf: &[u8],
        peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < 12 {
            return send_err(sock, rid, EINVAL, peer).await;
        }
        let code = read_u32(buf, 4);
        let handle_id = read_u32(buf, 8);
        debug!(code, handle_id, "a command");

        match code {
            op::CLOSE => {
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let token = handle.token;
                self.handles.close(handle_id, token);
                send_reply(sock, rid, &[], peer).await
            }

            op::READ => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let length = read_u32(buf, 16) as usize;
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let Some(file) = handle.file.as_mut() else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let data = match read_window(file, offset, length.min(MAX_RAW_READ)) {
                    Ok(data) => data,
                    Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
                };
                handle.seq_ptr = offset.wrapping_add(data.len() as u32);
                sock.send_to(&wire::data_frame(rid, &data), peer).await?;
                Ok(())
            }

            op::WRITE => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let amount = read_u32(buf, 16);
                self.begin_write(sock, rid, handle_id, offset, amount, peer)
                    .await
            }

            op::READ_DIR => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let start = read_u32(buf, 12) as usize;
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                if handle.kind != HandleKind::Dir {
                    return send_err(sock, rid, EBADF, peer).await;
                }
                let dir = handle.host_path.clone();
                self.send_readdir(sock, rid, &dir, start, peer).await
            }

            op::ENSURE => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let size = read_u32(buf, 12);
                self.ensure_length(sock, rid, handle_id, size, peer).await
            }

            op::SET_LENGTH => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let new_len = read_u32(buf, 12);
                self.set_length(sock, rid, handle_id, new_len, peer).await
            }

            op::SET_INFO => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let load = read_u32(buf, 12);
                let exec = read_u32(buf, 16);
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                handle.load_addr = load;
                handle.exec_addr = exec;
                let host = handle.host_path.clone();
                let cs = riscos::centiseconds_from_addrs(load, exec);
                if cs >= riscos::EPOCH_SHIFT * 100 {
                    let _ = crate::hostfs::set_mtime(&host, riscos::time_from_centiseconds(cs));
                }
                send_reply(sock, rid, &[], peer).await
            }

            op::GET_SEQ_PTR => {
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                let pos = handle.seq_ptr;
                send_reply(sock, rid, &pos.to_le_bytes(), peer).await
            }

            op::SET_SEQ_PTR => {
                if buf.len() < 16 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let pos = read_u32(buf, 12);
                let Some(handle) = self.handles.get(handle_id) else {
                    return send_err(sock, rid, EBADF, peer).await;
                };
                handle.seq_ptr = pos;
                if let Some(file) = handle.file.as_mut() {
                    let _ = file.seek(SeekFrom::Start(u64::from(pos)));
                }
                send_reply(sock, rid, &pos.to_le_bytes(), peer).await
            }

            op::ZERO => {
                if buf.len() < 20 {
                    return send_err(sock, rid, EINVAL, peer).await;
                }
                let offset = read_u32(buf, 12);
                let zero_len = read_u32(buf, 16);
                self.zero_extend(sock, rid, handle_id, offset, zero_len, peer)
                    .await
            }

            op::VERSION => send_reply(sock, rid, &[0x02, 0x00], peer).await,

            _ => {
                debug!(code, "unsupported a sub-code");
                send_err(sock, rid, ENOSYS, peer).await
            }
        }
    }

    /// `F` framing: simple queries.
    async fn query_command(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        buf: &[u8],
        peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < 12 {
            return send_err(sock, rid, EINVAL, peer).await;
        }
        let code = read_u32(buf, 4);
        debug!(code, "F command");
        match code {
            // Clients ask directly for dead handles; the authoritative list
            // goes out with the periodic broadcast, so report none here.
            op::DEAD_HANDLES => send_reply(sock, rid, &0u32.to_le_bytes(), peer).await,
            op::VERSION => send_reply(sock, rid, &PROTOCOL_VERSION.to_le_bytes(), peer).await,
            _ => {
                debug!(code, "unsupported F sub-code");
                send_err(sock, rid, ENOSYS, peer).await
            }
        }
    }

    /// Starts a pull transfer: claim a slot and ask for the first window.
    async fn begin_write(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        handle_id: u32,
        offset: u32,
        amount: u32,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let Some(handle) = self.handles.get(handle_id) else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        if handle.file.is_none() {
            return send_err(sock, rid, EBADF, peer).await;
        }
        if amount == 0 {
            return send_reply(sock, rid, &[], peer).await;
        }
        if self.writes.begin(handle_id, offset, amount, rid, peer).is_none() {
            return send_err(sock, rid, ENOMEM, peer).await;
        }
        let first = amount.min(WRITE_CHUNK);
        debug!(%rid, handle_id, offset, amount, "write transfer started");
        sock.send_to(&wire::data_request_frame(rid, 0, first), peer)
            .await?;
        Ok(())
    }

    /// Applies one `d` packet to its pending transfer. Packets with no
    /// matching transfer are dropped so they cannot blow back on unrelated
    /// transactions.
    async fn data_packet(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        buf: &[u8],
        _peer: SocketAddr,
    ) -> io::Result<()> {
        if buf.len() < 8 {
            return Ok(());
        }
        let rel_pos = read_u32(buf, 4);
        let data = &buf[8..];

        let Some(write) = self.writes.find(rid) else {
            trace!(%rid, "data packet with no pending transfer");
            return Ok(());
        };
        let (handle_id, start_pos, end_pos, client) =
            (write.handle_id, write.start_pos, write.end_pos, write.peer);

        let abs_pos = start_pos.wrapping_add(rel_pos);
        let outcome = match self.handles.get(handle_id) {
            Some(handle) => match handle.file.as_mut() {
                Some(file) => match write_window(file, abs_pos, data) {
                    Ok(()) => {
                        let current = abs_pos.wrapping_add(data.len() as u32);
                        handle.seq_ptr = current;
                        if handle.seq_ptr > handle.length {
                            handle.length = handle.seq_ptr;
                        }
                        Ok(current)
                    }
                    Err(e) => Err(Some(io_code(&e))),
                },
                None => Err(None),
            },
            None => Err(None),
        };

        match outcome {
            Ok(current) => {
                trace!(%rid, abs_pos, written = data.len(), current, end_pos, "data applied");
                if current < end_pos {
                    if let Some(write) = self.writes.find(rid) {
                        write.current_pos = current;
                        write.last_activity = std::time::Instant::now();
                    }
                    let rel_current = current.wrapping_sub(start_pos);
                    let chunk = (end_pos - current).min(WRITE_CHUNK);
                    sock.send_to(
                        &wire::data_request_frame(rid, rel_current, rel_current + chunk),
                        client,
                    )
                    .await?;
                } else {
                    debug!(%rid, "write transfer complete");
                    self.writes.release(rid);
                    send_reply(sock, rid, &[], client).await?;
                }
                Ok(())
            }
            Err(code) => {
                self.writes.release(rid);
                if let Some(code) = code {
                    send_err(sock, rid, code, client).await?;
                }
                Ok(())
            }
        }
    }

    async fn ensure_length(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        handle_id: u32,
        size: u32,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let Some(handle) = self.handles.get(handle_id) else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        let Some(file) = handle.file.as_mut() else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
        };
        if u64::from(size) > meta.len() {
            if let Err(e) = file.set_len(u64::from(size)) {
                return send_err(sock, rid, io_code(&e), peer).await;
            }
            handle.length = size;
        }
        send_reply(sock, rid, &size.to_le_bytes(), peer).await
    }

    async fn set_length(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        handle_id: u32,
        new_len: u32,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let Some(handle) = self.handles.get(handle_id) else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        let Some(file) = handle.file.as_mut() else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        if let Err(e) = file.set_len(u64::from(new_len)) {
            return send_err(sock, rid, io_code(&e), peer).await;
        }
        handle.length = new_len;
        send_reply(sock, rid, &new_len.to_le_bytes(), peer).await
    }

    async fn zero_extend(
        &mut self,
        sock: &UdpSocket,
        rid: Rid,
        handle_id: u32,
        offset: u32,
        zero_len: u32,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let Some(handle) = self.handles.get(handle_id) else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        let Some(file) = handle.file.as_mut() else {
            return send_err(sock, rid, EBADF, peer).await;
        };
        let new_length = offset.saturating_add(zero_len);
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => return send_err(sock, rid, io_code(&e), peer).await,
        };
        if u64::from(new_length) > meta.len() {
            if let Err(e) = file.set_len(u64::from(new_length)) {
                return send_err(sock, rid, io_code(&e), peer).await;
            }
            handle.length = new_length;
        }
        send_reply(sock, rid, &new_length.to_le_bytes(), peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShareConfig;

    fn test_config(share_path: &Path) -> Arc<Config> {
        Arc::new(Config {
            shares: vec![ShareConfig {
                name: "Data".to_string(),
                path: share_path.to_path_buf(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    async fn socket_pair() -> (UdpSocket, UdpSocket, SocketAddr, SocketAddr) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();
        (server, client, server_addr, client_addr)
    }

    fn a_frame(rid: [u8; 3], code: u32, handle: u32, path: &str) -> Vec<u8> {
        let mut out = vec![b'A', rid[0], rid[1], rid[2]];
        out.extend_from_slice(&code.to_le_bytes());
        out.extend_from_slice(&handle.to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out.push(0);
        out
    }

    async fn recv(client: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.recv_from(&mut buf),
        )
        .await
        .expect("reply timed out")
        .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn find_reports_length_and_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme"), vec![0u8; 42]).unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let frame = a_frame([1, 0, 0], op::FIND, 0, "Data.readme");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();

        let reply = recv(&client).await;
        assert_eq!(reply[0], b'R');
        assert_eq!(&reply[1..4], &[1, 0, 0]);
        let desc = &reply[4..24];
        assert_eq!(read_u32(desc, 0) & 0xFFF0_0000, 0xFFF0_0000);
        assert_eq!(read_u32(desc, 8), 42);
        assert_eq!(read_u32(desc, 16), OBJECT_FILE);
    }

    #[tokio::test]
    async fn find_uses_suffix_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes,fff"), b"hello").unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let frame = a_frame([2, 0, 0], op::FIND, 0, "Data.notes");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();

        let reply = recv(&client).await;
        assert_eq!(reply[0], b'R');
        assert_eq!((read_u32(&reply[4..], 0) >> 8) & 0xFFF, 0xFFF);
    }

    #[tokio::test]
    async fn traversal_attempt_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let frame = a_frame([3, 0, 0], op::FIND, 0, "Data.x/../secret");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();

        let reply = recv(&client).await;
        assert_eq!(reply[0], b'E');
        assert_eq!(reply[4], ENOENT);
    }

    #[tokio::test]
    async fn short_frame_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        engine
            .handle_rpc(&server, &[b'A', 5, 0, 0, 1, 0], client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[0], b'E');
        assert_eq!(reply[4], EINVAL);
    }

    #[tokio::test]
    async fn protected_share_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("secret"), b"x").unwrap();
        let config = Arc::new(Config {
            shares: vec![ShareConfig {
                name: "Vault".to_string(),
                path: dir.path().to_path_buf(),
                attributes: vec!["protected".to_string()],
                password: Some("AB12".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut engine = Engine::new(config);
        let (server, client, _, client_addr) = socket_pair().await;

        let frame = a_frame([4, 0, 0], op::FIND, 0, "Vault.secret");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[0], b'E');
        assert_eq!(reply[4], EACCES);

        // After the cache learns the client, the same request succeeds.
        engine.auth.add(client_addr.ip(), "Vault");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[0], b'R');
    }

    #[tokio::test]
    async fn write_transfer_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("out"), b"").unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        // Open for update to get a writable handle.
        let frame = a_frame([1, 0, 0], op::OPEN_UP, 0, "Data.out");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[0], b'R');
        let handle_id = read_u32(&reply, 24);

        // A 10 KiB write: expect a first window of 8 KiB.
        let mut frame = vec![b'A', 9, 0, 0];
        frame.extend_from_slice(&op::WRITE.to_le_bytes());
        frame.extend_from_slice(&handle_id.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&10_240u32.to_le_bytes());
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let w = recv(&client).await;
        assert_eq!(w[0], b'w');
        assert_eq!(read_u32(&w, 4), 0);
        assert_eq!(read_u32(&w, 12), 8192);

        // First data packet: the next window asks for the rest.
        let mut d = vec![b'd', 9, 0, 0];
        d.extend_from_slice(&0u32.to_le_bytes());
        d.extend_from_slice(&vec![0xAB; 8192]);
        engine.handle_rpc(&server, &d, client_addr).await.unwrap();
        let w = recv(&client).await;
        assert_eq!(w[0], b'w');
        assert_eq!(read_u32(&w, 4), 8192);
        assert_eq!(read_u32(&w, 12), 10_240);

        // Final data packet completes with an empty R.
        let mut d = vec![b'd', 9, 0, 0];
        d.extend_from_slice(&8192u32.to_le_bytes());
        d.extend_from_slice(&vec![0xCD; 2048]);
        engine.handle_rpc(&server, &d, client_addr).await.unwrap();
        let r = recv(&client).await;
        assert_eq!(&r[..], &[b'R', 9, 0, 0]);

        assert!(engine.writes.is_empty());
        let written = fs::read(dir.path().join("out")).unwrap();
        assert_eq!(written.len(), 10_240);
        assert!(written[..8192].iter().all(|&b| b == 0xAB));
        assert!(written[8192..].iter().all(|&b| b == 0xCD));
    }

    #[tokio::test]
    async fn stray_data_packet_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let mut d = vec![b'd', 7, 7, 7];
        d.extend_from_slice(&0u32.to_le_bytes());
        d.extend_from_slice(b"orphan");
        engine.handle_rpc(&server, &d, client_addr).await.unwrap();

        // No reply of any kind.
        let mut buf = [0u8; 64];
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            client.recv_from(&mut buf),
        )
        .await
        .is_err();
        assert!(timed_out);
    }

    #[tokio::test]
    async fn opendir_catalogue_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha"), b"aaaa").unwrap();
        fs::write(dir.path().join(".hidden"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let mut frame = vec![b'B', 1, 1, 1];
        frame.extend_from_slice(&op::OPEN_DIR.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(b"Data\0");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();

        let reply = recv(&client).await;
        assert_eq!(reply[0], b'S');
        let entries_len = read_u32(&reply, 4) as usize;
        assert_eq!(read_u32(&reply, 8), 0x24);
        let b_at = 12 + entries_len;
        assert_eq!(reply[b_at], b'B');
        // Trailer: load marker, rounded length, end marker.
        assert_eq!(read_u32(&reply, b_at + 4), 0xFFFF_CD00);
        assert_eq!(
            read_u32(&reply, b_at + 12),
            (entries_len as u32 + 2047) & !2047
        );
        assert_eq!(read_u32(&reply, b_at + 28), entries_len as u32);
        assert_eq!(read_u32(&reply, b_at + 32), 0xFFFF_FFFF);

        // Two visible entries; the dotfile is skipped.
        let entries = &reply[12..12 + entries_len];
        let mut names = Vec::new();
        let mut at = 0;
        while at < entries.len() {
            let name_end = entries[at + 20..]
                .iter()
                .position(|&b| b == 0)
                .unwrap()
                + at
                + 20;
            names.push(String::from_utf8_lossy(&entries[at + 20..name_end]).into_owned());
            at += (20 + (name_end - at - 20) + 1 + 3) & !3;
        }
        names.sort();
        assert_eq!(names, vec!["alpha", "sub"]);
    }

    #[tokio::test]
    async fn version_query_replies_two() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let mut frame = vec![b'F', 2, 0, 0];
        frame.extend_from_slice(&op::VERSION.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(&reply[..], &[b'R', 2, 0, 0, 2, 0, 0, 0]);
    }

    #[tokio::test]
    async fn read_caps_and_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big"), vec![0x55u8; 100]).unwrap();
        let mut engine = Engine::new(test_config(dir.path()));
        let (server, client, _, client_addr) = socket_pair().await;

        let frame = a_frame([1, 0, 0], op::OPEN_IN, 0, "Data.big");
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        let handle_id = read_u32(&reply, 24);

        // Read 60 bytes at offset 50: only 50 remain.
        let mut frame = vec![b'A', 2, 0, 0];
        frame.extend_from_slice(&op::READ.to_le_bytes());
        frame.extend_from_slice(&handle_id.to_le_bytes());
        frame.extend_from_slice(&50u32.to_le_bytes());
        frame.extend_from_slice(&60u32.to_le_bytes());
        engine
            .handle_rpc(&server, &frame, client_addr)
            .await
            .unwrap();
        let reply = recv(&client).await;
        assert_eq!(reply[0], b'S');
        assert_eq!(read_u32(&reply, 4), 50);
        let b_at = 12 + 50;
        assert_eq!(reply[b_at], b'B');
        assert_eq!(read_u32(&reply, b_at + 8), 100, "new_pos = offset + read");
    }
}
