//! RISC OS metadata conversion.
//!
//! Filetypes, load/exec addresses, attribute bits and timestamps all have
//! strict bit layouts on the wire. A filetype is 12 bits; when a host file
//! name cannot carry it in the extension it is encoded as a `,xxx` suffix of
//! exactly three lowercase hex digits. Timestamps are 40-bit centisecond
//! counts from the 1900 epoch, split across the load and exec addresses.

use std::collections::HashMap;
use std::fs::Metadata;

/// Owner read.
pub const ATTR_R: u32 = 0x01;
/// Owner write.
pub const ATTR_W: u32 = 0x02;
/// Locked against deletion.
pub const ATTR_L: u32 = 0x08;
/// Public read.
pub const ATTR_PUB_R: u32 = 0x10;
/// Public write.
pub const ATTR_PUB_W: u32 = 0x20;

/// Object types reported in a FileDesc.
pub const OBJECT_FILE: u32 = 1;
pub const OBJECT_DIR: u32 = 2;

/// Fallback filetype for unknown extensions.
pub const FILETYPE_DATA: u32 = 0xFFD;
/// Pseudo-filetype for directories.
pub const FILETYPE_DIR: u32 = 0x1000;

/// Seconds between the 1900 epoch and the Unix epoch.
pub const EPOCH_SHIFT: u64 = 2_208_988_800;

const CS_PER_SEC: u64 = 100;

/// Compiled-in extension map, consulted after the configured one.
const BUILTIN_TYPES: &[(&str, u32)] = &[
    ("txt", 0xFFF),
    ("text", 0xFFF),
    ("bas", 0xFFB),
    ("c", 0xFFD),
    ("h", 0xFFD),
    ("s", 0xFFF),
    ("o", 0xFFE),
    ("pdf", 0xADF),
    ("png", 0xB60),
    ("jpg", 0xC85),
    ("jpeg", 0xC85),
    ("gif", 0x695),
    ("zip", 0xA91),
    ("html", 0xFAF),
    ("htm", 0xFAF),
    ("css", 0xF79),
    ("js", 0xF81),
    ("json", 0xF79),
    ("xml", 0xF80),
    ("csv", 0xDFE),
    ("sprite", 0xFF9),
    ("draw", 0xAFF),
    ("ff9", 0xFF9),
    ("aff", 0xAFF),
];

/// Converts Unix seconds to the 40-bit centisecond count.
pub fn time_to_centiseconds(unix_secs: u64) -> u64 {
    (unix_secs + EPOCH_SHIFT) * CS_PER_SEC
}

/// Converts a centisecond count back to Unix seconds. Counts before the
/// Unix epoch collapse to zero.
pub fn time_from_centiseconds(cs: u64) -> u64 {
    (cs / CS_PER_SEC).saturating_sub(EPOCH_SHIFT)
}

/// Packs the filetype and the timestamp's high byte into a load address.
pub fn make_load_addr(filetype: u32, cs: u64) -> u32 {
    0xFFF0_0000 | ((filetype & 0xFFF) << 8) | ((cs >> 32) & 0xFF) as u32
}

/// The exec address is the low 32 bits of the timestamp.
pub fn make_exec_addr(cs: u64) -> u32 {
    (cs & 0xFFFF_FFFF) as u32
}

/// Recovers the filetype from a load address, or [`FILETYPE_DATA`] when the
/// address is not in typed-and-dated form.
pub fn filetype_from_load(load: u32) -> u32 {
    if load & 0xFFF0_0000 != 0xFFF0_0000 {
        return FILETYPE_DATA;
    }
    (load >> 8) & 0xFFF
}

/// Reassembles the 40-bit timestamp from a load/exec pair.
pub fn centiseconds_from_addrs(load: u32, exec: u32) -> u64 {
    (u64::from(load & 0xFF) << 32) | u64::from(exec)
}

/// Maps Unix permission bits onto attribute bits. The lock bit is never set
/// from host permissions.
pub fn mode_to_attrs(mode: u32) -> u32 {
    let mut attrs = 0;
    if mode & 0o400 != 0 {
        attrs |= ATTR_R;
    }
    if mode & 0o200 != 0 {
        attrs |= ATTR_W;
    }
    if mode & 0o004 != 0 {
        attrs |= ATTR_PUB_R;
    }
    if mode & 0o002 != 0 {
        attrs |= ATTR_PUB_W;
    }
    attrs
}

/// Maps attribute bits back onto a Unix mode for chmod.
pub fn attrs_to_mode(attrs: u32) -> u32 {
    let mut mode = 0;
    if attrs & ATTR_R != 0 {
        mode |= 0o400;
    }
    if attrs & ATTR_W != 0 {
        mode |= 0o200;
    }
    if attrs & ATTR_PUB_R != 0 {
        mode |= 0o044;
    }
    if attrs & ATTR_PUB_W != 0 {
        mode |= 0o022;
    }
    mode
}

/// Attribute bits for a host metadata record.
#[cfg(unix)]
pub fn attrs_from_metadata(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    mode_to_attrs(meta.permissions().mode())
}

#[cfg(not(unix))]
pub fn attrs_from_metadata(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        ATTR_R | ATTR_PUB_R
    } else {
        ATTR_R | ATTR_W | ATTR_PUB_R
    }
}

/// Modification time of a host metadata record as Unix seconds.
pub fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parses a trailing `,xxx` filetype suffix: a comma followed by exactly
/// three hex digits at the end of the name.
pub fn filetype_from_suffix(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    if bytes.len() < 4 || bytes[bytes.len() - 4] != b',' {
        return None;
    }
    let digits = &name[name.len() - 3..];
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Returns the display name with any `,xxx` suffix removed.
pub fn strip_type_suffix(name: &str) -> &str {
    if filetype_from_suffix(name).is_some() {
        &name[..name.len() - 4]
    } else {
        name
    }
}

/// Appends a `,xxx` suffix for `filetype`, replacing any existing suffix.
/// Appending the same type twice yields the same path.
pub fn append_type_suffix(path: &str, filetype: u32) -> String {
    format!("{},{:03x}", strip_type_suffix(path), filetype & 0xFFF)
}

/// Looks up the filetype for a host file name: the `,xxx` suffix wins, then
/// the configured extension map, then the compiled-in table, else DATA.
pub fn filetype_from_ext(name: &str, mimemap: &HashMap<String, u32>) -> u32 {
    if let Some(t) = filetype_from_suffix(name) {
        return t;
    }
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return FILETYPE_DATA,
    };
    if let Some(t) = mimemap.get(&ext) {
        return *t;
    }
    BUILTIN_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, t)| *t)
        .unwrap_or(FILETYPE_DATA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centisecond_conversion_uses_1900_epoch() {
        assert_eq!(time_to_centiseconds(0), EPOCH_SHIFT * 100);
        assert_eq!(time_to_centiseconds(1), (EPOCH_SHIFT + 1) * 100);
        assert_eq!(time_from_centiseconds(time_to_centiseconds(123_456)), 123_456);
    }

    #[test]
    fn load_addr_packs_type_and_high_byte() {
        let cs = time_to_centiseconds(1_700_000_000);
        let load = make_load_addr(0xFFF, cs);
        assert_eq!(load & 0xFFF0_0000, 0xFFF0_0000);
        assert_eq!((load >> 8) & 0xFFF, 0xFFF);
        assert_eq!(load & 0xFF, ((cs >> 32) & 0xFF) as u32);
        assert_eq!(u64::from(make_exec_addr(cs)), cs & 0xFFFF_FFFF);
        assert_eq!(centiseconds_from_addrs(load, make_exec_addr(cs)), cs);
    }

    #[test]
    fn filetype_round_trips_through_load_addr() {
        let load = make_load_addr(0xB60, 0);
        assert_eq!(filetype_from_load(load), 0xB60);
        assert_eq!(filetype_from_load(0x0000_8000), FILETYPE_DATA);
    }

    #[test]
    fn mode_to_attrs_mapping() {
        assert_eq!(mode_to_attrs(0o644), ATTR_R | ATTR_W | ATTR_PUB_R);
        assert_eq!(mode_to_attrs(0o400), ATTR_R);
        assert_eq!(mode_to_attrs(0o006), ATTR_PUB_R | ATTR_PUB_W);
        assert_eq!(mode_to_attrs(0o644) & ATTR_L, 0);
    }

    #[test]
    fn attrs_to_mode_mapping() {
        assert_eq!(attrs_to_mode(ATTR_R | ATTR_W), 0o600);
        assert_eq!(attrs_to_mode(ATTR_PUB_R), 0o044);
    }

    #[test]
    fn suffix_parsing() {
        assert_eq!(filetype_from_suffix("notes,fff"), Some(0xFFF));
        assert_eq!(filetype_from_suffix("pic,b60"), Some(0xB60));
        assert_eq!(filetype_from_suffix("notes"), None);
        assert_eq!(filetype_from_suffix("notes,ffff"), None);
        assert_eq!(filetype_from_suffix("notes,zz1"), None);
        assert_eq!(filetype_from_suffix(",fff"), Some(0xFFF));
    }

    #[test]
    fn strip_and_append_are_inverse() {
        assert_eq!(strip_type_suffix("notes,fff"), "notes");
        assert_eq!(strip_type_suffix("notes"), "notes");
        let appended = append_type_suffix("notes", 0xFFF);
        assert_eq!(appended, "notes,fff");
        assert_eq!(strip_type_suffix(&appended), "notes");
        // Idempotent: re-appending rewrites the suffix in place.
        assert_eq!(append_type_suffix(&appended, 0xFFF), appended);
        assert_eq!(append_type_suffix("notes,fff", 0xB60), "notes,b60");
    }

    #[test]
    fn filetype_lookup_order() {
        let mut map = HashMap::new();
        map.insert("md".to_string(), 0xFFF);
        map.insert("png".to_string(), 0x123);
        // Suffix beats everything.
        assert_eq!(filetype_from_ext("readme.md,b60", &map), 0xB60);
        // Configured map beats the builtin table.
        assert_eq!(filetype_from_ext("pic.png", &map), 0x123);
        // Builtin fallback.
        assert_eq!(filetype_from_ext("page.html", &HashMap::new()), 0xFAF);
        // Unknown and extensionless names are DATA.
        assert_eq!(filetype_from_ext("file.xyz", &HashMap::new()), FILETYPE_DATA);
        assert_eq!(filetype_from_ext("file", &HashMap::new()), FILETYPE_DATA);
        assert_eq!(filetype_from_ext(".hidden", &HashMap::new()), FILETYPE_DATA);
    }
}
