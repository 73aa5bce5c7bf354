//! Share control and share data PDUs.
//!
//! Outbound builders append their body to a stream prepared by the
//! security layer; `init_*` reserves the share header in front of it and
//! `finish_*` fills it in once the body length is known.

use bytes::BufMut;

use super::mcs::USER_CHANNEL_BASE;
use crate::cache::persistent::{HashKey, MAX_PERSISTENT_CELLS};
use crate::config::SessionConfig;
use crate::error::{RdcError, Result};
use crate::flags::{CompressionFlags, LogonFlags};
use crate::input::InputEvent;
use crate::stream::{Layer, ReadStream, Stream, unistr_len};

// ── PDU types ────────────────────────────────────────────────────

pub const PDU_DEMAND_ACTIVE: u16 = 1;
pub const PDU_CONFIRM_ACTIVE: u16 = 3;
pub const PDU_DEACTIVATE: u16 = 6;
pub const PDU_DATA: u16 = 7;

pub const DATA_UPDATE: u8 = 2;
pub const DATA_CONTROL: u8 = 20;
pub const DATA_POINTER: u8 = 27;
pub const DATA_INPUT: u8 = 28;
pub const DATA_SYNCHRONISE: u8 = 31;
pub const DATA_BELL: u8 = 34;
pub const DATA_LOGON: u8 = 38;
pub const DATA_FONT2: u8 = 39;
pub const DATA_DISCONNECT: u8 = 47;
pub const DATA_PERSISTENT_KEYS: u8 = 0x2b;

pub const CTRL_REQUEST_CONTROL: u16 = 1;
pub const CTRL_COOPERATE: u16 = 4;

/// Share control header: length, type, originator.
pub const SHARE_CONTROL_LEN: usize = 6;
/// Share control header plus the share data header.
pub const SHARE_DATA_LEN: usize = 18;

/// Flow-control PDUs carry this in place of a length.
const FLOW_MARKER: u16 = 0x8000;
const FLOW_PDU_LEN: usize = 8;

/// Keys sent per persistent key list PDU.
pub const MAX_KEYS_PER_PDU: usize = 169;

const SOURCE_DESCRIPTOR: &[u8] = b"MSTSC\0";
const DLL_PATH: &str = "C:\\WINNT\\System32\\mstscax.dll";

// ── Capability sets ──────────────────────────────────────────────

const CAPSET_GENERAL: u16 = 1;
const CAPSET_BITMAP: u16 = 2;
const CAPSET_ORDER: u16 = 3;
const CAPSET_BMPCACHE: u16 = 4;
const CAPSET_CONTROL: u16 = 5;
const CAPSET_ACTIVATE: u16 = 7;
const CAPSET_POINTER: u16 = 8;
const CAPSET_SHARE: u16 = 9;
const CAPSET_COLCACHE: u16 = 10;
const CAPSET_BMPCACHE2: u16 = 19;

const CAPLEN_GENERAL: u16 = 0x18;
const CAPLEN_BITMAP: u16 = 0x1c;
const CAPLEN_ORDER: u16 = 0x58;
const CAPLEN_BMPCACHE: u16 = 0x28;
const CAPLEN_CONTROL: u16 = 0x0c;
const CAPLEN_ACTIVATE: u16 = 0x0c;
const CAPLEN_POINTER: u16 = 0x08;
const CAPLEN_SHARE: u16 = 0x08;
const CAPLEN_COLCACHE: u16 = 0x08;
const CAPLEN_BMPCACHE2: u16 = 0x28;

const CAPSET_COUNT: u16 = 9;
const CAPS_LEN: usize = (CAPLEN_GENERAL
    + CAPLEN_BITMAP
    + CAPLEN_ORDER
    + CAPLEN_BMPCACHE
    + CAPLEN_COLCACHE
    + CAPLEN_ACTIVATE
    + CAPLEN_CONTROL
    + CAPLEN_POINTER
    + CAPLEN_SHARE) as usize;

/// General capability extra flags: fast-path output, long credentials,
/// auto-reconnect, no bitmap compression header.
const RDP5_EXTRA_FLAGS: u16 = 0x040d;

/// Cells per rev2 bitmap cache.
pub const BMPCACHE2_CELLS: [u32; 3] = [0x78, 0x78, 0x150];
const BMPCACHE2_FLAG_PERSIST: u32 = 1 << 31;

// ── Share identity ───────────────────────────────────────────────

/// Identity stamped on every outbound share PDU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareIds {
    /// MCS user id as assigned by attach-user.
    pub user_id: u16,
    /// Share id from the last demand active.
    pub share_id: u32,
}

impl ShareIds {
    pub fn originator(&self) -> u16 {
        self.user_id.wrapping_add(USER_CHANNEL_BASE)
    }
}

pub fn init_control(s: &mut Stream) {
    s.reserve_header(Layer::Rdp, SHARE_CONTROL_LEN);
}

pub fn finish_control(s: &mut Stream, ids: ShareIds, pdu_type: u16) -> Result<()> {
    let length = share_length(s)?;
    let mut h = s.header_mut(Layer::Rdp)?;
    h.put_u16_le(length);
    h.put_u16_le(pdu_type | 0x10);
    h.put_u16_le(ids.originator());
    Ok(())
}

pub fn init_data(s: &mut Stream) {
    s.reserve_header(Layer::Rdp, SHARE_DATA_LEN);
}

pub fn finish_data(s: &mut Stream, ids: ShareIds, data_type: u8) -> Result<()> {
    let length = share_length(s)?;
    let mut h = s.header_mut(Layer::Rdp)?;
    h.put_u16_le(length);
    h.put_u16_le(PDU_DATA | 0x10);
    h.put_u16_le(ids.originator());
    h.put_u32_le(ids.share_id);
    h.put_u8(0); // pad
    h.put_u8(1); // stream id
    h.put_u16_le(length - 14);
    h.put_u8(data_type);
    h.put_u8(0); // compression type
    h.put_u16_le(0); // compressed length
    Ok(())
}

fn share_length(s: &Stream) -> Result<u16> {
    u16::try_from(s.payload_after(Layer::Rdp, 0)).map_err(|_| RdcError::malformed("oversized share PDU"))
}

// ── Logon info ───────────────────────────────────────────────────

/// Flags announced in the logon info PDU.
pub fn logon_flags(config: &SessionConfig) -> LogonFlags {
    let mut flags = LogonFlags::MOUSE
        | LogonFlags::DISABLE_CTRL_ALT_DEL
        | LogonFlags::UNICODE
        | LogonFlags::MAXIMIZE_SHELL;
    if !config.password.is_empty() {
        flags |= LogonFlags::AUTOLOGON;
    }
    if config.bulk_compression {
        flags |= LogonFlags::COMPRESSION | LogonFlags::COMPRESSION_TYPE_64K;
    }
    if config.rdp5 {
        flags |= LogonFlags::ENABLE_WINDOWS_KEY;
    }
    flags
}

/// Append the logon info body. `extended` selects the RDP 5 layout,
/// which also carries `client_address` and the performance flags.
pub fn put_logon_info(s: &mut Stream, config: &SessionConfig, extended: bool, client_address: &str) {
    let flags = logon_flags(config);
    let password = if flags.contains(LogonFlags::AUTOLOGON) {
        config.password.as_str()
    } else {
        ""
    };
    let fields = [
        config.domain.as_str(),
        config.username.as_str(),
        password,
        config.startup_command.as_str(),
        config.working_directory.as_str(),
    ];

    s.put_u32_le(0); // code page
    s.put_u32_le(flags.bits());
    for f in fields {
        s.put_u16_le(unistr_len(f) as u16);
    }
    for f in fields {
        s.put_unistr(f);
    }
    if !extended {
        return;
    }

    s.put_u16_le(2); // AF_INET
    s.put_u16_le((unistr_len(client_address) + 2) as u16);
    s.put_unistr(client_address);
    s.put_u16_le((unistr_len(DLL_PATH) + 2) as u16);
    s.put_unistr(DLL_PATH);
    put_time_zone(s);
    s.put_u32_le(0); // session id
    s.put_u32_le(config.performance_flags.bits());
    s.put_u16_le(0); // no auto-reconnect cookie
}

/// UTC with no daylight saving.
fn put_time_zone(s: &mut Stream) {
    s.put_u32_le(0);
    s.put_unistr_fixed("UTC", 64);
    s.put_fill(0, 16);
    s.put_u32_le(0);
    s.put_unistr_fixed("UTC", 64);
    s.put_fill(0, 16);
    s.put_u32_le(0);
}

// ── Confirm active ───────────────────────────────────────────────

/// What the client announces in its capability sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub colour_depth: u8,
    pub width: u16,
    pub height: u16,
    pub rdp5: bool,
    pub bitmap_compression: bool,
    pub bitmap_cache: bool,
    pub desktop_save: bool,
    pub polygon_ellipse: bool,
    /// Advertise the persistent rev2 cache for cache id 2.
    pub persistent_cache: bool,
}

impl Capabilities {
    pub fn from_config(config: &SessionConfig, persistent_cache: bool) -> Self {
        Self {
            colour_depth: config.colour_depth,
            width: config.wire_width(),
            height: config.height,
            rdp5: config.rdp5,
            bitmap_compression: config.bitmap_compression,
            bitmap_cache: config.bitmap_cache,
            desktop_save: config.desktop_save,
            polygon_ellipse: config.polygon_ellipse_orders,
            persistent_cache,
        }
    }

    fn bytes_per_pixel(&self) -> u16 {
        (u16::from(self.colour_depth) + 7) / 8
    }
}

/// Append the confirm active body (share control header excluded).
pub fn put_confirm_active(s: &mut Stream, ids: ShareIds, caps: &Capabilities) {
    s.put_u32_le(ids.share_id);
    s.put_u16_le(0x03ea); // originator: server channel
    s.put_u16_le(SOURCE_DESCRIPTOR.len() as u16);
    s.put_u16_le((CAPS_LEN + 4) as u16);
    s.put_slice(SOURCE_DESCRIPTOR);
    s.put_u16_le(CAPSET_COUNT);
    s.put_u16_le(0);

    put_general_caps(s, caps);
    put_bitmap_caps(s, caps);
    put_order_caps(s, caps);
    if caps.rdp5 {
        put_bmpcache2_caps(s, caps);
    } else {
        put_bmpcache_caps(s, caps);
    }
    put_colcache_caps(s);
    put_activate_caps(s);
    put_control_caps(s);
    put_pointer_caps(s);
    put_share_caps(s);
}

fn capset(s: &mut Stream, kind: u16, len: u16) {
    s.put_u16_le(kind);
    s.put_u16_le(len);
}

fn put_general_caps(s: &mut Stream, caps: &Capabilities) {
    capset(s, CAPSET_GENERAL, CAPLEN_GENERAL);
    s.put_u16_le(1); // OS major
    s.put_u16_le(3); // OS minor
    s.put_u16_le(0x200); // protocol version
    s.put_u16_le(0);
    s.put_u16_le(0); // compression types
    s.put_u16_le(if caps.rdp5 { RDP5_EXTRA_FLAGS } else { 0 });
    s.put_u16_le(0); // update capability
    s.put_u16_le(0); // remote unshare
    s.put_u16_le(0); // compression level
    s.put_u16_le(0);
}

fn put_bitmap_caps(s: &mut Stream, caps: &Capabilities) {
    capset(s, CAPSET_BITMAP, CAPLEN_BITMAP);
    s.put_u16_le(u16::from(caps.colour_depth));
    s.put_u16_le(1); // receive 1 bpp
    s.put_u16_le(1); // receive 4 bpp
    s.put_u16_le(1); // receive 8 bpp
    s.put_u16_le(caps.width);
    s.put_u16_le(caps.height);
    s.put_u16_le(0);
    s.put_u16_le(1); // allow resize
    s.put_u16_le(u16::from(caps.bitmap_compression));
    s.put_u16_le(0);
    s.put_u16_le(1);
    s.put_u16_le(0);
}

fn put_order_caps(s: &mut Stream, caps: &Capabilities) {
    use crate::orders::state::{
        DESKSAVE, DESTBLT, ELLIPSE, ELLIPSE2, LINE, MEMBLT, PATBLT, POLYGON, POLYGON2, POLYLINE,
        RECT, SCREENBLT, TEXT2, TRIBLT,
    };

    let mut support = [0u8; 32];
    for t in [DESTBLT, PATBLT, SCREENBLT, LINE, 8, RECT, POLYLINE, TEXT2] {
        support[usize::from(t)] = 1;
    }
    support[3] = u8::from(caps.bitmap_cache);
    support[usize::from(MEMBLT)] = u8::from(caps.bitmap_cache);
    support[usize::from(TRIBLT)] = u8::from(caps.bitmap_cache);
    support[usize::from(DESKSAVE)] = u8::from(caps.desktop_save);
    for t in [POLYGON, POLYGON2, ELLIPSE, ELLIPSE2] {
        support[usize::from(t)] = u8::from(caps.polygon_ellipse);
    }

    capset(s, CAPSET_ORDER, CAPLEN_ORDER);
    s.put_fill(0, 20); // terminal descriptor, pad
    s.put_u16_le(1); // x granularity
    s.put_u16_le(20); // y granularity
    s.put_u16_le(0);
    s.put_u16_le(1); // max order level
    s.put_u16_le(0x147); // number of fonts
    s.put_u16_le(0x2a); // order flags
    s.put_slice(&support);
    s.put_u16_le(0x6a1); // text flags
    s.put_fill(0, 6);
    s.put_u32_le(if caps.desktop_save { 0x38400 } else { 0 });
    s.put_u32_le(0);
    s.put_u32_le(0x4e4);
}

fn put_bmpcache_caps(s: &mut Stream, caps: &Capabilities) {
    let bpp = caps.bytes_per_pixel();
    capset(s, CAPSET_BMPCACHE, CAPLEN_BMPCACHE);
    s.put_fill(0, 24);
    s.put_u16_le(0x258);
    s.put_u16_le(0x100 * bpp);
    s.put_u16_le(0x12c);
    s.put_u16_le(0x400 * bpp);
    s.put_u16_le(0x106);
    s.put_u16_le(0x1000 * bpp);
}

fn put_bmpcache2_caps(s: &mut Stream, caps: &Capabilities) {
    capset(s, CAPSET_BMPCACHE2, CAPLEN_BMPCACHE2);
    s.put_u16_le(if caps.persistent_cache { 2 } else { 0 });
    s.put_u16_be(3); // caches in this set
    s.put_u32_le(BMPCACHE2_CELLS[0]);
    s.put_u32_le(BMPCACHE2_CELLS[1]);
    if caps.persistent_cache {
        s.put_u32_le(MAX_PERSISTENT_CELLS as u32 | BMPCACHE2_FLAG_PERSIST);
    } else {
        s.put_u32_le(BMPCACHE2_CELLS[2]);
    }
    s.put_fill(0, 20);
}

fn put_colcache_caps(s: &mut Stream) {
    capset(s, CAPSET_COLCACHE, CAPLEN_COLCACHE);
    s.put_u16_le(6); // cache size
    s.put_u16_le(0);
}

fn put_activate_caps(s: &mut Stream) {
    capset(s, CAPSET_ACTIVATE, CAPLEN_ACTIVATE);
    s.put_fill(0, 8);
}

fn put_control_caps(s: &mut Stream) {
    capset(s, CAPSET_CONTROL, CAPLEN_CONTROL);
    s.put_u16_le(0); // control caps
    s.put_u16_le(0); // remote detach
    s.put_u16_le(2); // control interest: never
    s.put_u16_le(2); // detach interest: never
}

fn put_pointer_caps(s: &mut Stream) {
    capset(s, CAPSET_POINTER, CAPLEN_POINTER);
    s.put_u16_le(1); // colour pointers
    s.put_u16_le(20); // cache size
}

fn put_share_caps(s: &mut Stream) {
    capset(s, CAPSET_SHARE, CAPLEN_SHARE);
    s.put_u16_le(0);
    s.put_u16_le(0);
}

// ── Finalisation and input ───────────────────────────────────────

pub fn put_synchronise(s: &mut Stream) {
    s.put_u16_le(1); // message type
    s.put_u16_le(1002); // target user
}

pub fn put_control(s: &mut Stream, action: u16) {
    s.put_u16_le(action);
    s.put_u16_le(0); // grant id
    s.put_u32_le(0); // control id
}

/// Font list; RDP 4 sends sequence 1 then 2, RDP 5 sends 3 alone.
pub fn put_font_list(s: &mut Stream, seq: u16) {
    s.put_u16_le(0); // fonts
    s.put_u16_le(0);
    s.put_u16_le(seq);
    s.put_u16_le(0x32); // entry size
}

/// One persistent key list PDU for cache id 2.
pub fn put_persistent_keys(s: &mut Stream, keys: &[HashKey], total: usize, first: bool, last: bool) {
    s.put_u16_le(0);
    s.put_u16_le(0);
    s.put_u16_le(keys.len() as u16);
    s.put_u16_le(0);
    s.put_u16_le(0);
    s.put_u16_le(0);
    s.put_u16_le(0);
    s.put_u16_le(total as u16);
    s.put_u16_le(0);
    s.put_u16_le(0);
    let mut flags = 0u32;
    if first {
        flags |= 1;
    }
    if last {
        flags |= 2;
    }
    s.put_u32_le(flags);
    for key in keys {
        s.put_slice(key);
    }
}

pub fn put_input(s: &mut Stream, time: u32, event: &InputEvent) {
    s.put_u16_le(1); // events
    s.put_u16_le(0);
    event.encode(time, s);
}

// ── Inbound ──────────────────────────────────────────────────────

/// One share PDU out of a (possibly concatenated) slow-path payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharePdu<'a> {
    pub pdu_type: u16,
    /// Bytes after the share control header.
    pub body: &'a [u8],
}

/// Split `data` into its share PDUs, skipping flow-control PDUs.
pub fn split_share_pdus(data: &[u8]) -> Result<Vec<SharePdu<'_>>> {
    let mut out = Vec::new();
    let mut s = ReadStream::new(data);
    while s.remaining() >= 2 {
        let mut head = ReadStream::new(s.rest());
        let length = head.u16_le()?;
        if length == FLOW_MARKER {
            s.skip(FLOW_PDU_LEN.min(s.remaining()))?;
            continue;
        }
        let length = usize::from(length);
        if length < SHARE_CONTROL_LEN {
            return Err(RdcError::malformed("share control length"));
        }
        let mut pdu = s.sub(length.min(s.remaining()))?;
        pdu.skip(2)?;
        let pdu_type = pdu.u16_le()? & 0x0f;
        pdu.skip(2)?; // originator
        out.push(SharePdu {
            pdu_type,
            body: pdu.rest(),
        });
    }
    Ok(out)
}

/// Server parameters from a demand active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemandActive {
    pub share_id: u32,
    /// General capability extra flags; zero means no RDP 5 support.
    pub extra_flags: Option<u16>,
    pub colour_depth: Option<u16>,
    pub size: Option<(u16, u16)>,
}

impl DemandActive {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut s = ReadStream::new(body);
        let share_id = s.u32_le()?;
        let source_len = usize::from(s.u16_le()?);
        let caps_len = usize::from(s.u16_le()?);
        s.skip(source_len)?;
        let mut caps = s.sub(caps_len.min(s.remaining()))?;

        let mut out = Self {
            share_id,
            ..Default::default()
        };
        let count = caps.u16_le()?;
        caps.skip(2)?;
        for _ in 0..count {
            if caps.remaining() < 4 {
                break;
            }
            let kind = caps.u16_le()?;
            let len = usize::from(caps.u16_le()?);
            let mut set = caps.sub(len.saturating_sub(4).min(caps.remaining()))?;
            match kind {
                CAPSET_GENERAL => {
                    set.skip(10)?;
                    out.extra_flags = Some(set.u16_le()?);
                }
                CAPSET_BITMAP => {
                    let depth = set.u16_le()?;
                    set.skip(6)?;
                    let width = set.u16_le()?;
                    let height = set.u16_le()?;
                    out.colour_depth = Some(depth);
                    out.size = Some((width, height));
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Header of a share data PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub data_type: u8,
    pub compression: CompressionFlags,
    /// Compressed payload length, header excluded.
    pub compressed_len: usize,
}

impl DataHeader {
    pub fn parse(s: &mut ReadStream<'_>) -> Result<Self> {
        s.skip(6)?; // share id, pad, stream id
        s.skip(2)?; // uncompressed length
        let data_type = s.u8()?;
        let compression = CompressionFlags::from_bits_retain(s.u8()?);
        let compressed_len = usize::from(s.u16_le()?).saturating_sub(SHARE_DATA_LEN);
        Ok(Self {
            data_type,
            compression,
            compressed_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> ShareIds {
        ShareIds {
            user_id: 6,
            share_id: 0x0001_03ea,
        }
    }

    #[test]
    fn data_header_lengths() {
        let mut s = Stream::with_capacity(32);
        init_data(&mut s);
        put_synchronise(&mut s);
        finish_data(&mut s, ids(), DATA_SYNCHRONISE).unwrap();
        let b = s.as_slice();
        assert_eq!(b.len(), SHARE_DATA_LEN + 4);
        assert_eq!(u16::from_le_bytes([b[0], b[1]]), 22);
        assert_eq!(u16::from_le_bytes([b[2], b[3]]), 0x17);
        assert_eq!(u16::from_le_bytes([b[4], b[5]]), 1007);
        assert_eq!(u16::from_le_bytes([b[12], b[13]]), 8);
        assert_eq!(b[14], DATA_SYNCHRONISE);
    }

    #[test]
    fn confirm_active_matches_declared_lengths() {
        let cfg = SessionConfig::default();
        let mut s = Stream::with_capacity(512);
        init_control(&mut s);
        put_confirm_active(&mut s, ids(), &Capabilities::from_config(&cfg, true));
        finish_control(&mut s, ids(), PDU_CONFIRM_ACTIVE).unwrap();
        let b = s.as_slice();
        let caps_len = u16::from_le_bytes([b[14], b[15]]) as usize;
        // control header, share id, originator, two lengths, source, count, pad
        let fixed = 6 + 4 + 2 + 2 + 2 + SOURCE_DESCRIPTOR.len();
        assert_eq!(b.len(), fixed + caps_len);
        assert_eq!(u16::from_le_bytes([b[0], b[1]]) as usize, b.len());

        let parsed = split_share_pdus(b).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].pdu_type, PDU_CONFIRM_ACTIVE);
    }

    #[test]
    fn demand_active_reads_general_and_bitmap_sets() {
        let mut s = Stream::with_capacity(128);
        s.put_u32_le(0x1234);
        s.put_u16_le(4);
        let caps_len_at = s.len();
        s.put_u16_le(0);
        s.put_slice(b"RDP\0");
        let caps_start = s.len();
        s.put_u16_le(2);
        s.put_u16_le(0);
        put_general_caps(
            &mut s,
            &Capabilities::from_config(&SessionConfig::default(), false),
        );
        put_bitmap_caps(
            &mut s,
            &Capabilities {
                colour_depth: 24,
                width: 1280,
                height: 1024,
                ..Capabilities::from_config(&SessionConfig::default(), false)
            },
        );
        let caps_len = (s.len() - caps_start) as u16;
        s.as_mut_slice()[caps_len_at..caps_len_at + 2].copy_from_slice(&caps_len.to_le_bytes());

        let da = DemandActive::parse(s.as_slice()).unwrap();
        assert_eq!(da.share_id, 0x1234);
        assert_eq!(da.extra_flags, Some(RDP5_EXTRA_FLAGS));
        assert_eq!(da.colour_depth, Some(24));
        assert_eq!(da.size, Some((1280, 1024)));
    }

    #[test]
    fn logon_layouts() {
        let cfg = SessionConfig {
            username: "bob".into(),
            password: "pw".into(),
            ..Default::default()
        };
        let mut short = Stream::with_capacity(64);
        put_logon_info(&mut short, &cfg, false, "10.0.0.1");
        // code page, flags, five lengths, five terminated strings
        assert_eq!(short.len(), 8 + 10 + 2 + 8 + 6 + 2 + 2);
        let flags = u32::from_le_bytes(short.as_slice()[4..8].try_into().unwrap());
        assert!(LogonFlags::from_bits_retain(flags).contains(LogonFlags::AUTOLOGON));

        let mut long = Stream::with_capacity(512);
        put_logon_info(&mut long, &cfg, true, "10.0.0.1");
        let tail = &long.as_slice()[long.len() - 6..];
        assert_eq!(&tail[..4], &cfg.performance_flags.bits().to_le_bytes());
    }

    #[test]
    fn concatenated_and_flow_pdus() {
        let mut data = vec![0x00, 0x80, 0x41, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[8, 0, 0x17, 0, 0xef, 0x03, 0xaa, 0xbb]);
        data.extend_from_slice(&[6, 0, 0x16, 0, 0xea, 0x03]);
        let pdus = split_share_pdus(&data).unwrap();
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[0], SharePdu { pdu_type: PDU_DATA, body: &[0xaa, 0xbb] });
        assert_eq!(pdus[1].pdu_type, PDU_DEACTIVATE);
        assert!(split_share_pdus(&[3, 0, 1, 0]).is_err());
    }

    #[test]
    fn persistent_key_list_layout() {
        let mut s = Stream::with_capacity(64);
        put_persistent_keys(&mut s, &[[1; 8], [2; 8]], 2, true, true);
        let b = s.as_slice();
        assert_eq!(b.len(), 24 + 16);
        assert_eq!(&b[4..6], &[2, 0]);
        assert_eq!(&b[14..16], &[2, 0]);
        assert_eq!(b[20], 3);
    }
}
