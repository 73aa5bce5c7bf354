//! Session configuration.
//!
//! Every option maps onto either a handshake capability or a local
//! feature toggle. The structure is read once when a session starts;
//! nothing here is mutated while a session runs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RdcError, Result};
use crate::flags::PerformanceFlags;

/// Default RDP TCP port.
pub const DEFAULT_PORT: u16 = 3389;

/// Number of encrypt/decrypt operations after which a key is rotated.
pub const DEFAULT_REKEY_THRESHOLD: u32 = 4096;

// ── SessionConfig ────────────────────────────────────────────────

/// Everything a session needs to know before it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote host name or address.
    pub host: String,
    pub port: u16,

    pub username: String,
    pub domain: String,
    pub password: String,
    /// Name this client announces to the server (at most 15 chars).
    pub client_hostname: String,
    /// Program started instead of the shell, if any.
    pub startup_command: String,
    pub working_directory: String,

    /// Desktop width; rounded up to a multiple of 4 on the wire.
    pub width: u16,
    pub height: u16,
    /// 8, 15, 16, 24 or 32.
    pub colour_depth: u8,

    pub keyboard_layout: u32,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub keyboard_function_keys: u32,

    /// Attach to the console session.
    pub console_session: bool,
    /// Negotiate RDP 5 features (extended logon, fast-path, rev2 caches).
    pub rdp5: bool,
    pub encryption: bool,
    /// Accept RLE-compressed bitmap updates.
    pub bitmap_compression: bool,
    /// Accept bulk (MPPC) compressed PDUs.
    pub bulk_compression: bool,

    pub bitmap_cache: bool,
    pub bitmap_cache_persist: bool,
    pub bitmap_cache_precache: bool,
    /// Directory holding the persistent bitmap cache files.
    pub persistent_cache_dir: Option<PathBuf>,
    /// Directory licences are kept in; kept in memory when unset.
    pub licence_dir: Option<PathBuf>,

    pub desktop_save: bool,
    pub polygon_ellipse_orders: bool,
    pub performance_flags: PerformanceFlags,

    /// Deadline for each blocking step of the handshake, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Cipher uses before a key is re-derived.
    pub rekey_threshold: u32,
    pub order_policy: OrderPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: String::new(),
            domain: String::new(),
            password: String::new(),
            client_hostname: "rdc".into(),
            startup_command: String::new(),
            working_directory: String::new(),
            width: 1024,
            height: 768,
            colour_depth: 16,
            keyboard_layout: 0x409,
            keyboard_type: 4,
            keyboard_subtype: 0,
            keyboard_function_keys: 12,
            console_session: false,
            rdp5: true,
            encryption: true,
            bitmap_compression: true,
            bulk_compression: false,
            bitmap_cache: true,
            bitmap_cache_persist: false,
            bitmap_cache_precache: false,
            persistent_cache_dir: None,
            licence_dir: None,
            desktop_save: true,
            polygon_ellipse_orders: true,
            performance_flags: PerformanceFlags::default(),
            connect_timeout_ms: 10_000,
            rekey_threshold: DEFAULT_REKEY_THRESHOLD,
            order_policy: OrderPolicy::Strict,
        }
    }
}

impl SessionConfig {
    /// Reject option combinations the protocol cannot express.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.colour_depth, 8 | 15 | 16 | 24 | 32) {
            return Err(RdcError::Config(format!(
                "unsupported colour depth {}",
                self.colour_depth
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(RdcError::Config("desktop size must be non-zero".into()));
        }
        if self.rekey_threshold == 0 {
            return Err(RdcError::Config("rekey threshold must be non-zero".into()));
        }
        if self.bitmap_cache_persist && self.persistent_cache_dir.is_none() {
            return Err(RdcError::Config(
                "persistent bitmap cache needs a cache directory".into(),
            ));
        }
        Ok(())
    }

    /// Width as announced on the wire.
    pub fn wire_width(&self) -> u16 {
        (self.width.saturating_add(3)) & !3
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bytes per pixel of the negotiated colour depth.
    pub fn bytes_per_pixel(&self) -> usize {
        (usize::from(self.colour_depth) + 7) / 8
    }

    /// The persistent cache is usable only when all three toggles agree.
    pub fn persistent_cache_enabled(&self) -> bool {
        self.bitmap_cache && self.bitmap_cache_persist && self.rdp5
    }
}

// ── OrderPolicy ──────────────────────────────────────────────────

/// What the order decoder does with a primary order type it does not
/// know.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OrderPolicy {
    /// Abort the session.
    #[default]
    Strict,
    /// Skip orders whose type has a declared length; abort on others.
    Lenient { skip: Vec<SkipRule> },
}

/// Declared body length of an order type the decoder cannot parse.
///
/// `length` counts every byte following the order type byte, present
/// field mask included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRule {
    pub order_type: u8,
    pub length: u16,
}

impl OrderPolicy {
    /// The number of bytes to skip for `order_type`, if the policy allows
    /// skipping it.
    pub fn skip_length(&self, order_type: u8) -> Option<usize> {
        match self {
            Self::Strict => None,
            Self::Lenient { skip } => skip
                .iter()
                .find(|r| r.order_type == order_type)
                .map(|r| usize::from(r.length)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
