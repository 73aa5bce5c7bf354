//! Bit-flag sets carried on the wire or in configuration.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags of the 32-bit security header preceding each secure PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SecurityFlags: u32 {
        const CLIENT_RANDOM = 0x0001;
        const ENCRYPT = 0x0008;
        const LOGON_INFO = 0x0040;
        const LICENCE_NEG = 0x0080;
        const REDIRECT_ENCRYPT = 0x0C00;
    }
}

bitflags! {
    /// Option flags declared for a virtual channel at registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChannelOptions: u32 {
        const INITIALIZED = 0x8000_0000;
        const ENCRYPT_RDP = 0x4000_0000;
        const COMPRESS_RDP = 0x0080_0000;
        const SHOW_PROTOCOL = 0x0020_0000;
    }
}

bitflags! {
    /// Per-chunk flags of virtual channel traffic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChunkFlags: u32 {
        const FIRST = 0x01;
        const LAST = 0x02;
        const SHOW_PROTOCOL = 0x10;
    }
}

bitflags! {
    /// Control byte preceding each drawing order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OrderControl: u8 {
        const STANDARD = 0x01;
        const SECONDARY = 0x02;
        const BOUNDS = 0x04;
        const CHANGE = 0x08;
        const DELTA = 0x10;
        const LASTBOUNDS = 0x20;
        const SMALL = 0x40;
        const TINY = 0x80;
    }
}

bitflags! {
    /// Visual-experience toggles sent in the extended logon info.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PerformanceFlags: u32 {
        const DISABLE_WALLPAPER = 0x01;
        const DISABLE_FULLWINDOWDRAG = 0x02;
        const DISABLE_MENUANIMATIONS = 0x04;
        const DISABLE_THEMING = 0x08;
        const DISABLE_CURSOR_SHADOW = 0x20;
        const DISABLE_CURSORSETTINGS = 0x40;
    }
}

impl Default for PerformanceFlags {
    fn default() -> Self {
        Self::DISABLE_WALLPAPER | Self::DISABLE_FULLWINDOWDRAG | Self::DISABLE_MENUANIMATIONS
    }
}

bitflags! {
    /// Flags of the client info PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LogonFlags: u32 {
        const MOUSE = 0x0001;
        const DISABLE_CTRL_ALT_DEL = 0x0002;
        const AUTOLOGON = 0x0008;
        const UNICODE = 0x0010;
        const MAXIMIZE_SHELL = 0x0020;
        const COMPRESSION = 0x0080;
        const ENABLE_WINDOWS_KEY = 0x0100;
        const COMPRESSION_TYPE_64K = 0x0200;
    }
}

bitflags! {
    /// Bulk compression flags carried with compressed payloads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompressionFlags: u8 {
        const BIG = 0x01;
        const COMPRESSED = 0x20;
        const RESET = 0x40;
        const FLUSH = 0x80;
    }
}

bitflags! {
    /// Mouse event flags of the input PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MouseFlags: u16 {
        const MOVE = 0x0800;
        const DOWN = 0x8000;
        const BUTTON1 = 0x1000;
        const BUTTON2 = 0x2000;
        const BUTTON3 = 0x4000;
        const WHEEL = 0x0200;
        const WHEEL_NEGATIVE = 0x0100;
    }
}

bitflags! {
    /// Keyboard event flags of the input PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyFlags: u16 {
        const EXTENDED = 0x0100;
        const DOWN = 0x4000;
        const RELEASE = 0x8000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_dropped_on_truncate() {
        let f = OrderControl::from_bits_truncate(0x09);
        assert!(f.contains(OrderControl::STANDARD | OrderControl::CHANGE));
        let c = CompressionFlags::from_bits_truncate(0x2f);
        assert!(c.contains(CompressionFlags::COMPRESSED));
        assert!(!c.contains(CompressionFlags::RESET));
    }

    #[test]
    fn default_performance_flags() {
        assert_eq!(PerformanceFlags::default().bits(), 0x07);
    }
}
