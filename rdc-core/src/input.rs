//! Client input events and their wire encoding.
//!
//! Events can be queued from any task through an [`InputSender`]; the
//! session's main loop drains the queue between received PDUs.

use tokio::sync::mpsc;

use crate::error::{RdcError, Result};
use crate::flags::{KeyFlags, MouseFlags};
use crate::stream::Stream;

const INPUT_SYNCHRONIZE: u16 = 0;
const INPUT_SCANCODE: u16 = 4;
const INPUT_UNICODE: u16 = 5;
const INPUT_MOUSE: u16 = 0x8001;

/// Wheel rotation magnitude of one notch.
const WHEEL_NOTCH: u16 = 0x80;

/// Encoded size of one event.
pub const EVENT_SIZE: usize = 12;

// ── Events ───────────────────────────────────────────────────────

/// Mouse button identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn flag(self) -> MouseFlags {
        match self {
            Self::Left => MouseFlags::BUTTON1,
            Self::Right => MouseFlags::BUTTON2,
            Self::Middle => MouseFlags::BUTTON3,
        }
    }
}

/// One input event sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Lock-key toggle state (scroll 1, num 2, caps 4).
    Synchronize { toggles: u16 },
    Scancode { code: u16, flags: KeyFlags },
    Unicode { code: u16, release: bool },
    Mouse { x: u16, y: u16, flags: MouseFlags },
}

impl InputEvent {
    pub fn move_to(x: u16, y: u16) -> Self {
        Self::Mouse {
            x,
            y,
            flags: MouseFlags::MOVE,
        }
    }

    pub fn press(x: u16, y: u16, button: MouseButton) -> Self {
        Self::Mouse {
            x,
            y,
            flags: button.flag() | MouseFlags::DOWN,
        }
    }

    pub fn release(x: u16, y: u16, button: MouseButton) -> Self {
        Self::Mouse {
            x,
            y,
            flags: button.flag(),
        }
    }

    /// One wheel notch; positive `delta` scrolls up.
    pub fn scroll(x: u16, y: u16, delta: i16) -> Self {
        let mut flags = MouseFlags::WHEEL | MouseFlags::from_bits_retain(WHEEL_NOTCH);
        if delta < 0 {
            flags |= MouseFlags::WHEEL_NEGATIVE;
        }
        Self::Mouse { x, y, flags }
    }

    pub fn key_press(code: u16, extended: bool) -> Self {
        let mut flags = KeyFlags::DOWN;
        flags.set(KeyFlags::EXTENDED, extended);
        Self::Scancode { code, flags }
    }

    pub fn key_release(code: u16, extended: bool) -> Self {
        let mut flags = KeyFlags::RELEASE;
        flags.set(KeyFlags::EXTENDED, extended);
        Self::Scancode { code, flags }
    }

    /// `(message type, device flags, param1, param2)`.
    fn fields(&self) -> (u16, u16, u16, u16) {
        match *self {
            Self::Synchronize { toggles } => (INPUT_SYNCHRONIZE, toggles, 0, 0),
            Self::Scancode { code, flags } => (INPUT_SCANCODE, flags.bits(), code, 0),
            Self::Unicode { code, release } => {
                let flags = if release { KeyFlags::RELEASE.bits() } else { 0 };
                (INPUT_UNICODE, flags, code, 0)
            }
            Self::Mouse { x, y, flags } => (INPUT_MOUSE, flags.bits(), x, y),
        }
    }

    /// Append the event record stamped with `time`.
    pub fn encode(&self, time: u32, out: &mut Stream) {
        let (kind, flags, p1, p2) = self.fields();
        out.put_u32_le(time);
        out.put_u16_le(kind);
        out.put_u16_le(flags);
        out.put_u16_le(p1);
        out.put_u16_le(p2);
    }
}

// ── InputSender ──────────────────────────────────────────────────

/// Cloneable handle for queueing input into a running session.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<InputEvent>,
}

impl InputSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fails with `Closed` once the session has ended.
    pub fn send(&self, event: InputEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| RdcError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_event_layout() {
        let mut s = Stream::with_capacity(16);
        InputEvent::press(0x10, 0x20, MouseButton::Left).encode(7, &mut s);
        assert_eq!(
            s.as_slice(),
            &[7, 0, 0, 0, 0x01, 0x80, 0x00, 0x90, 0x10, 0, 0x20, 0]
        );
        assert_eq!(s.len(), EVENT_SIZE);
    }

    #[test]
    fn wheel_direction_flags() {
        let InputEvent::Mouse { flags, .. } = InputEvent::scroll(0, 0, 1) else {
            unreachable!()
        };
        assert_eq!(flags.bits(), 0x0280);
        let InputEvent::Mouse { flags, .. } = InputEvent::scroll(0, 0, -1) else {
            unreachable!()
        };
        assert_eq!(flags.bits(), 0x0380);
    }

    #[test]
    fn extended_key_release() {
        let ev = InputEvent::key_release(0x48, true);
        assert_eq!(ev.fields(), (INPUT_SCANCODE, 0x8100, 0x48, 0));
    }

    #[tokio::test]
    async fn sender_reports_closed_session() {
        let (tx, mut rx) = InputSender::channel();
        tx.send(InputEvent::move_to(1, 2)).unwrap();
        assert_eq!(rx.recv().await, Some(InputEvent::move_to(1, 2)));
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.send(InputEvent::move_to(0, 0)),
            Err(RdcError::Closed)
        ));
    }
}
