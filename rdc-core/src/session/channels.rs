//! Static virtual channels.
//!
//! Channels are registered on the [`Session`](super::Session) before it
//! connects. The MCS connect instantiates one [`OpenChannel`] per
//! registration with the id the server assigned; the open set is dropped
//! again on disconnect while registrations survive for a reconnect.
//!
//! Messages larger than [`CHUNK_SIZE`] travel as a sequence of chunks,
//! each prefixed by the total message length and [`ChunkFlags`].

use tracing::{debug, warn};

use crate::error::{RdcError, Result};
use crate::flags::{ChannelOptions, ChunkFlags};
use crate::stream::ReadStream;

/// Largest payload carried by one chunk.
pub const CHUNK_SIZE: usize = 1600;

/// Bytes of the per-chunk header (total length, flags).
pub const CHUNK_HEADER_LEN: usize = 8;

/// Channel names are at most seven characters plus a terminator.
pub const MAX_NAME_LEN: usize = 7;

/// Static channels a client may request.
pub const MAX_CHANNELS: usize = 31;

// ── Handler ──────────────────────────────────────────────────────

/// Messages a handler queues for transmission on its own channel.
#[derive(Debug, Default)]
pub struct ChannelOutbox {
    messages: Vec<Vec<u8>>,
}

impl ChannelOutbox {
    pub fn send(&mut self, message: impl Into<Vec<u8>>) {
        self.messages.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.messages.drain(..)
    }
}

/// Receives the traffic of one virtual channel.
///
/// Called from the session's receive loop; implementations must return
/// promptly.
pub trait ChannelHandler: Send {
    /// The channel was joined and the session is about to go active.
    fn on_connected(&mut self, _outbox: &mut ChannelOutbox) {}

    /// A complete, reassembled message arrived.
    fn on_message(&mut self, message: &[u8], outbox: &mut ChannelOutbox);

    /// The session ended; the channel is gone.
    fn on_disconnected(&mut self) {}
}

// ── Registration ─────────────────────────────────────────────────

/// Name and options announced for a channel in the connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegistration {
    pub name: String,
    pub options: ChannelOptions,
}

impl ChannelRegistration {
    pub fn new(name: impl Into<String>, options: ChannelOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN || !self.name.is_ascii() {
            return Err(RdcError::Config(format!(
                "channel name {:?} must be 1 to {MAX_NAME_LEN} ASCII characters",
                self.name
            )));
        }
        Ok(())
    }
}

/// A joined channel.
#[derive(Debug)]
pub struct OpenChannel {
    pub id: u16,
    index: usize,
    reassembly: Option<Vec<u8>>,
    expected: usize,
}

// ── ChannelTable ─────────────────────────────────────────────────

/// Registered channels and, while connected, their open instances.
#[derive(Default)]
pub struct ChannelTable {
    registrations: Vec<ChannelRegistration>,
    handlers: Vec<Box<dyn ChannelHandler>>,
    open: Vec<OpenChannel>,
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTable")
            .field("registrations", &self.registrations)
            .field("open", &self.open)
            .finish()
    }
}

impl ChannelTable {
    pub fn register(
        &mut self,
        registration: ChannelRegistration,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<()> {
        registration.validate()?;
        if self.registrations.len() >= MAX_CHANNELS {
            return Err(RdcError::Config("too many virtual channels".into()));
        }
        if self
            .registrations
            .iter()
            .any(|r| r.name.eq_ignore_ascii_case(&registration.name))
        {
            return Err(RdcError::Config(format!(
                "channel {} registered twice",
                registration.name
            )));
        }
        self.registrations.push(registration);
        self.handlers.push(handler);
        Ok(())
    }

    pub fn registrations(&self) -> &[ChannelRegistration] {
        &self.registrations
    }

    /// Create the open set, `id_of(i)` giving the id of registration `i`.
    pub fn instantiate(&mut self, id_of: impl Fn(usize) -> u16) {
        self.open = (0..self.registrations.len())
            .map(|index| OpenChannel {
                id: id_of(index),
                index,
                reassembly: None,
                expected: 0,
            })
            .collect();
        for ch in &self.open {
            debug!(
                name = %self.registrations[ch.index].name,
                id = ch.id,
                "channel instantiated"
            );
        }
    }

    pub fn open_ids(&self) -> Vec<u16> {
        self.open.iter().map(|c| c.id).collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, id: u16) -> bool {
        self.open.iter().any(|c| c.id == id)
    }

    /// Options of the open channel `id`.
    pub fn options(&self, id: u16) -> Option<ChannelOptions> {
        self.open
            .iter()
            .find(|c| c.id == id)
            .map(|c| self.registrations[c.index].options)
    }

    /// Open channel id for `name`.
    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.open
            .iter()
            .find(|c| self.registrations[c.index].name.eq_ignore_ascii_case(name))
            .map(|c| c.id)
    }

    /// Tell every open channel the session is up. Returns the messages
    /// their handlers queued, per channel id.
    pub fn connected(&mut self) -> Vec<(u16, ChannelOutbox)> {
        let mut out = Vec::new();
        for ch in &self.open {
            let mut outbox = ChannelOutbox::default();
            self.handlers[ch.index].on_connected(&mut outbox);
            if !outbox.is_empty() {
                out.push((ch.id, outbox));
            }
        }
        out
    }

    /// Feed one received chunk of channel `id`.
    ///
    /// Returns the handler's queued replies once a message completes.
    pub fn receive(&mut self, id: u16, data: &[u8]) -> Result<Option<ChannelOutbox>> {
        let Some(ch) = self.open.iter_mut().find(|c| c.id == id) else {
            warn!(id, "data for unknown channel");
            return Ok(None);
        };
        let mut s = ReadStream::new(data);
        let total = s.u32_le()? as usize;
        let flags = ChunkFlags::from_bits_truncate(s.u32_le()?);
        let chunk = s.rest();

        let handler = &mut self.handlers[ch.index];
        let mut outbox = ChannelOutbox::default();

        if flags.contains(ChunkFlags::FIRST | ChunkFlags::LAST) {
            ch.reassembly = None;
            handler.on_message(chunk, &mut outbox);
            return Ok(Some(outbox));
        }
        if flags.contains(ChunkFlags::FIRST) {
            ch.reassembly = Some(Vec::with_capacity(total.min(CHUNK_SIZE * 16)));
            ch.expected = total;
        }
        let buf = ch
            .reassembly
            .as_mut()
            .ok_or(RdcError::malformed("channel chunk without first"))?;
        if buf.len() + chunk.len() > ch.expected {
            return Err(RdcError::malformed("channel chunk overflows message"));
        }
        buf.extend_from_slice(chunk);
        if !flags.contains(ChunkFlags::LAST) {
            return Ok(None);
        }
        let message = ch.reassembly.take().unwrap_or_default();
        handler.on_message(&message, &mut outbox);
        Ok(Some(outbox))
    }

    /// Drop the open set, notifying every handler.
    pub fn disconnect(&mut self) {
        for ch in self.open.drain(..) {
            self.handlers[ch.index].on_disconnected();
        }
    }
}

/// Split `message` into `(flags, chunk)` pieces for transmission.
pub fn chunks(message: &[u8], options: ChannelOptions) -> Vec<(ChunkFlags, &[u8])> {
    let extra = if options.contains(ChannelOptions::SHOW_PROTOCOL) {
        ChunkFlags::SHOW_PROTOCOL
    } else {
        ChunkFlags::empty()
    };
    if message.is_empty() {
        return vec![(ChunkFlags::FIRST | ChunkFlags::LAST | extra, message)];
    }
    let count = message.len().div_ceil(CHUNK_SIZE);
    message
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            let mut flags = extra;
            if i == 0 {
                flags |= ChunkFlags::FIRST;
            }
            if i + 1 == count {
                flags |= ChunkFlags::LAST;
            }
            (flags, chunk)
        })
        .collect()
}
