//! # rdc-core
//!
//! Protocol engine of a remote desktop client (RDP 4/5, standard
//! security).
//!
//! This crate contains:
//! - **Session**: `Session`, the layered connection state machine that
//!   connects, runs the receive loop and disconnects
//! - **Layers**: X.224, MCS, security and licensing, share PDUs, virtual
//!   channels (`session::*`)
//! - **Codecs**: `TpktCodec` for framed I/O via `tokio_util`, the `Mppc`
//!   bulk decompressor and the RLE bitmap codec
//! - **Caches**: bitmap (volatile and persistent), glyph, text, cursor,
//!   brush and colour table caches
//! - **Orders**: `OrderDecoder`, the stateful drawing-order decoder
//! - **Presenter**: the `Presenter` trait decoded output is delivered to
//! - **Error**: `RdcError`, mapped onto the user-facing `ConnectionError`

pub mod bitmap;
pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flags;
pub mod input;
pub mod mppc;
pub mod network;
pub mod orders;
pub mod presenter;
pub mod session;
pub mod state;
pub mod stream;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bitmap::{Bitmap, Colour, Cursor, Glyph, Palette};
pub use cache::{CacheSet, HashKey, PersistentCache};
pub use codec::{Frame, TpktCodec};
pub use config::{OrderPolicy, SessionConfig, SkipRule};
pub use error::{ConnectionError, RdcError, Result};
pub use flags::{ChannelOptions, KeyFlags, MouseFlags, PerformanceFlags};
pub use input::{InputEvent, InputSender, MouseButton};
pub use mppc::Mppc;
pub use network::{AsyncStream, Transport};
pub use orders::OrderDecoder;
pub use presenter::{DrawOp, Point, PointerUpdate, Presenter, Rect, RecordingPresenter};
pub use session::channels::{ChannelHandler, ChannelOutbox};
pub use session::licence::{FileLicenceStore, LicenceStore, MemoryLicenceStore};
pub use session::{Session, SessionStats};
pub use state::ConnectionState;
