//! The session: one connection to one host.
//!
//! [`Session`] owns every piece of per-connection state (channel table,
//! cipher keys, caches, order state) and drives the layers in
//! [`iso`], [`mcs`], [`secure`], [`licence`] and [`rdp`] through the
//! handshake. Once active, [`Session::run`] is the receive loop; it
//! returns on disconnect or on the first fatal error.
//!
//! ```text
//!  connect ─► X.224 CR/CC ─► MCS connect/attach/join ─► client random
//!          ─► logon info ─► licensing ─► demand/confirm active ─► Active
//! ```

pub mod channels;
pub mod gcc;
pub mod iso;
pub mod licence;
pub mod mcs;
pub mod rdp;
pub mod secure;
pub mod update;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheSet, PersistentCache};
use crate::codec::{FASTPATH_ENCRYPTED, Frame};
use crate::config::SessionConfig;
use crate::error::{ConnectionError, RdcError, Result};
use crate::flags::{ChannelOptions, SecurityFlags};
use crate::input::{InputEvent, InputSender};
use crate::network::{AsyncStream, Transport};
use crate::presenter::Presenter;
use crate::state::ConnectionState;
use crate::stream::Stream;

use channels::{ChannelHandler, ChannelOutbox, ChannelRegistration, ChannelTable};
use gcc::ServerData;
use iso::Tpdu;
use licence::{FileLicenceStore, LicenceStore, Licensing, MemoryLicenceStore};
use mcs::{DomainPdu, GLOBAL_CHANNEL, USER_CHANNEL_BASE};
use rdp::{Capabilities, DemandActive, ShareIds};
use secure::{CryptInfo, SecureLayer};
use update::{ServerNotice, UpdateDecoder};

/// Bitmap cache id backed by the persistent cache.
const PERSISTENT_CACHE_ID: u8 = 2;

// ── SessionStats ─────────────────────────────────────────────────

/// Counters published while the session runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames received since connect.
    pub frames: u64,
    /// Of which fast-path.
    pub fast_path_frames: u64,
    /// Payload bytes received.
    pub bytes: u64,
    /// Complete virtual channel messages delivered to handlers.
    pub channel_messages: u64,
    /// Times the server (re)activated the share.
    pub activations: u32,
}

/// What the receive loop should do after one frame.
enum Flow {
    Continue,
    Ended,
}

enum Wake {
    Canceled,
    Input(InputEvent),
    Frame(Result<Frame>),
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    state: ConnectionState,
    error: ConnectionError,
    transport: Option<Transport>,
    cancel: CancellationToken,

    channels: ChannelTable,
    server: ServerData,
    secure: SecureLayer,
    licensing: Licensing,
    licence_store: Box<dyn LicenceStore>,
    caches: CacheSet,
    updates: UpdateDecoder,
    ids: ShareIds,

    /// RDP 5 features negotiated with this server.
    rdp5: bool,
    colour_depth: u8,
    desktop: (u16, u16),
    keys_sent: bool,
    disconnect_reason: Option<u32>,

    input_tx: InputSender,
    input_rx: mpsc::UnboundedReceiver<InputEvent>,
    stats_tx: watch::Sender<SessionStats>,
    stats_rx: watch::Receiver<SessionStats>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A disconnected session for `config`.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let licence_store: Box<dyn LicenceStore> = match &config.licence_dir {
            Some(dir) => Box::new(FileLicenceStore::new(dir)),
            None => Box::new(MemoryLicenceStore::default()),
        };
        let (input_tx, input_rx) = InputSender::channel();
        let (stats_tx, stats_rx) = watch::channel(SessionStats::default());
        Ok(Self {
            licensing: Licensing::new(&config.username, &config.client_hostname),
            updates: UpdateDecoder::new(config.order_policy.clone(), !config.rdp5),
            colour_depth: config.colour_depth,
            desktop: (config.wire_width(), config.height),
            rdp5: config.rdp5,
            config,
            state: ConnectionState::Disconnected,
            error: ConnectionError::None,
            transport: None,
            cancel: CancellationToken::new(),
            channels: ChannelTable::default(),
            server: ServerData::default(),
            secure: SecureLayer::new(),
            licence_store,
            caches: CacheSet::default(),
            ids: ShareIds::default(),
            keys_sent: false,
            disconnect_reason: None,
            input_tx,
            input_rx,
            stats_tx,
            stats_rx,
        })
    }

    /// Replace the licence store.
    pub fn with_licence_store(mut self, store: Box<dyn LicenceStore>) -> Self {
        self.licence_store = store;
        self
    }

    /// Register a static virtual channel. Only allowed while
    /// disconnected; registrations survive reconnects.
    pub fn register_channel(
        &mut self,
        name: &str,
        options: ChannelOptions,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<()> {
        if !self.state.is_disconnected() {
            return Err(RdcError::InvalidState(
                "channels must be registered before connecting",
            ));
        }
        self.channels
            .register(ChannelRegistration::new(name, options), handler)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The terminal error of the last connection attempt.
    pub fn error(&self) -> ConnectionError {
        self.error
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cancelling the token aborts whatever the session is blocked on.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A handle for queueing input from another task.
    pub fn input_sender(&self) -> InputSender {
        self.input_tx.clone()
    }

    pub fn stats(&self) -> watch::Receiver<SessionStats> {
        self.stats_rx.clone()
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels.open_count()
    }

    /// Desktop size and colour depth as last confirmed by the server.
    pub fn desktop(&self) -> (u16, u16, u8) {
        (self.desktop.0, self.desktop.1, self.colour_depth)
    }

    /// The reason code of the last disconnect PDU, if the server sent one.
    pub fn disconnect_reason(&self) -> Option<u32> {
        self.disconnect_reason
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Connect over TCP to the configured host and drive the handshake
    /// to `Active`.
    pub async fn connect(&mut self) -> Result<()> {
        self.begin_attempt()?;
        let deadline = self.config.connect_timeout();
        info!(host = %self.config.host, port = self.config.port, "connecting");
        let transport = Transport::connect(
            &self.config.host,
            self.config.port,
            deadline,
            self.cancel.clone(),
        )
        .await;
        match transport {
            Ok(t) => self.handshake_over(t).await,
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Drive the handshake over an already-open stream.
    pub async fn connect_with<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        self.begin_attempt()?;
        let transport =
            Transport::from_stream(stream, self.config.connect_timeout(), self.cancel.clone());
        self.handshake_over(transport).await
    }

    fn begin_attempt(&mut self) -> Result<()> {
        if !self.state.is_disconnected() {
            return Err(RdcError::InvalidState("session is already connected"));
        }
        self.error = ConnectionError::None;
        self.disconnect_reason = None;
        self.keys_sent = false;
        self.stats_tx.send_replace(SessionStats::default());
        Ok(())
    }

    async fn handshake_over(&mut self, transport: Transport) -> Result<()> {
        self.transport = Some(transport);
        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(e).await),
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        // X.224
        self.send(iso::connection_request(&self.config.username)).await?;
        let confirm = self.recv_x224().await?;
        iso::parse_connection_confirm(&confirm)?;
        self.state.transport_connected()?;
        debug!("x224 connection confirmed");

        // MCS
        let user_data = gcc::client_data(&self.config, self.channels.registrations());
        self.send(mcs::connect_initial(&user_data)?).await?;
        let response = self.recv_tpdu().await?;
        self.server = ServerData::parse(mcs::parse_connect_response(&response)?)?;
        self.rdp5 = self.config.rdp5 && !self.server.is_rdp4();
        info!(
            server_version = self.server.rdp_version,
            rdp5 = self.rdp5,
            "mcs connect response"
        );

        self.send(mcs::erect_domain_request()?).await?;
        self.send(mcs::attach_user_request()?).await?;
        let user_id = mcs::parse_attach_user_confirm(&self.recv_tpdu().await?)?;
        self.ids = ShareIds {
            user_id,
            share_id: 0,
        };

        let server = &self.server;
        self.channels.instantiate(|i| server.channel_id(i));
        let mut joins = vec![user_id.wrapping_add(USER_CHANNEL_BASE), GLOBAL_CHANNEL];
        joins.extend(self.channels.open_ids());
        for channel in joins {
            self.send(mcs::channel_join_request(user_id, channel)?)
                .await?;
            mcs::parse_channel_join_confirm(&self.recv_tpdu().await?, channel)?;
            debug!(channel, "channel joined");
        }
        self.state.session_connected()?;

        // Security
        let info = match &self.server.security {
            Some(block) => CryptInfo::parse(block)?,
            None => None,
        };
        if let Some(info) = info.filter(|_| self.config.encryption) {
            let client_random: [u8; crate::crypto::RANDOM_SIZE] = rand::random();
            let encrypted =
                self.secure
                    .establish(&info, &client_random, self.config.rekey_threshold)?;
            let pdu = self.secure.client_random_pdu(&encrypted, user_id)?;
            self.send(pdu).await?;
        }
        self.state.security_established()?;

        // Logon and licensing
        self.caches = self.open_caches();
        self.updates = UpdateDecoder::new(self.config.order_policy.clone(), !self.rdp5);
        self.licensing = Licensing::new(&self.config.username, &self.config.client_hostname);
        self.send_logon_info().await?;
        let first_share = self.negotiate_licence().await?;
        self.state.licensed()?;

        // Capability exchange
        let mut pending = Some(first_share);
        loop {
            let data = match pending.take() {
                Some(d) => d,
                None => self.recv_share().await?,
            };
            let mut activated = false;
            for pdu in rdp::split_share_pdus(&data)? {
                if pdu.pdu_type == rdp::PDU_DEMAND_ACTIVE {
                    self.activate_share(pdu.body).await?;
                    activated = true;
                } else {
                    debug!(pdu_type = pdu.pdu_type, "share PDU before activation ignored");
                }
            }
            if activated {
                break;
            }
        }

        for (id, outbox) in self.channels.connected() {
            self.flush_outbox(id, outbox).await?;
        }
        info!(
            width = self.desktop.0,
            height = self.desktop.1,
            depth = self.colour_depth,
            "session active"
        );
        Ok(())
    }

    fn open_caches(&self) -> CacheSet {
        if !self.config.persistent_cache_enabled() {
            return CacheSet::default();
        }
        let Some(dir) = self.config.persistent_cache_dir.as_deref() else {
            return CacheSet::default();
        };
        let bpp = self.config.bytes_per_pixel() as u8;
        match PersistentCache::open(dir, bpp, &[PERSISTENT_CACHE_ID]) {
            Ok(p) => CacheSet::with_persistent(Some(p)),
            Err(e) => {
                warn!("persistent bitmap cache unavailable: {e}");
                CacheSet::default()
            }
        }
    }

    async fn send_logon_info(&mut self) -> Result<()> {
        let flags = SecurityFlags::LOGON_INFO | self.secure.data_flags();
        let mut s = self.secure.init(flags, 512);
        rdp::put_logon_info(&mut s, &self.config, self.rdp5, "0.0.0.0");
        let pdu = self
            .secure
            .finish(s, flags, self.ids.user_id, GLOBAL_CHANNEL)?;
        self.send(pdu).await
    }

    /// Run the licence exchange. Returns the first non-licensing PDU.
    async fn negotiate_licence(&mut self) -> Result<BytesMut> {
        let data = self.recv_share().await?;
        if !self.licensing.is_complete() {
            debug!("server skipped licensing");
        }
        Ok(data)
    }

    /// Next share payload on the I/O channel with its security header
    /// removed. Licensing PDUs met on the way are answered.
    async fn recv_share(&mut self) -> Result<BytesMut> {
        loop {
            let mut data = self.recv_global().await?;
            let flags = self.secure.unwrap(&mut data)?;
            if !flags.contains(SecurityFlags::LICENCE_NEG) {
                return Ok(data);
            }
            self.licence_pdu(&data).await?;
        }
    }

    async fn licence_pdu(&mut self, data: &[u8]) -> Result<()> {
        let reply = self
            .licensing
            .process(data, self.licence_store.as_mut())?;
        if let Some(body) = reply {
            let flags = SecurityFlags::LICENCE_NEG;
            let mut s = self.secure.init(flags, body.len());
            s.put_slice(&body);
            let pdu = self
                .secure
                .finish(s, flags, self.ids.user_id, GLOBAL_CHANNEL)?;
            self.send(pdu).await?;
        }
        if self.licensing.is_complete() {
            self.secure.set_licence_issued();
        }
        Ok(())
    }

    /// Answer a demand active and run the finalisation sequence.
    async fn activate_share(&mut self, body: &[u8]) -> Result<()> {
        let demand = DemandActive::parse(body)?;
        self.apply_demand(&demand);

        let caps = Capabilities {
            colour_depth: self.colour_depth,
            rdp5: self.rdp5,
            ..Capabilities::from_config(
                &self.config,
                self.caches.is_persistent(PERSISTENT_CACHE_ID),
            )
        };
        let flags = self.secure.data_flags();
        let mut s = self.secure.init(flags, 512);
        rdp::init_control(&mut s);
        rdp::put_confirm_active(&mut s, self.ids, &caps);
        rdp::finish_control(&mut s, self.ids, rdp::PDU_CONFIRM_ACTIVE)?;
        let pdu = self
            .secure
            .finish(s, flags, self.ids.user_id, GLOBAL_CHANNEL)?;
        self.send(pdu).await?;

        self.send_data(rdp::DATA_SYNCHRONISE, rdp::put_synchronise)
            .await?;
        self.send_data(rdp::DATA_CONTROL, |s| {
            rdp::put_control(s, rdp::CTRL_COOPERATE)
        })
        .await?;
        self.send_data(rdp::DATA_CONTROL, |s| {
            rdp::put_control(s, rdp::CTRL_REQUEST_CONTROL)
        })
        .await?;
        self.send_data(rdp::DATA_INPUT, |s| {
            rdp::put_input(s, 0, &InputEvent::Synchronize { toggles: 0 })
        })
        .await?;
        if self.rdp5 && !self.keys_sent {
            self.send_persistent_keys().await?;
        }
        if self.rdp5 {
            self.send_data(rdp::DATA_FONT2, |s| rdp::put_font_list(s, 3))
                .await?;
        } else {
            self.send_data(rdp::DATA_FONT2, |s| rdp::put_font_list(s, 1))
                .await?;
            self.send_data(rdp::DATA_FONT2, |s| rdp::put_font_list(s, 2))
                .await?;
        }

        self.updates.reset();
        self.state.activate()?;
        self.stats_tx.send_modify(|s| s.activations += 1);
        Ok(())
    }

    fn apply_demand(&mut self, demand: &DemandActive) {
        self.ids.share_id = demand.share_id;
        if let Some(depth) = demand.colour_depth.and_then(|d| u8::try_from(d).ok()) {
            if depth != self.colour_depth {
                warn!(
                    requested = self.colour_depth,
                    server = depth,
                    "server changed the colour depth"
                );
                self.colour_depth = depth;
            }
        }
        if let Some(size) = demand.size {
            self.desktop = size;
        }
        debug!(share_id = demand.share_id, "demand active");
    }

    async fn send_persistent_keys(&mut self) -> Result<()> {
        self.keys_sent = true;
        let keys = self
            .caches
            .enumerate_persistent(PERSISTENT_CACHE_ID, self.config.bitmap_cache_precache);
        if keys.is_empty() {
            return Ok(());
        }
        info!(keys = keys.len(), "advertising persistent bitmaps");
        let total = keys.len();
        let batches: Vec<_> = keys.chunks(rdp::MAX_KEYS_PER_PDU).collect();
        let last = batches.len() - 1;
        for (i, batch) in batches.into_iter().enumerate() {
            self.send_data(rdp::DATA_PERSISTENT_KEYS, |s| {
                rdp::put_persistent_keys(s, batch, total, i == 0, i == last)
            })
            .await?;
        }
        Ok(())
    }

    // ── Main loop ────────────────────────────────────────────────

    /// Receive and dispatch until the session ends.
    ///
    /// Returns `Ok` on a clean disconnect by either side. Any error
    /// has already torn the session down and set [`error`](Self::error).
    pub async fn run(&mut self, presenter: &mut dyn Presenter) -> Result<()> {
        if !self.state.is_active() {
            return Err(RdcError::InvalidState("session is not active"));
        }
        presenter.resize(self.desktop.0, self.desktop.1);
        loop {
            match self.step(presenter).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Ended) => {
                    info!(reason = ?self.disconnect_reason, "server ended the session");
                    self.disconnect().await;
                    return Ok(());
                }
                Err(e) => return Err(self.abort(e).await),
            }
        }
    }

    async fn step(&mut self, presenter: &mut dyn Presenter) -> Result<Flow> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(RdcError::InvalidState("no transport"))?;
        let wake = tokio::select! {
            _ = self.cancel.cancelled() => Wake::Canceled,
            Some(event) = self.input_rx.recv() => Wake::Input(event),
            frame = transport.recv_untimed() => Wake::Frame(frame),
        };
        match wake {
            Wake::Canceled => Err(RdcError::Canceled),
            Wake::Input(event) => self.send_input(event).await.map(|()| Flow::Continue),
            Wake::Frame(Err(RdcError::Closed)) => Ok(Flow::Ended),
            Wake::Frame(Err(e)) => Err(e),
            Wake::Frame(Ok(frame)) => self.handle_frame(frame, presenter).await,
        }
    }

    async fn handle_frame(&mut self, frame: Frame, presenter: &mut dyn Presenter) -> Result<Flow> {
        match frame {
            Frame::FastPath {
                header,
                mut payload,
            } => {
                self.stats_tx.send_modify(|s| {
                    s.frames += 1;
                    s.fast_path_frames += 1;
                    s.bytes += payload.len() as u64;
                });
                if header & FASTPATH_ENCRYPTED != 0 {
                    self.secure.decrypt_signed(&mut payload)?;
                }
                self.updates
                    .process_fast_path(&payload, &mut self.caches, presenter)?;
                Ok(Flow::Continue)
            }
            Frame::X224(payload) => {
                self.stats_tx.send_modify(|s| {
                    s.frames += 1;
                    s.bytes += payload.len() as u64;
                });
                let (channel, mut data) = match domain_data(&payload)? {
                    Some(d) => d,
                    None => return Ok(Flow::Ended),
                };
                let flags = self.secure.unwrap(&mut data)?;
                if channel != self.server.io_channel {
                    self.channel_data(channel, &data).await?;
                    return Ok(Flow::Continue);
                }
                if flags.contains(SecurityFlags::LICENCE_NEG) {
                    self.licence_pdu(&data).await?;
                    return Ok(Flow::Continue);
                }
                self.share_data(&data, presenter).await
            }
        }
    }

    async fn share_data(&mut self, data: &[u8], presenter: &mut dyn Presenter) -> Result<Flow> {
        for pdu in rdp::split_share_pdus(data)? {
            match pdu.pdu_type {
                rdp::PDU_DEMAND_ACTIVE => {
                    self.activate_share(pdu.body).await?;
                    presenter.resize(self.desktop.0, self.desktop.1);
                }
                rdp::PDU_DEACTIVATE => {
                    info!("server deactivated the share");
                    self.updates.reset();
                }
                rdp::PDU_DATA => {
                    match self
                        .updates
                        .process_data(pdu.body, &mut self.caches, presenter)?
                    {
                        Some(ServerNotice::LoggedOn) => info!("logged on"),
                        Some(ServerNotice::Disconnect { reason }) => {
                            if reason != 0 {
                                warn!(reason, "server announced disconnect");
                            }
                            self.disconnect_reason = Some(reason);
                        }
                        None => {}
                    }
                }
                other => debug!(pdu_type = other, "ignoring share PDU"),
            }
        }
        Ok(Flow::Continue)
    }

    async fn channel_data(&mut self, channel: u16, data: &[u8]) -> Result<()> {
        if let Some(outbox) = self.channels.receive(channel, data)? {
            self.stats_tx.send_modify(|s| s.channel_messages += 1);
            self.flush_outbox(channel, outbox).await?;
        }
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Send one input event. Only valid while active.
    pub async fn send_input(&mut self, event: InputEvent) -> Result<()> {
        if !self.state.is_active() {
            return Err(RdcError::InvalidState("input before activation"));
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        self.send_data(rdp::DATA_INPUT, |s| rdp::put_input(s, time, &event))
            .await
    }

    /// Send `message` on the virtual channel registered as `name`.
    pub async fn send_channel_message(&mut self, name: &str, message: &[u8]) -> Result<()> {
        let id = self
            .channels
            .id_of(name)
            .ok_or_else(|| RdcError::ProtocolViolation(format!("channel {name} is not open")))?;
        self.send_channel(id, message).await
    }

    async fn flush_outbox(&mut self, id: u16, mut outbox: ChannelOutbox) -> Result<()> {
        for message in outbox.drain() {
            self.send_channel(id, &message).await?;
        }
        Ok(())
    }

    async fn send_channel(&mut self, id: u16, message: &[u8]) -> Result<()> {
        let options = self
            .channels
            .options(id)
            .unwrap_or(ChannelOptions::empty());
        let flags = self.secure.data_flags();
        for (chunk_flags, chunk) in channels::chunks(message, options) {
            let mut s = self
                .secure
                .init(flags, chunk.len() + channels::CHUNK_HEADER_LEN);
            s.put_u32_le(message.len() as u32);
            s.put_u32_le(chunk_flags.bits());
            s.put_slice(chunk);
            let pdu = self.secure.finish(s, flags, self.ids.user_id, id)?;
            self.send(pdu).await?;
        }
        Ok(())
    }

    async fn send_data(&mut self, data_type: u8, body: impl FnOnce(&mut Stream)) -> Result<()> {
        let flags = self.secure.data_flags();
        let mut s = self.secure.init(flags, 64);
        rdp::init_data(&mut s);
        body(&mut s);
        rdp::finish_data(&mut s, self.ids, data_type)?;
        let pdu = self
            .secure
            .finish(s, flags, self.ids.user_id, GLOBAL_CHANNEL)?;
        self.send(pdu).await
    }

    async fn send(&mut self, pdu: Bytes) -> Result<()> {
        self.transport
            .as_mut()
            .ok_or(RdcError::InvalidState("no transport"))?
            .send(pdu)
            .await
    }

    // ── Inbound helpers ──────────────────────────────────────────

    /// Next X.224 payload, within the handshake deadline.
    async fn recv_x224(&mut self) -> Result<BytesMut> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(RdcError::InvalidState("no transport"))?;
        match transport.recv().await? {
            Frame::X224(payload) => Ok(payload),
            Frame::FastPath { .. } => Err(RdcError::ProtocolViolation(
                "fast-path frame during the handshake".into(),
            )),
        }
    }

    /// Next data TPDU body.
    async fn recv_tpdu(&mut self) -> Result<BytesMut> {
        let mut payload = self.recv_x224().await?;
        let offset = match iso::parse_tpdu(&payload)? {
            Tpdu::Data(data) => payload.len() - data.len(),
            Tpdu::Disconnect => {
                return Err(RdcError::Rejected("server sent a disconnect request".into()));
            }
        };
        payload.advance(offset);
        Ok(payload)
    }

    /// Next send-data-indication on the I/O channel, security header
    /// still attached. Data for virtual channels is routed on the way.
    async fn recv_global(&mut self) -> Result<BytesMut> {
        loop {
            let payload = self.recv_x224().await?;
            let Some((channel, data)) = domain_data(&payload)? else {
                return Err(RdcError::Rejected("server disconnected during the handshake".into()));
            };
            if channel == self.server.io_channel {
                return Ok(data);
            }
            let mut data = data;
            self.secure.unwrap(&mut data)?;
            self.channel_data(channel, &data).await?;
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Tear the session down. Safe from any state and idempotent.
    pub async fn disconnect(&mut self) {
        if self.state.is_disconnected() && self.transport.is_none() {
            return;
        }
        let domain_up = !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::TransportConnected
        );
        if let Err(e) = self.state.begin_disconnect() {
            debug!(state = %self.state, "{e}");
        }
        if let Some(mut transport) = self.transport.take() {
            if domain_up {
                if let Ok(pdu) = mcs::disconnect_provider_ultimatum() {
                    let _ = transport.send(pdu).await;
                }
            }
            let _ = transport.send(iso::disconnect_request()).await;
            transport.close().await;
        }
        self.release();
        info!("disconnected");
    }

    /// Record `e` as the attempt's error and drop every resource.
    async fn abort(&mut self, e: RdcError) -> RdcError {
        if self.error == ConnectionError::None {
            self.error = e.kind();
        }
        warn!(error = %e, kind = ?self.error, state = %self.state, "session failed");
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.release();
        e
    }

    fn release(&mut self) {
        self.caches.save_state();
        self.caches = CacheSet::default();
        self.channels.disconnect();
        self.secure = SecureLayer::new();
        self.updates.reset();
        self.ids = ShareIds::default();
        self.state.force_disconnect();
    }
}

/// Split an X.224 payload into the channel and data of a
/// send-data-indication. `None` on a disconnect.
fn domain_data(payload: &[u8]) -> Result<Option<(u16, BytesMut)>> {
    let data = match iso::parse_tpdu(payload)? {
        Tpdu::Data(data) => data,
        Tpdu::Disconnect => return Ok(None),
    };
    match mcs::parse_domain_pdu(data)? {
        DomainPdu::Data { channel, payload } => Ok(Some((channel, BytesMut::from(payload)))),
        DomainPdu::Disconnect => Ok(None),
    }
}
