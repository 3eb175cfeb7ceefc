//! Protocol engine. `XferCore` issues blocking requests; `Pump` is driven by the host,
//! reads the link one step at a time and dispatches packets to the handlers.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::chunk::{self, InboundFile, PlanError, Segment, SegmentPlan};
use crate::config::{Config, ConfigError};
use crate::parser::{Fault, ParseState, Parser, Step};
use crate::protocol::{FileList, Message, MessageId, NackCode, MIN_WINDOW};
use crate::session::{SessionState, SessionStatus};
use crate::storage::Storage;
use crate::wire::{self, FrameBuffer, FrameEncodeError, PacketWriter};

/// Transmit side: the send buffer and the link's write half.
struct Outbound<W> {
    buf: FrameBuffer,
    writer: W,
}

impl<W: Write> Outbound<W> {
    fn send(&mut self, msg: &Message<'_>) -> Result<(), SendError> {
        let packet = wire::encode_packet(&mut self.buf, msg)?;
        self.writer.write_all(packet)?;
        self.writer.flush()?;
        Ok(())
    }
}

struct Shared<W, S> {
    config: Config,
    status: Mutex<SessionStatus>,
    /// Notified on every session state change.
    changed: Condvar,
    out: Mutex<Outbound<W>>,
    storage: Mutex<S>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one end of a link. Cheap to clone; clones share the session.
pub struct XferCore<W, S> {
    shared: Arc<Shared<W, S>>,
}

impl<W, S> Clone for XferCore<W, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W: Write + Send, S: Storage> XferCore<W, S> {
    pub fn new(config: Config, writer: W, storage: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let buf = FrameBuffer::for_payload(usize::from(config.tx_payload_capacity));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                status: Mutex::new(SessionStatus::default()),
                changed: Condvar::new(),
                out: Mutex::new(Outbound { buf, writer }),
                storage: Mutex::new(storage),
            }),
        })
    }

    /// Receive side for this core. Call `Pump::step` continuously, on its own thread,
    /// while requests are in flight.
    pub fn pump<R: Read>(&self, reader: R) -> Pump<R, W, S> {
        Pump {
            reader,
            parser: Parser::new(usize::from(self.shared.config.window_size)),
            core: self.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.status().state
    }

    pub fn handshake_done(&self) -> bool {
        self.shared.status().handshake_done
    }

    /// Window the peer advertised in the last handshake (0 before any).
    pub fn peer_window(&self) -> u16 {
        self.shared.status().peer_window
    }

    pub fn last_error(&self) -> Option<NackCode> {
        self.shared.status().last_error
    }

    /// File currently being received, if any.
    pub fn pending_file(&self) -> Option<InboundFile> {
        self.shared.status().pending_file.clone()
    }

    /// Run storage code under the engine's storage lock (e.g. to inspect received files).
    pub fn with_storage<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut lock(&self.shared.storage))
    }

    /// Advertise `window` to the peer and record the window it answers with.
    pub fn initiate_handshake(&self, window: u16) -> Result<(), RequestError> {
        if window < MIN_WINDOW || window > self.shared.config.window_size {
            return Err(RequestError::InvalidWindow {
                window,
                max: self.shared.config.window_size,
            });
        }
        self.request(
            SessionState::WaitHandshake,
            &Message::HandshakeReq { window },
        )?;
        let peer_window = self.peer_window();
        debug!(window, peer_window, "handshake done");
        Ok(())
    }

    /// Ask the peer for its file listing.
    pub fn request_file_list(&self) -> Result<FileList, RequestError> {
        self.request(SessionState::WaitFilesList, &Message::FilesListReq)?;
        let list = self.shared.status().files_list.take().unwrap_or_default();
        debug!(files = list.len(), "files list received");
        Ok(list)
    }

    /// Ask the peer for the CRC32 of one of its files.
    pub fn request_file_hash(&self, name: &str) -> Result<u32, RequestError> {
        self.check_name(name)?;
        self.request(SessionState::WaitFileHash, &Message::FileHashReq { name })?;
        let hash = self
            .shared
            .status()
            .file_hash
            .take()
            .ok_or(RequestError::Aborted)?;
        debug!(name, hash = format_args!("{:#010x}", hash), "file hash received");
        Ok(hash)
    }

    /// Send a local file to the peer, segment by segment, each one acknowledged.
    /// Returns the number of bytes sent.
    pub fn send_file(&self, name: &str) -> Result<u64, RequestError> {
        self.check_name(name)?;
        let file_size = lock(&self.shared.storage)
            .file_size(name)
            .map_err(RequestError::Storage)?;
        // Plan before the peer prepares (and truncates) its copy. Without a handshake the
        // peer window is unknown; the request goes out anyway and the peer NACKs it.
        let planned = match self.peer_window() {
            0 => None,
            window => Some(self.plan(file_size, window)?),
        };
        debug!(name, file_size, "requesting file send");
        self.request(SessionState::WaitFileSendAck, &Message::FileSendReq { name })?;

        let plan = match planned {
            Some(plan) => plan,
            None => self.plan(file_size, self.peer_window())?,
        };
        debug!(segments = plan.count(), chunk = plan.chunk_size(), "send accepted");
        for segment in plan.segments() {
            self.send_segment(name, segment)?;
            debug!(
                index = segment.index,
                offset = segment.offset,
                len = segment.len,
                "segment acknowledged"
            );
        }
        info!(name, file_size, "file sent");
        Ok(file_size)
    }

    fn plan(&self, file_size: u64, peer_window: u16) -> Result<SegmentPlan, RequestError> {
        let chunk = chunk::chunk_size(
            peer_window,
            usize::from(self.shared.config.tx_payload_capacity),
        )?;
        Ok(SegmentPlan::new(file_size, chunk)?)
    }

    fn check_name(&self, name: &str) -> Result<(), RequestError> {
        let max = self.shared.config.max_file_name_len;
        if name.is_empty() || name.len() > max || name.contains('\0') {
            return Err(RequestError::InvalidName {
                name: name.to_owned(),
                max,
            });
        }
        Ok(())
    }

    fn request(&self, awaited: SessionState, msg: &Message<'_>) -> Result<(), RequestError> {
        self.shared.begin(awaited)?;
        if let Err(e) = lock(&self.shared.out).send(msg) {
            error!(kind = ?msg.id(), "request send failed: {}", e);
            self.shared.settle();
            return Err(e.into());
        }
        self.shared.wait(awaited)
    }

    fn send_segment(&self, name: &str, segment: Segment) -> Result<(), RequestError> {
        self.shared.begin(SessionState::WaitAck)?;
        let sent = {
            let mut guard = lock(&self.shared.out);
            let out = &mut *guard;
            build_segment(&mut out.buf, &self.shared.storage, name, segment).and_then(|packet| {
                out.writer.write_all(packet)?;
                out.writer.flush()?;
                Ok(())
            })
        };
        if let Err(e) = sent {
            error!(name, index = segment.index, "segment send failed: {}", e);
            self.shared.settle();
            return Err(e);
        }
        self.shared.wait(SessionState::WaitAck)
    }
}

/// FILE_DATA packet with the chunk read straight from storage into the send buffer.
fn build_segment<'a, S: Storage>(
    buf: &'a mut FrameBuffer,
    storage: &Mutex<S>,
    name: &str,
    segment: Segment,
) -> Result<&'a [u8], RequestError> {
    let encode = |e: FrameEncodeError| match e {
        FrameEncodeError::Fill(e) => RequestError::Storage(e),
        other => RequestError::Send(SendError::Encode(other)),
    };
    let mut w = PacketWriter::begin(buf, MessageId::FileData).map_err(encode)?;
    w.push(&segment.index.to_le_bytes()).map_err(encode)?;
    w.push_with(segment.len, |dst| {
        lock(storage).read_chunk(name, segment.offset, dst)
    })
    .map_err(encode)?;
    w.finish().map_err(encode)
}

impl<W: Write + Send, S: Storage> Shared<W, S> {
    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        lock(&self.status)
    }

    /// Mutate the session and wake any waiting request.
    fn update<T>(&self, f: impl FnOnce(&mut SessionStatus) -> T) -> T {
        let out = f(&mut self.status());
        self.changed.notify_all();
        out
    }

    fn begin(&self, awaited: SessionState) -> Result<(), RequestError> {
        let mut status = self.status();
        if !status.is_free() {
            return Err(RequestError::Busy(status.state));
        }
        status.begin_request(awaited);
        Ok(())
    }

    fn settle(&self) {
        self.update(SessionStatus::settle);
    }

    fn wait(&self, awaited: SessionState) -> Result<(), RequestError> {
        let timeout = self.config.response_timeout();
        let (mut status, result) = self
            .changed
            .wait_timeout_while(self.status(), timeout, |s| s.state == awaited)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && status.state == awaited {
            error!(?awaited, "response timeout after {:?}", timeout);
            status.settle();
            return Err(RequestError::Timeout(awaited));
        }
        match status.state {
            SessionState::ErrReceived => {
                let code = status.last_error.unwrap_or(NackCode::Other(0));
                error!(?awaited, "peer answered NACK: {}", code);
                status.settle();
                Err(RequestError::Nack(code))
            }
            SessionState::Idle if status.aborted => {
                error!(?awaited, "request aborted by link fault");
                status.settle();
                Err(RequestError::Aborted)
            }
            SessionState::Idle => Ok(()),
            other => {
                warn!(?awaited, now = ?other, "request preempted by peer");
                Err(RequestError::Aborted)
            }
        }
    }

    fn reply(&self, msg: &Message<'_>) {
        if let Err(e) = lock(&self.out).send(msg) {
            error!(kind = ?msg.id(), "failed to send reply: {}", e);
        }
    }

    fn nack(&self, code: NackCode) {
        debug!("sending NACK: {}", code);
        self.reply(&Message::Nack { code });
    }

    fn on_fault(&self, fault: &Fault) {
        error!("{}", fault);
        match fault {
            Fault::Read(_) | Fault::UnknownId(_) => self.update(SessionStatus::abort),
            Fault::NoMemory { .. } => {
                self.update(SessionStatus::abort);
                self.nack(NackCode::NoMemory);
            }
            Fault::BadCrc { .. } => self.nack(NackCode::WrongCrc),
        }
    }

    fn dispatch(&self, kind: MessageId, payload: &[u8]) {
        let msg = match Message::decode(kind, payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(?kind, "malformed payload: {}", e);
                self.nack(NackCode::BadRequest);
                return;
            }
        };
        match msg {
            Message::HandshakeReq { window } => self.on_handshake_req(window),
            Message::HandshakeRes { window } => self.on_handshake_res(window),
            Message::FilesListReq => self.on_files_list_req(),
            Message::FilesListRes(list) => self.on_files_list_res(list),
            Message::FileHashReq { name } => self.on_file_hash_req(name),
            Message::FileHashRes { hash } => self.on_file_hash_res(hash),
            Message::FileSendReq { name } => self.on_file_send_req(name),
            Message::FileReceiveReq => debug!("file receive request ignored"),
            Message::FileData { segment, data } => self.on_file_data(segment, data),
            Message::Ack => self.on_ack(),
            Message::Nack { code } => self.on_nack(code),
        }
    }

    fn on_handshake_req(&self, window: u16) {
        debug!(window, "handshake request");
        if window < MIN_WINDOW {
            warn!(window, "peer window too small");
            self.nack(NackCode::BadRequest);
            return;
        }
        self.update(|s| {
            s.peer_window = window;
            s.handshake_done = true;
        });
        self.reply(&Message::HandshakeRes {
            window: self.config.window_size,
        });
    }

    fn on_handshake_res(&self, window: u16) {
        debug!(window, "handshake response");
        let mut status = self.status();
        if status.state != SessionState::WaitHandshake {
            drop(status);
            self.unexpected(MessageId::HandshakeRes);
            return;
        }
        if window < MIN_WINDOW {
            drop(status);
            warn!(window, "peer window too small");
            self.nack(NackCode::BadRequest);
            return;
        }
        status.peer_window = window;
        status.handshake_done = true;
        status.complete();
        drop(status);
        self.changed.notify_all();
    }

    fn on_files_list_req(&self) {
        let Some(peer_window) = self.handshaken() else {
            return;
        };
        let listed = lock(&self.storage).list_files();
        let names = match listed {
            Ok(names) => names,
            Err(e) => {
                error!("listing files failed: {}", e);
                self.nack(NackCode::BadRequest);
                return;
            }
        };
        let capacity = usize::from(peer_window).min(usize::from(self.config.tx_payload_capacity));
        let list = FileList::pack(names, capacity);
        debug!(files = list.len(), capacity, "sending files list");
        self.reply(&Message::FilesListRes(list));
    }

    fn on_files_list_res(&self, list: FileList) {
        debug!(files = list.len(), "files list response");
        let accepted = self.update(|s| {
            if s.state != SessionState::WaitFilesList {
                return false;
            }
            s.files_list = Some(list);
            s.complete();
            true
        });
        if !accepted {
            self.unexpected(MessageId::FilesListRes);
        }
    }

    fn on_file_hash_req(&self, name: &str) {
        if self.handshaken().is_none() {
            return;
        }
        let hash = lock(&self.storage).file_hash(name);
        match hash {
            Ok(hash) => {
                debug!(name, hash = format_args!("{:#010x}", hash), "sending file hash");
                self.reply(&Message::FileHashRes { hash });
            }
            Err(e) => {
                warn!(name, "cannot hash file: {}", e);
                self.nack(NackCode::BadRequest);
            }
        }
    }

    fn on_file_hash_res(&self, hash: u32) {
        let accepted = self.update(|s| {
            if s.state != SessionState::WaitFileHash {
                return false;
            }
            s.file_hash = Some(hash);
            s.complete();
            true
        });
        if !accepted {
            self.unexpected(MessageId::FileHashRes);
        }
    }

    fn on_file_send_req(&self, name: &str) {
        debug!(name, "file send request");
        if self.handshaken().is_none() {
            return;
        }
        if name.is_empty() || name.len() > self.config.max_file_name_len {
            warn!(name, "rejecting file name");
            self.nack(NackCode::BadRequest);
            return;
        }
        let prepared = lock(&self.storage).begin_receive(name);
        if let Err(e) = prepared {
            warn!(name, "cannot receive file: {}", e);
            self.nack(NackCode::BadRequest);
            return;
        }
        let previous = self.update(|s| {
            let previous = s.state;
            s.pending_file = Some(InboundFile::new(name));
            s.state = SessionState::WaitFile;
            previous
        });
        if previous.awaits_response() {
            warn!(?previous, "inbound file preempts local request");
        }
        self.reply(&Message::Ack);
    }

    fn on_file_data(&self, segment: u16, data: &[u8]) {
        let name = {
            let status = self.status();
            if !status.handshake_done {
                drop(status);
                self.no_handshake();
                return;
            }
            match (&status.state, &status.pending_file) {
                (SessionState::WaitFile, Some(file)) => file.name.clone(),
                _ => {
                    drop(status);
                    self.unexpected(MessageId::FileData);
                    return;
                }
            }
        };
        let last = segment == 0;
        let appended = lock(&self.storage).append(&name, data, last);
        let complete = match appended {
            Ok(complete) => complete,
            Err(e) => {
                error!(name = %name, segment, "append failed: {}", e);
                self.update(|s| {
                    s.pending_file = None;
                    s.state = SessionState::Idle;
                });
                return;
            }
        };
        self.update(|s| {
            let Some(file) = s.pending_file.as_mut() else {
                return;
            };
            if !file.record(segment, data.len()) {
                warn!(name = %name, segment, "segment out of order");
            }
            debug!(name = %name, segment, len = data.len(), "segment appended");
            if complete {
                info!(name = %name, bytes = file.bytes, segments = file.segments, "file received");
                s.pending_file = None;
                s.state = SessionState::Idle;
            }
        });
        self.reply(&Message::Ack);
    }

    fn on_ack(&self) {
        let accepted = self.update(|s| {
            if !s.state.awaits_ack() {
                return false;
            }
            s.complete();
            true
        });
        if !accepted {
            self.unexpected(MessageId::Ack);
        }
    }

    fn on_nack(&self, code: NackCode) {
        let previous = self.update(|s| {
            let previous = s.state;
            s.record_nack(code);
            previous
        });
        if previous.awaits_response() {
            debug!(?previous, "NACK received: {}", code);
        } else {
            warn!(?previous, "unsolicited NACK: {}", code);
        }
    }

    /// Peer window if the handshake is done, otherwise NACK(NO_HANDSHAKE).
    fn handshaken(&self) -> Option<u16> {
        let status = self.status();
        if status.handshake_done {
            return Some(status.peer_window);
        }
        drop(status);
        self.no_handshake();
        None
    }

    fn no_handshake(&self) {
        warn!("no handshake yet");
        self.nack(NackCode::NoHandshake);
    }

    fn unexpected(&self, kind: MessageId) {
        warn!(?kind, "packet was not awaited");
        self.nack(NackCode::UnexpectedPacket);
    }
}

/// Outcome of one `Pump::step`.
#[derive(Debug)]
pub enum Progress {
    /// Bytes consumed, no packet completed.
    Advanced,
    /// A packet was dispatched to its handler.
    Handled(MessageId),
    /// Framing fault; already handled (session reset and/or NACK sent).
    Fault(Fault),
}

/// Receive side: link read half, parser and receive buffer.
pub struct Pump<R, W, S> {
    reader: R,
    parser: Parser,
    core: XferCore<W, S>,
}

impl<R: Read, W: Write + Send, S: Storage> Pump<R, W, S> {
    /// One unit of protocol progress. Blocks on the reader.
    pub fn step(&mut self) -> Progress {
        let shared = &self.core.shared;
        match self.parser.step(&mut self.reader) {
            Step::Advanced => Progress::Advanced,
            Step::Packet { kind, payload } => {
                shared.dispatch(kind, payload);
                Progress::Handled(kind)
            }
            Step::Fault(fault) => {
                shared.on_fault(&fault);
                Progress::Fault(fault)
            }
        }
    }

    pub fn parse_state(&self) -> ParseState {
        self.parser.state()
    }

    pub fn core(&self) -> &XferCore<W, S> {
        &self.core
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}

/// Failure to put a packet on the link.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("encode failed: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("link write failed: {0}")]
    Io(#[from] io::Error),
}

/// Why a request did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("session busy ({0:?})")]
    Busy(SessionState),
    #[error("no response while in {0:?}")]
    Timeout(SessionState),
    #[error("peer answered NACK: {0}")]
    Nack(NackCode),
    #[error("request aborted")]
    Aborted,
    #[error("window {window} out of range ({min}..={max})", min = MIN_WINDOW)]
    InvalidWindow { window: u16, max: u16 },
    #[error("invalid file name {name:?} (max {max} bytes)")]
    InvalidName { name: String, max: usize },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("storage: {0}")]
    Storage(#[source] io::Error),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        Self::Send(SendError::Io(e))
    }
}
