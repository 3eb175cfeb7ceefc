//! Session status: which exchange is in flight, handshake result, last NACK.

use crate::chunk::InboundFile;
use crate::protocol::{FileList, NackCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitHandshake,
    WaitFileHash,
    WaitFilesList,
    WaitAck,
    WaitFileSendAck,
    WaitFileReqAck,
    /// Receiving: a FILE_SEND_REQ was acknowledged, FILE_DATA is expected.
    WaitFile,
    ErrReceived,
}

impl SessionState {
    /// States satisfied by an ACK.
    pub fn awaits_ack(self) -> bool {
        matches!(
            self,
            Self::WaitAck | Self::WaitFileSendAck | Self::WaitFileReqAck
        )
    }

    /// States in which a local request is blocked waiting for the peer.
    pub fn awaits_response(self) -> bool {
        self.awaits_ack()
            || matches!(
                self,
                Self::WaitHandshake | Self::WaitFileHash | Self::WaitFilesList
            )
    }
}

/// Everything the pump and the request side share.
#[derive(Debug)]
pub struct SessionStatus {
    pub state: SessionState,
    pub handshake_done: bool,
    pub peer_window: u16,
    pub last_error: Option<NackCode>,
    /// A fault forced the session idle while a request was outstanding.
    pub aborted: bool,
    pub pending_file: Option<InboundFile>,
    pub files_list: Option<FileList>,
    pub file_hash: Option<u32>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            handshake_done: false,
            peer_window: 0,
            last_error: None,
            aborted: false,
            pending_file: None,
            files_list: None,
            file_hash: None,
        }
    }
}

impl SessionStatus {
    /// A new request may start. A stale `ErrReceived` from an unsolicited NACK does not block it.
    pub fn is_free(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::ErrReceived)
    }

    pub fn begin_request(&mut self, awaited: SessionState) {
        self.state = awaited;
        self.last_error = None;
        self.aborted = false;
        self.files_list = None;
        self.file_hash = None;
    }

    /// The awaited response arrived.
    pub fn complete(&mut self) {
        self.state = SessionState::Idle;
    }

    /// Force idle after a fault. A waiting request will report failure, a receive is dropped.
    pub fn abort(&mut self) {
        if self.state.awaits_response() {
            self.aborted = true;
        }
        self.pending_file = None;
        self.state = SessionState::Idle;
    }

    pub fn record_nack(&mut self, code: NackCode) {
        self.last_error = Some(code);
        self.state = SessionState::ErrReceived;
    }

    /// Back to idle once a request has reported its outcome.
    pub fn settle(&mut self) {
        self.state = SessionState::Idle;
        self.last_error = None;
        self.aborted = false;
    }
}
