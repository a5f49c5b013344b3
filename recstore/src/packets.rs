//! Fixed-size records and wire messages.
//!
//! Everything here is `#[repr(C)]` with no padding and goes to disk or the
//! socket as its raw native-endian bytes.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `arg` value that marks a failed request.
pub const FAILED: i32 = -1;

/// Monthly mobile OS market share, one row of the data file.
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MarketShare {
    pub month: i32,
    pub android: f32,
    pub ios: f32,
    pub kaios: f32,
    pub other: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Action {
    Count = 1,
    Read = 2,
    Update = 3,
    Create = 4,
    /// Connect when logged, log listing when requested.
    Log = 5,
    Disconnect = 6,
}

impl Action {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Action> {
        match code {
            1 => Some(Action::Count),
            2 => Some(Action::Read),
            3 => Some(Action::Update),
            4 => Some(Action::Create),
            5 => Some(Action::Log),
            6 => Some(Action::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LogEntry {
    pub action: i32,
    pub arg: i32,
}

impl LogEntry {
    pub fn new(action: Action, arg: i32) -> LogEntry {
        LogEntry { action: action.code(), arg }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Action::from_code(self.action) {
            Some(Action::Count) => write!(f, "Requested Record Count ({}).", self.arg),
            Some(Action::Read) => write!(f, "Read Record {}.", self.arg),
            Some(Action::Update) => write!(f, "Updated Record {}.", self.arg),
            Some(Action::Create) => write!(f, "Created Record {}.", self.arg),
            Some(Action::Log) => write!(f, "Connected to server."),
            Some(Action::Disconnect) => write!(f, "Disconnected from server."),
            None => write!(f, "Performed unspecified action ({}|{}).", self.action, self.arg),
        }
    }
}

/// Length of a dotted-quad address plus NUL.
pub const ADDR_LEN: usize = 16;

/// Server log row: which peer did what.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ServerLogEntry {
    pub addr: [u8; ADDR_LEN],
    pub port: i32,
    pub log: LogEntry,
}

impl ServerLogEntry {
    pub fn new(peer: SocketAddrV4, log: LogEntry) -> ServerLogEntry {
        let mut addr = [0u8; ADDR_LEN];
        let text = peer.ip().to_string();
        let len = text.len().min(ADDR_LEN - 1);
        addr[..len].copy_from_slice(&text.as_bytes()[..len]);
        ServerLogEntry { addr, port: peer.port() as i32, log }
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        let end = self.addr.iter().position(|&b| b == 0).unwrap_or(ADDR_LEN);
        std::str::from_utf8(&self.addr[..end]).ok()?.parse().ok()
    }
}

impl fmt::Display for ServerLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(ip) => write!(f, "{}:{} | {}", ip, self.port, self.log),
            None => write!(f, "?:{} | {}", self.port, self.log),
        }
    }
}

/// Client log row, keyed by the client's process id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ClientLogEntry {
    pub pid: i32,
    pub log: LogEntry,
}

impl ClientLogEntry {
    pub fn new(pid: i32, log: LogEntry) -> ClientLogEntry {
        ClientLogEntry { pid, log }
    }
}

impl fmt::Display for ClientLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process {} | {}", self.pid, self.log)
    }
}

/// Request and reply for record operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RecordMessage {
    pub action: i32,
    pub arg: i32,
    pub record: MarketShare,
}

impl RecordMessage {
    pub fn new(action: Action, arg: i32, record: MarketShare) -> RecordMessage {
        RecordMessage { action: action.code(), arg, record }
    }

    pub fn request(action: Action, arg: i32) -> RecordMessage {
        RecordMessage::new(action, arg, MarketShare::default())
    }

    pub fn failed(action: i32) -> RecordMessage {
        RecordMessage { action, arg: FAILED, record: MarketShare::default() }
    }

    pub fn action(&self) -> Option<Action> {
        Action::from_code(self.action)
    }

    pub fn is_failure(&self) -> bool {
        self.arg == FAILED
    }
}

/// One streamed server log row. `arg` is [`LogMessage::MORE`] while rows
/// follow, [`LogMessage::DONE`] on the terminator and [`FAILED`] on error.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LogMessage {
    pub arg: i32,
    pub entry: ServerLogEntry,
}

impl LogMessage {
    pub const MORE: i32 = 1;
    pub const DONE: i32 = 0;

    pub fn entry(entry: ServerLogEntry) -> LogMessage {
        LogMessage { arg: LogMessage::MORE, entry }
    }

    pub fn done() -> LogMessage {
        LogMessage { arg: LogMessage::DONE, entry: ServerLogEntry::default() }
    }

    pub fn failed() -> LogMessage {
        LogMessage { arg: FAILED, entry: ServerLogEntry::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn layouts_have_no_padding() {
        assert_eq!(size_of::<MarketShare>(), 20);
        assert_eq!(size_of::<LogEntry>(), 8);
        assert_eq!(size_of::<ServerLogEntry>(), 28);
        assert_eq!(size_of::<ClientLogEntry>(), 12);
        assert_eq!(size_of::<RecordMessage>(), 28);
        assert_eq!(size_of::<LogMessage>(), 32);
    }

    #[test]
    fn log_lines_read_like_the_action() {
        assert_eq!(LogEntry::new(Action::Count, 13).to_string(), "Requested Record Count (13).");
        assert_eq!(LogEntry::new(Action::Update, 2).to_string(), "Updated Record 2.");
        assert_eq!(LogEntry::new(Action::Log, 0).to_string(), "Connected to server.");
        assert_eq!(
            LogEntry { action: 9, arg: 4 }.to_string(),
            "Performed unspecified action (9|4)."
        );
    }

    #[test]
    fn server_entry_keeps_the_peer() {
        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 100, 250), 40123);
        let entry = ServerLogEntry::new(peer, LogEntry::new(Action::Read, 7));
        assert_eq!(entry.ip(), Some(*peer.ip()));
        assert_eq!(entry.to_string(), "192.168.100.250:40123 | Read Record 7.");
    }

    #[test]
    fn client_entry_names_the_process() {
        let entry = ClientLogEntry::new(4242, LogEntry::new(Action::Disconnect, 0));
        assert_eq!(entry.to_string(), "Process 4242 | Disconnected from server.");
    }

    #[test]
    fn action_codes_are_stable() {
        for code in 1..=6 {
            assert_eq!(Action::from_code(code).map(Action::code), Some(code));
        }
        assert_eq!(Action::from_code(0), None);
        assert!(RecordMessage::failed(3).is_failure());
    }
}
