use std::io::{Read, Write};
use std::net::SocketAddrV4;

use tracing::{debug, error, info, warn};

use recstore::connection::Connection;
use recstore::packets::{
    Action, LogEntry, LogMessage, MarketShare, RecordMessage, ServerLogEntry, FAILED,
};
use recstore::{RecordStore, Result, SemaphoreBank, ServerConfig};

/// Slot group guarding the data file.
pub const DATA_GROUP: usize = 0;
/// Slot group guarding the server log.
pub const LOG_GROUP: usize = 1;
pub const GROUPS: usize = 2;

/// The two files every connection process works on.
pub struct ServerFiles {
    pub data: RecordStore<MarketShare>,
    pub log: RecordStore<ServerLogEntry>,
}

impl ServerFiles {
    /// The data file must already exist; the log is created on first use.
    pub fn open(cfg: &ServerConfig, bank: &SemaphoreBank) -> Result<ServerFiles> {
        Ok(ServerFiles {
            data: RecordStore::open(&cfg.data_file, bank.group(DATA_GROUP)?)?,
            log: RecordStore::open_or_create(&cfg.log_file, bank.group(LOG_GROUP)?)?,
        })
    }
}

/// One client connection, served until the client hangs up.
pub struct Session<'a, S: Read + Write> {
    conn: Connection<S>,
    peer: SocketAddrV4,
    files: &'a ServerFiles,
}

impl<'a, S: Read + Write> Session<'a, S> {
    pub fn new(conn: Connection<S>, peer: SocketAddrV4, files: &'a ServerFiles) -> Self {
        Session { conn, peer, files }
    }

    pub fn run(&mut self) -> Result<()> {
        info!(peer = %self.peer, "child connected");
        self.write_log(Action::Log, 0);
        while let Some(message) = self.conn.read_message::<RecordMessage>()? {
            self.dispatch(message)?;
        }
        info!(peer = %self.peer, "client disconnected");
        self.write_log(Action::Disconnect, 0);
        Ok(())
    }

    fn dispatch(&mut self, message: RecordMessage) -> Result<()> {
        let reply = match message.action() {
            Some(Action::Count) => self.count_reply(),
            Some(Action::Read) => self.read_reply(message.arg),
            Some(Action::Update) => self.update_reply(message.arg, message.record),
            Some(Action::Create) => self.create_reply(message.record),
            // Streams its own replies.
            Some(Action::Log) => return self.log_reply(),
            _ => {
                warn!(peer = %self.peer, action = message.action, "received unspecified request");
                RecordMessage::failed(message.action)
            }
        };
        self.conn.write_message(&reply)
    }

    fn count_reply(&mut self) -> RecordMessage {
        debug!(peer = %self.peer, "received request for record count");
        let arg = match self.files.data.count() {
            Ok(count) => count as i32,
            Err(e) => {
                error!(error = %e, "could not count records");
                FAILED
            }
        };
        self.write_log(Action::Count, arg);
        RecordMessage::request(Action::Count, arg)
    }

    fn read_reply(&mut self, arg: i32) -> RecordMessage {
        debug!(peer = %self.peer, record = arg, "received request for read");
        let reply = match usize::try_from(arg) {
            Ok(index) => match self.files.data.read(index) {
                Ok(record) => RecordMessage::new(Action::Read, arg, record),
                Err(e) => {
                    warn!(record = arg, error = %e, "could not read record");
                    RecordMessage::failed(Action::Read.code())
                }
            },
            Err(_) => RecordMessage::failed(Action::Read.code()),
        };
        self.write_log(Action::Read, reply.arg);
        reply
    }

    fn update_reply(&mut self, arg: i32, record: MarketShare) -> RecordMessage {
        debug!(peer = %self.peer, record = arg, "received request for update");
        let count = match self.files.data.count() {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "could not count records");
                return RecordMessage::failed(Action::Update.code());
            }
        };
        let index = match usize::try_from(arg) {
            Ok(index) if index < count => index,
            _ => {
                warn!(record = arg, count, "invalid record");
                return RecordMessage::failed(Action::Update.code());
            }
        };
        let reply = match self
            .files
            .data
            .update(index, &record)
            .and_then(|()| self.files.data.read(index))
        {
            Ok(stored) => RecordMessage::new(Action::Update, arg, stored),
            Err(e) => {
                error!(record = arg, error = %e, "could not update record");
                RecordMessage::failed(Action::Update.code())
            }
        };
        self.write_log(Action::Update, reply.arg);
        reply
    }

    /// Appends `record` numbered as the next month.
    fn create_reply(&mut self, mut record: MarketShare) -> RecordMessage {
        debug!(peer = %self.peer, "received request for create");
        let reply = match self.create(&mut record) {
            Ok(index) => RecordMessage::new(Action::Create, index as i32, record),
            Err(e) => {
                error!(error = %e, "could not create record");
                RecordMessage::failed(Action::Create.code())
            }
        };
        self.write_log(Action::Create, reply.arg);
        reply
    }

    fn create(&self, record: &mut MarketShare) -> Result<usize> {
        let data = &self.files.data;
        record.month = data.count()? as i32;
        let index = data.append(record)?;
        if index as i32 != record.month {
            // Another process appended between our count and our append.
            debug!(expected = record.month, index, "renumbering created record");
            record.month = index as i32;
            data.update(index, record)?;
        }
        *record = data.read(index)?;
        Ok(index)
    }

    fn log_reply(&mut self) -> Result<()> {
        debug!(peer = %self.peer, "received request for log");
        let count = match self.files.log.count() {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "could not count log entries");
                return self.conn.write_message(&LogMessage::failed());
            }
        };
        for i in 0..count {
            match self.files.log.read(i) {
                Ok(entry) => self.conn.write_message(&LogMessage::entry(entry))?,
                Err(e) => warn!(entry = i, error = %e, "skipping unreadable log entry"),
            }
        }
        self.conn.write_message(&LogMessage::done())
    }

    fn write_log(&self, action: Action, arg: i32) {
        let entry = ServerLogEntry::new(self.peer, LogEntry::new(action, arg));
        if let Err(e) = self.files.log.append(&entry) {
            error!(error = %e, "error writing to log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{self, Cursor};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tempfile::{tempdir, TempDir};
    use zerocopy::IntoBytes;

    use recstore::RecStoreError;

    /// Scripted client: requests go in, replies pile up.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        bank: Option<SemaphoreBank>,
        files: ServerFiles,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(bank) = self.bank.take() {
                let _ = bank.destroy();
            }
        }
    }

    static NEXT_KEY: AtomicI32 = AtomicI32::new(0);

    fn fixture(records: &[MarketShare]) -> Result<Fixture> {
        let dir = tempdir()?;
        let cfg = ServerConfig {
            data_file: dir.path().join("out.bin"),
            log_file: dir.path().join("log.ser"),
            ..Default::default()
        };
        File::create(&cfg.data_file)?;
        let key = 0x5300_0000
            | ((std::process::id() as i32 & 0xffff) << 8)
            | NEXT_KEY.fetch_add(1, Ordering::SeqCst);
        let bank = SemaphoreBank::create_or_attach(key, GROUPS)?;
        let files = ServerFiles::open(&cfg, &bank)?;
        for record in records {
            files.data.append(record)?;
        }
        Ok(Fixture { _dir: dir, bank: Some(bank), files })
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40001)
    }

    fn month(m: i32, android: f32) -> MarketShare {
        MarketShare { month: m, android, ios: 100.0 - android, kaios: 0.0, other: 0.0 }
    }

    fn serve(files: &ServerFiles, requests: &[RecordMessage]) -> Result<Vec<u8>> {
        let input: Vec<u8> = requests.iter().flat_map(|r| r.as_bytes().to_vec()).collect();
        let script = Script { input: Cursor::new(input), output: Vec::new() };
        let mut session = Session::new(Connection::new(script), peer(), files);
        session.run()?;
        Ok(session.conn.into_inner().output)
    }

    fn replies(bytes: Vec<u8>) -> Result<Vec<RecordMessage>> {
        let mut conn = Connection::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(reply) = conn.read_message::<RecordMessage>()? {
            out.push(reply);
        }
        Ok(out)
    }

    #[test]
    fn count_read_and_update() -> Result<()> {
        let fx = fixture(&[month(0, 70.0), month(1, 71.0)])?;
        let out = serve(
            &fx.files,
            &[
                RecordMessage::request(Action::Count, 0),
                RecordMessage::request(Action::Read, 1),
                RecordMessage::new(Action::Update, 0, month(0, 5.0)),
                RecordMessage::new(Action::Update, 2, month(2, 5.0)),
                RecordMessage::request(Action::Read, -4),
            ],
        )?;
        let got = replies(out)?;
        assert_eq!(got.len(), 5);
        assert_eq!((got[0].action(), got[0].arg), (Some(Action::Count), 2));
        assert_eq!(got[1].record, month(1, 71.0));
        assert_eq!(got[2].record, month(0, 5.0));
        assert!(got[3].is_failure(), "updating past the end must fail");
        assert!(got[4].is_failure());
        assert_eq!(fx.files.data.read(0)?, month(0, 5.0));
        Ok(())
    }

    #[test]
    fn create_numbers_the_record_by_position() -> Result<()> {
        let fx = fixture(&[month(0, 70.0)])?;
        let out = serve(&fx.files, &[RecordMessage::new(Action::Create, 0, month(99, 60.0))])?;
        let got = replies(out)?;
        assert_eq!(got[0].arg, 1);
        assert_eq!(got[0].record, month(1, 60.0));
        assert_eq!(fx.files.data.count()?, 2);
        Ok(())
    }

    #[test]
    fn session_is_logged_from_connect_to_disconnect() -> Result<()> {
        let fx = fixture(&[month(0, 70.0)])?;
        serve(
            &fx.files,
            &[RecordMessage::request(Action::Read, 0), RecordMessage { action: 42, ..Default::default() }],
        )?;
        let actions: Vec<i32> = fx.files.log.read_all()?.iter().map(|e| e.log.action).collect();
        assert_eq!(
            actions,
            vec![Action::Log.code(), Action::Read.code(), Action::Disconnect.code()]
        );
        assert_eq!(fx.files.log.read(0)?.ip(), Some(Ipv4Addr::LOCALHOST));
        Ok(())
    }

    #[test]
    fn log_request_streams_entries_then_done() -> Result<()> {
        let fx = fixture(&[])?;
        let out = serve(&fx.files, &[RecordMessage::request(Action::Log, 0)])?;
        let mut conn = Connection::new(Cursor::new(out));
        // Only the connect entry exists while the listing is produced.
        let first = conn.read_message::<LogMessage>()?.expect("one entry");
        assert_eq!(first.arg, LogMessage::MORE);
        assert_eq!(first.entry.log, LogEntry::new(Action::Log, 0));
        let last = conn.read_message::<LogMessage>()?.expect("terminator");
        assert_eq!(last.arg, LogMessage::DONE);
        assert!(conn.read_message::<LogMessage>()?.is_none());
        Ok(())
    }

    #[test]
    fn truncated_request_ends_the_session_with_an_error() -> Result<()> {
        let fx = fixture(&[])?;
        let script = Script { input: Cursor::new(vec![1, 0, 0]), output: Vec::new() };
        let mut session = Session::new(Connection::new(script), peer(), &fx.files);
        assert!(matches!(session.run(), Err(RecStoreError::Io(_))));
        Ok(())
    }
}
