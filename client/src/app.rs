//! Interactive menu. Every server command is one request and one reply,
//! except the server log listing, which streams until its terminator.

use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

use tracing::{debug, info, warn};

use recstore::connection::Connection;
use recstore::packets::{
    Action, ClientLogEntry, LogEntry, LogMessage, MarketShare, RecordMessage, ServerLogEntry,
};
use recstore::signals::Closing;
use recstore::{RecStoreError, RecordStore, Registry, Result};

use crate::display;

/// Record number that displays every record.
pub const DISPLAY_ALL: i32 = -999;

const MENU: &str = "\
N)New Record
D)Display Record
C)Change Record
S)Show Server Log
L)Show Client Log
P)Show Connected Clients
X)Exit
>>>";

fn input_closed() -> RecStoreError {
    io::Error::new(io::ErrorKind::UnexpectedEof, "input closed").into()
}

fn server_gone() -> RecStoreError {
    io::Error::new(io::ErrorKind::UnexpectedEof, "server disconnected").into()
}

pub struct App<'a, I, O, S> {
    input: I,
    out: O,
    conn: Connection<S>,
    log: &'a RecordStore<ClientLogEntry>,
    registry: &'a Registry,
    closing: Option<Closing>,
}

impl<'a, I, O, S> App<'a, I, O, S>
where
    I: BufRead,
    O: Write,
    S: Read + Write,
{
    pub fn new(
        input: I,
        out: O,
        conn: Connection<S>,
        log: &'a RecordStore<ClientLogEntry>,
        registry: &'a Registry,
    ) -> Self {
        App { input, out, conn, log, registry, closing: None }
    }

    /// Leave the menu once a termination signal has been seen.
    pub fn watch(mut self, closing: Closing) -> Self {
        self.closing = Some(closing);
        self
    }

    pub fn run(&mut self) -> Result<()> {
        writeln!(self.out, "Connected to server.")?;
        writeln!(self.out, "Client PID: {}", self.registry.pid())?;
        display::prompt(&mut self.out, "Monthly Mobile OS Market Shares since Jan. 2020")?;

        loop {
            display::prompt(&mut self.out, MENU)?;
            self.out.flush()?;
            let choice = match self.line()? {
                Some(line) => line.trim().chars().next(),
                None => {
                    debug!("input closed, leaving menu");
                    return Ok(());
                }
            };
            if self.closing.as_ref().map_or(false, Closing::is_closing) {
                info!("termination requested, leaving menu");
                return Ok(());
            }
            let choice = match choice {
                Some(c) => c.to_ascii_uppercase(),
                None => continue,
            };
            match choice {
                'N' => self.create()?,
                'D' => self.display()?,
                'C' => self.change()?,
                'S' => self.server_log()?,
                'L' => self.client_log()?,
                'P' => self.processes()?,
                'X' => return Ok(()),
                _ => writeln!(self.out, "Invalid")?,
            }
        }
    }

    fn line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Prompts until a line parses as `T`.
    fn ask<T: FromStr>(&mut self) -> Result<T> {
        loop {
            write!(self.out, " >>>")?;
            self.out.flush()?;
            let line = self.line()?.ok_or_else(input_closed)?;
            match line.trim().parse() {
                Ok(value) => return Ok(value),
                Err(_) => writeln!(self.out, "Invalid.")?,
            }
        }
    }

    fn ask_share(&mut self, os: &str) -> Result<f32> {
        writeln!(self.out, "Enter Market Share Percentage for {}:", os)?;
        self.ask()
    }

    /// Prompts until the number is in `0..count`, or is [`DISPLAY_ALL`] when
    /// `allow_all` is set.
    fn ask_record(&mut self, count: i32, allow_all: bool) -> Result<i32> {
        loop {
            let choice: i32 = self.ask()?;
            if (allow_all && choice == DISPLAY_ALL) || (0..count).contains(&choice) {
                return Ok(choice);
            }
            writeln!(self.out, "Out of Range.")?;
        }
    }

    fn request(&mut self, message: RecordMessage) -> Result<RecordMessage> {
        self.conn.write_message(&message)?;
        let reply = self.conn.read_message::<RecordMessage>()?.ok_or_else(server_gone)?;
        if reply.action != message.action {
            warn!(sent = message.action, got = reply.action, "reply does not match request");
        }
        Ok(reply)
    }

    fn count(&mut self) -> Result<i32> {
        Ok(self.request(RecordMessage::request(Action::Count, 0))?.arg)
    }

    fn read(&mut self, index: i32) -> Result<Option<MarketShare>> {
        let reply = self.request(RecordMessage::request(Action::Read, index))?;
        if reply.is_failure() {
            return Ok(None);
        }
        self.journal(Action::Read, index)?;
        Ok(Some(reply.record))
    }

    fn display(&mut self) -> Result<()> {
        let count = self.count()?;
        if count <= 0 {
            writeln!(self.out, "Server error retrieving count.")?;
            return Ok(());
        }
        display::prompt(&mut self.out, &format!("Select a Record to Display: [0-{}]", count - 1))?;
        let choice = self.ask_record(count, true)?;
        if choice != DISPLAY_ALL {
            return match self.read(choice)? {
                Some(record) => Ok(display::records(&mut self.out, &[record])?),
                None => Ok(writeln!(self.out, "Server error retrieving record.")?),
            };
        }

        let mut records = Vec::with_capacity(count as usize);
        for i in 0..count {
            match self.read(i)? {
                Some(record) => records.push(record),
                None => {
                    writeln!(self.out, "Server error retrieving record {}.", i)?;
                    break;
                }
            }
        }
        if !records.is_empty() {
            display::records(&mut self.out, &records)?;
        }
        Ok(())
    }

    fn create(&mut self) -> Result<()> {
        display::prompt(&mut self.out, "Creating a new Record")?;
        let record = MarketShare {
            month: 0,
            android: self.ask_share("Android")?,
            ios: self.ask_share("iOS")?,
            kaios: self.ask_share("KaiOS")?,
            other: self.ask_share("Other")?,
        };
        let reply = self.request(RecordMessage::new(Action::Create, 0, record))?;
        if reply.is_failure() {
            writeln!(self.out, "Server error creating record.")?;
            return Ok(());
        }
        writeln!(self.out, "Record Created.")?;
        display::records(&mut self.out, &[reply.record])?;
        self.journal(Action::Create, reply.arg)
    }

    fn change(&mut self) -> Result<()> {
        display::prompt(&mut self.out, "Updating a Record")?;
        let count = self.count()?;
        if count <= 0 {
            writeln!(self.out, "Server error retrieving record count.")?;
            return Ok(());
        }
        writeln!(self.out, "Select a Record to Update: [0-{}]", count - 1)?;
        let index = self.ask_record(count, false)?;
        let mut record = match self.read(index)? {
            Some(record) => record,
            None => {
                writeln!(self.out, "Server error retrieving record {}.", index)?;
                return Ok(());
            }
        };

        loop {
            display::records(&mut self.out, &[record])?;
            write!(
                self.out,
                "Select a Field to Update:\nA)ndroid\nI)OS\nK)aios\nO)ther\nC)onfirm\nX)Exit\n >>>"
            )?;
            self.out.flush()?;
            let field = self.line()?.ok_or_else(input_closed)?;
            match field.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
                Some('A') => record.android = self.ask_share("Android")?,
                Some('I') => record.ios = self.ask_share("iOS")?,
                Some('K') => record.kaios = self.ask_share("KaiOS")?,
                Some('O') => record.other = self.ask_share("Other")?,
                Some('C') => break,
                Some('X') => {
                    writeln!(self.out, "Update Canceled.")?;
                    return Ok(());
                }
                _ => writeln!(self.out, "Invalid")?,
            }
        }

        let reply = self.request(RecordMessage::new(Action::Update, index, record))?;
        if reply.is_failure() {
            writeln!(self.out, "Server error updating record.")?;
            return Ok(());
        }
        writeln!(self.out, "Updated record {}.", reply.arg)?;
        self.journal(Action::Update, reply.arg)?;
        display::records(&mut self.out, &[reply.record])?;
        Ok(())
    }

    fn server_log(&mut self) -> Result<()> {
        self.conn.write_message(&RecordMessage::request(Action::Log, 0))?;
        let mut entries: Vec<ServerLogEntry> = Vec::new();
        loop {
            let message = self.conn.read_message::<LogMessage>()?.ok_or_else(server_gone)?;
            match message.arg {
                LogMessage::DONE => break,
                arg if arg > 0 => entries.push(message.entry),
                _ => {
                    writeln!(self.out, "Server error retrieving logs.")?;
                    return Ok(());
                }
            }
        }
        if entries.is_empty() {
            display::prompt(&mut self.out, "Server log file is empty.")?;
            return Ok(());
        }
        display::prompt(&mut self.out, "Server Logs")?;
        for entry in &entries {
            writeln!(self.out, "{}", entry)?;
        }
        Ok(())
    }

    fn client_log(&mut self) -> Result<()> {
        let entries = self.log.read_all()?;
        if entries.is_empty() {
            writeln!(self.out, "This machine's log file is empty.")?;
            return Ok(());
        }
        display::prompt(&mut self.out, "Client Logs")?;
        for entry in &entries {
            writeln!(self.out, "{}", entry)?;
        }
        Ok(())
    }

    fn processes(&mut self) -> Result<()> {
        display::prompt(&mut self.out, "Connected Clients")?;
        let live = self.registry.live_count()?;
        let table = self.registry.list_occupied()?;
        display::processes(&mut self.out, live, &table)?;
        Ok(())
    }

    /// Records a completed command in the machine log and the process table.
    fn journal(&mut self, action: Action, arg: i32) -> Result<()> {
        let entry = ClientLogEntry::new(self.registry.pid(), LogEntry::new(action, arg));
        if let Err(e) = self.log.append(&entry) {
            warn!(error = %e, "could not append to client log");
            writeln!(self.out, "Error writing to log.")?;
        }
        if let Err(e) = self.registry.log_command() {
            warn!(error = %e, "could not count command in process table");
        }
        Ok(())
    }
}
