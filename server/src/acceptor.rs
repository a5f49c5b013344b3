use std::error::Error;
use std::io::{self, BufRead, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::process;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use recstore::connection::Connection;
use recstore::signals::Closing;
use recstore::{SemaphoreBank, ServerConfig};

use crate::session::{ServerFiles, Session, GROUPS};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serves connections until a confirmed shutdown, then removes the
/// semaphore bank.
pub fn run(cfg: &ServerConfig) -> Result<(), Box<dyn Error>> {
    let closing = Closing::install()?;
    let bank = SemaphoreBank::create_or_attach(cfg.semaphore_key(), GROUPS)?;
    info!(key = cfg.semaphore_key(), id = bank.id(), "semaphore bank ready");

    let files = match ServerFiles::open(cfg, &bank) {
        Ok(files) => files,
        Err(e) => {
            error!(data = %cfg.data_file.display(), log = %cfg.log_file.display(), error = %e, "could not open server files");
            bank.destroy()?;
            return Err(e.into());
        }
    };

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.port))?;
    listener.set_nonblocking(true)?;
    info!(port = cfg.port, "server listening");

    let mut clients = Clients::default();
    loop {
        let last_left = clients.exited(reap_children());
        if last_left {
            info!("last client disconnected");
        }
        if closing.is_closing() || last_left {
            if clients.live() > 0 {
                warn!(children = clients.live(), "clients still connected, ignoring shutdown request");
                closing.reset();
            } else if cfg.quick_exit || confirm_shutdown()? {
                break;
            } else {
                closing.reset();
            }
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                match unsafe { libc::fork() } {
                    -1 => {
                        error!(error = %io::Error::last_os_error(), "could not fork for connection");
                    }
                    0 => {
                        drop(listener);
                        process::exit(serve(stream, addr, &files));
                    }
                    pid => {
                        clients.forked();
                        debug!(pid, peer = %addr, children = clients.live(), "forked connection process");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    info!("shutting down");
    bank.destroy()?;
    Ok(())
}

/// Count of live connection processes.
#[derive(Debug, Default)]
struct Clients {
    live: usize,
}

impl Clients {
    fn forked(&mut self) {
        self.live += 1;
    }

    /// Drops `reaped` processes from the count. True when that took the
    /// count from above zero down to zero, which asks for a shutdown.
    fn exited(&mut self, reaped: usize) -> bool {
        let before = self.live;
        self.live = before.saturating_sub(reaped);
        before > 0 && self.live == 0
    }

    fn live(&self) -> usize {
        self.live
    }
}

/// Body of a connection process. Returns its exit code.
fn serve(stream: TcpStream, addr: SocketAddr, files: &ServerFiles) -> i32 {
    let peer = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(v6) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v6.port()),
    };
    match Session::new(Connection::new(stream), peer, files).run() {
        Ok(()) => 0,
        Err(e) => {
            error!(peer = %peer, error = %e, "session ended with an error");
            1
        }
    }
}

/// Collects every exited child without blocking. Returns how many.
fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return reaped;
        }
        debug!(pid, status, "connection process exited");
        reaped += 1;
    }
}

fn confirm_shutdown() -> io::Result<bool> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Are you sure you want to close the server? (y/n) ");
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(true);
        }
        match line.trim() {
            "y" | "Y" => return Ok(true),
            "n" | "N" => return Ok(false),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_client_out_requests_shutdown() {
        let mut clients = Clients::default();
        clients.forked();
        clients.forked();
        assert!(!clients.exited(1));
        assert_eq!(clients.live(), 1);
        assert!(clients.exited(1));
        assert_eq!(clients.live(), 0);
    }

    #[test]
    fn idle_server_does_not_request_shutdown() {
        let mut clients = Clients::default();
        assert!(!clients.exited(0));
        clients.forked();
        assert!(clients.exited(3), "over-reaping still counts as the last client leaving");
        assert!(!clients.exited(0));
    }
}
