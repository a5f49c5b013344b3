//! Fixed-size message framing over a byte stream.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::errors::Result;

pub struct Connection<S = TcpStream> {
    stream: S,
}

impl Connection<TcpStream> {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Connection<TcpStream>> {
        Ok(Connection::new(TcpStream::connect(addr)?))
    }

    pub fn peer(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        Connection { stream }
    }

    /// Reads one whole message. `Ok(None)` means the peer closed the stream
    /// between messages; closing mid-message is an error.
    pub fn read_message<M: FromBytes + IntoBytes>(&mut self) -> Result<Option<M>> {
        let mut message = M::new_zeroed();
        let buf = message.as_mut_bytes();
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream closed after {} of {} bytes", filled, buf.len()),
                    )
                    .into())
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(message))
    }

    pub fn write_message<M: IntoBytes + Immutable>(&mut self, message: &M) -> Result<()> {
        self.stream.write_all(message.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
