use std::ffi::CStr;
use std::io;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::sem::SemKey;

pub const DEFAULT_PORT: u16 = 15006;
pub const DEFAULT_REGISTRY_CAPACITY: usize = 50;

/// Where the per-user process table lives and how many processes it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// POSIX shared memory name prefix; must start with `/`.
    pub segment_name: String,
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            segment_name: "/recstore-registry".to_string(),
            capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Segment id for the current user. One table per user per machine.
    pub fn segment_id(&self) -> String {
        format!("{}-{}", self.segment_name, current_uid())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Defaults to the port number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semaphore_key: Option<SemKey>,
    pub data_file: PathBuf,
    pub log_file: PathBuf,
    /// Skip the shutdown confirmation prompt.
    pub quick_exit: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            semaphore_key: None,
            data_file: PathBuf::from("data/out.bin"),
            log_file: PathBuf::from("logs/log.ser"),
            quick_exit: false,
        }
    }
}

impl ServerConfig {
    pub fn semaphore_key(&self) -> SemKey {
        self.semaphore_key.unwrap_or(self.port as SemKey)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub port: u16,
    /// Defaults to the user id, shared by every client of that user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semaphore_key: Option<SemKey>,
    pub log_dir: PathBuf,
    pub registry: RegistryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            semaphore_key: None,
            log_dir: PathBuf::from("logs"),
            registry: RegistryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn semaphore_key(&self) -> SemKey {
        self.semaphore_key.unwrap_or(current_uid() as SemKey)
    }

    /// `{log_dir}/log-{hostname}.cli`
    pub fn log_file(&self) -> io::Result<PathBuf> {
        Ok(self.log_dir.join(format!("log-{}.cli", hostname()?)))
    }
}

pub fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn hostname() -> io::Result<String> {
    let mut buf = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let last = buf.len() - 1;
    buf[last] = 0;
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_key_falls_back_to_port() {
        let mut cfg = ServerConfig { port: 16000, ..Default::default() };
        assert_eq!(cfg.semaphore_key(), 16000);
        cfg.semaphore_key = Some(7);
        assert_eq!(cfg.semaphore_key(), 7);
    }

    #[test]
    fn client_log_is_named_after_the_host() -> io::Result<()> {
        let cfg = ClientConfig { log_dir: PathBuf::from("/tmp/x"), ..Default::default() };
        let path = cfg.log_file()?;
        assert_eq!(path, PathBuf::from(format!("/tmp/x/log-{}.cli", hostname()?)));
        Ok(())
    }

    #[test]
    fn segment_id_is_per_user() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.segment_id(), format!("/recstore-registry-{}", current_uid()));
        assert_eq!(cfg.capacity, DEFAULT_REGISTRY_CAPACITY);
    }
}
