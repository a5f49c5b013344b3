//! Machine-local table of attached processes in POSIX shared memory.
//!
//! Segment layout:
//!
//! ```text
//! offset 0              live process counter (i32)
//! offset CELLS_OFFSET   [ProcessCell; capacity]
//! ```
//!
//! The first process to attach creates the segment, the last one to detach
//! unlinks it and removes the semaphore bank it was handed. The counter
//! always equals the number of occupied cells.
//!
//! Detaching is decrement, check, then destroy. A process attaching between
//! the last decrement and the destroy maps a segment that is about to be
//! unlinked and a bank that is about to disappear; its next lock call fails.

use std::mem::{align_of, size_of};
use std::ptr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, error, info};

use crate::config::RegistryConfig;
use crate::errors::{RecStoreError, Result};
use crate::sem::RwSemaphore;

#[repr(C)]
struct Header {
    live_processes: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ProcessCell {
    occupied: u32,
    pid: i32,
    command_count: u32,
    start_time: i64,
    last_command_time: i64,
}

const EMPTY_CELL: ProcessCell = ProcessCell {
    occupied: 0,
    pid: 0,
    command_count: 0,
    start_time: 0,
    last_command_time: 0,
};

const OPEN_ATTEMPTS: u32 = 50;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(2);

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

const CELLS_OFFSET: usize = align_up(size_of::<Header>(), align_of::<ProcessCell>());

pub const fn segment_size(capacity: usize) -> usize {
    CELLS_OFFSET + capacity * size_of::<ProcessCell>()
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Snapshot of one occupied cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub slot: usize,
    pub pid: i32,
    pub command_count: u32,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds.
    pub last_command_time: i64,
}

impl ProcessDescriptor {
    pub fn started_at(&self) -> SystemTime {
        to_system_time(self.start_time)
    }

    pub fn last_command_at(&self) -> SystemTime {
        to_system_time(self.last_command_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Other processes are still attached.
    Remaining(usize),
    /// This was the last process: segment and semaphore bank are gone.
    Destroyed,
}

struct Segment {
    shmem: Shmem,
    capacity: usize,
}

// Every accessor below must be called with the registry lock held.
impl Segment {
    fn header(&self) -> *mut Header {
        self.shmem.as_ptr() as *mut Header
    }

    fn cell(&self, index: usize) -> *mut ProcessCell {
        assert!(index < self.capacity, "cell {} out of range ({})", index, self.capacity);
        unsafe { (self.shmem.as_ptr().add(CELLS_OFFSET) as *mut ProcessCell).add(index) }
    }

    fn live_processes(&self) -> i32 {
        unsafe { (*self.header()).live_processes }
    }

    fn add_live(&self, delta: i32) -> i32 {
        unsafe {
            let header = self.header();
            (*header).live_processes += delta;
            (*header).live_processes
        }
    }

    fn read_cell(&self, index: usize) -> ProcessCell {
        unsafe { ptr::read(self.cell(index)) }
    }

    fn write_cell(&self, index: usize, cell: ProcessCell) {
        unsafe { ptr::write(self.cell(index), cell) }
    }

    fn zero(&self) {
        unsafe { ptr::write_bytes(self.shmem.as_ptr(), 0, segment_size(self.capacity)) }
    }
}

pub struct Registry {
    segment: Option<Segment>,
    lock: RwSemaphore,
    pid: i32,
    acquired: usize,
}

impl Registry {
    /// Maps the table, creating it if this is the first process, and takes a
    /// free cell for `pid`.
    ///
    /// Fails with [`RecStoreError::RegistryFull`] when every cell is taken.
    pub fn attach(config: &RegistryConfig, pid: i32, lock: RwSemaphore) -> Result<Registry> {
        let capacity = config.capacity;
        if capacity == 0 {
            return Err(RecStoreError::Logic("registry capacity must be at least 1".into()));
        }
        let os_id = config.segment_id();
        let size = segment_size(capacity);

        let (shmem, created) = Self::create_or_open(&os_id, size)?;
        let mut segment = Segment { shmem, capacity };

        if created {
            if let Err(e) = Self::initialize(&segment, &lock) {
                segment.shmem.set_owner(true);
                return Err(e);
            }
            debug!(os_id = %os_id, capacity, "created process registry");
        }

        let acquired = Self::acquire_cell(&segment, &lock, pid)?;
        info!(os_id = %os_id, pid, slot = acquired, "attached to process registry");
        Ok(Registry { segment: Some(segment), lock, pid, acquired })
    }

    /// Exclusive create, falling back to opening the existing segment. An
    /// open can catch a creator between `shm_open` and sizing the mapping, or
    /// a segment just unlinked by a last detacher; both are retried.
    fn create_or_open(os_id: &str, size: usize) -> Result<(Shmem, bool)> {
        let mut attempt = 0;
        loop {
            match ShmemConf::new().os_id(os_id).size(size).create() {
                Ok(mut shmem) => {
                    // Unlinking is decided by the last detacher, not by whoever created it.
                    shmem.set_owner(false);
                    return Ok((shmem, true));
                }
                Err(ShmemError::MappingIdExists) => {}
                Err(e) => return Err(e.into()),
            }
            let opened = ShmemConf::new().os_id(os_id).open();
            attempt += 1;
            match opened {
                Ok(shmem) if shmem.len() >= size => return Ok((shmem, false)),
                Ok(shmem) if attempt >= OPEN_ATTEMPTS => {
                    return Err(RecStoreError::Logic(format!(
                        "registry segment {} holds {} bytes, {} needed",
                        os_id,
                        shmem.len(),
                        size
                    )))
                }
                Err(e) if attempt >= OPEN_ATTEMPTS => return Err(e.into()),
                _ => {
                    debug!(os_id, attempt, "registry segment not ready, retrying");
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }
    }

    fn initialize(segment: &Segment, lock: &RwSemaphore) -> Result<()> {
        let _guard = lock.write_lock()?;
        // A process that attached before us already took a cell in the fresh,
        // zero-filled mapping; wiping it would lose that cell.
        if segment.live_processes() == 0 {
            segment.zero();
        }
        Ok(())
    }

    fn acquire_cell(segment: &Segment, lock: &RwSemaphore, pid: i32) -> Result<usize> {
        let _guard = lock.write_lock()?;
        for index in 0..segment.capacity {
            if segment.read_cell(index).occupied == 0 {
                let t = now();
                segment.write_cell(
                    index,
                    ProcessCell {
                        occupied: 1,
                        pid,
                        command_count: 0,
                        start_time: t,
                        last_command_time: t,
                    },
                );
                segment.add_live(1);
                return Ok(index);
            }
        }
        Err(RecStoreError::RegistryFull { capacity: segment.capacity })
    }

    fn segment(&self) -> Result<&Segment> {
        self.segment
            .as_ref()
            .ok_or_else(|| RecStoreError::Logic("registry already detached".into()))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Cell held by this process. Fixed for the life of the attachment.
    pub fn acquired_index(&self) -> usize {
        self.acquired
    }

    pub fn lock(&self) -> &RwSemaphore {
        &self.lock
    }

    /// Bumps this process's command count and last-command time.
    pub fn log_command(&self) -> Result<()> {
        let segment = self.segment()?;
        let _guard = self.lock.write_lock()?;
        let mut cell = segment.read_cell(self.acquired);
        cell.command_count += 1;
        cell.last_command_time = now();
        segment.write_cell(self.acquired, cell);
        Ok(())
    }

    /// Occupied cells in slot order, copied out under the shared lock.
    pub fn list_occupied(&self) -> Result<Vec<ProcessDescriptor>> {
        let segment = self.segment()?;
        let _guard = self.lock.read_lock()?;
        Ok((0..segment.capacity)
            .filter_map(|slot| {
                let cell = segment.read_cell(slot);
                (cell.occupied != 0).then(|| ProcessDescriptor {
                    slot,
                    pid: cell.pid,
                    command_count: cell.command_count,
                    start_time: cell.start_time,
                    last_command_time: cell.last_command_time,
                })
            })
            .collect())
    }

    pub fn live_count(&self) -> Result<usize> {
        let segment = self.segment()?;
        let _guard = self.lock.read_lock()?;
        Ok(segment.live_processes().max(0) as usize)
    }

    /// Frees this process's cell. The last process out also unlinks the
    /// segment and removes the semaphore bank.
    pub fn detach(mut self) -> Result<Detached> {
        self.release()
    }

    fn release(&mut self) -> Result<Detached> {
        let mut segment = self.segment.take().ok_or_else(|| {
            RecStoreError::Logic("registry already detached".into())
        })?;
        let guard = self.lock.write_lock()?;
        segment.write_cell(self.acquired, EMPTY_CELL);
        let remaining = segment.add_live(-1);
        if remaining > 0 {
            drop(guard);
            debug!(pid = self.pid, slot = self.acquired, remaining, "detached from process registry");
            return Ok(Detached::Remaining(remaining as usize));
        }

        let os_id = segment.shmem.get_os_id().to_string();
        segment.shmem.set_owner(true);
        drop(segment);
        guard.destroy_bank()?;
        info!(os_id = %os_id, pid = self.pid, "last process out, registry and semaphores removed");
        Ok(Detached::Destroyed)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.segment.is_some() {
            if let Err(e) = self.release() {
                error!(pid = self.pid, error = %e, "failed to detach from process registry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{registry_config, ScratchBank};

    #[test]
    fn cells_start_on_an_aligned_offset() {
        assert_eq!(CELLS_OFFSET % align_of::<ProcessCell>(), 0);
        assert!(CELLS_OFFSET >= size_of::<Header>());
        assert_eq!(segment_size(0), CELLS_OFFSET);
        assert_eq!(segment_size(3), CELLS_OFFSET + 3 * size_of::<ProcessCell>());
    }

    #[test]
    fn first_attach_takes_slot_zero() -> Result<()> {
        let cfg = registry_config(3);
        let bank = ScratchBank::new(1)?;
        let registry = Registry::attach(&cfg, 100, bank.group(0)?)?;
        assert_eq!(registry.acquired_index(), 0);
        assert_eq!(registry.live_count()?, 1);

        let listed = registry.list_occupied()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pid, 100);
        assert_eq!(listed[0].command_count, 0);
        assert_eq!(listed[0].start_time, listed[0].last_command_time);
        assert_eq!(registry.detach()?, Detached::Destroyed);
        Ok(())
    }

    #[test]
    fn log_command_counts_and_stamps() -> Result<()> {
        let cfg = registry_config(2);
        let bank = ScratchBank::new(1)?;
        let registry = Registry::attach(&cfg, 7, bank.group(0)?)?;
        registry.log_command()?;
        registry.log_command()?;
        let me = &registry.list_occupied()?[0];
        assert_eq!(me.command_count, 2);
        assert!(me.last_command_time >= me.start_time);
        assert!(me.last_command_at() >= me.started_at());
        Ok(())
    }

    #[test]
    fn snapshot_does_not_follow_later_changes() -> Result<()> {
        let cfg = registry_config(3);
        let bank = ScratchBank::new(1)?;
        let a = Registry::attach(&cfg, 1, bank.group(0)?)?;
        let before = a.list_occupied()?;
        let b = Registry::attach(&cfg, 2, bank.group(0)?)?;
        assert_eq!(before.len(), 1);
        assert_eq!(a.list_occupied()?.len(), 2);
        drop(b);
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() -> Result<()> {
        let cfg = registry_config(0);
        let bank = ScratchBank::new(1)?;
        assert!(matches!(
            Registry::attach(&cfg, 1, bank.group(0)?),
            Err(RecStoreError::Logic(_))
        ));
        Ok(())
    }

    #[test]
    fn dropping_an_attached_registry_detaches() -> Result<()> {
        let cfg = registry_config(2);
        let bank = ScratchBank::new(1)?;
        let a = Registry::attach(&cfg, 1, bank.group(0)?)?;
        {
            let b = Registry::attach(&cfg, 2, bank.group(0)?)?;
            assert_eq!(b.acquired_index(), 1);
        }
        assert_eq!(a.live_count()?, 1);
        assert_eq!(a.list_occupied()?[0].pid, 1);
        Ok(())
    }
}
