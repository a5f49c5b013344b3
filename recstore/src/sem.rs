//! Readers-writers locks built on a System V semaphore bank.
//!
//! A bank created for `n` groups holds `n * 3` semaphores. Group `g` owns
//! slots `3g..3g + 3`:
//!
//! ```text
//! slot 3g + 0   reader-count mutex     (initial 1)
//! slot 3g + 1   active reader count    (initial 0)
//! slot 3g + 2   write exclusion        (initial 1)
//! ```
//!
//! Several unrelated resources share one bank by using different groups.
//! Nothing here is reference counted: whoever decides it is the last user
//! removes the bank with [`SemaphoreBank::destroy`] or
//! [`WriteGuard::destroy_bank`].

use std::io;

use libc::{c_int, c_short, c_ushort};
use tracing::{debug, error};

use crate::errors::{RecStoreError, Result};

pub const SLOTS_PER_GROUP: usize = 3;

const READ_COUNT_MUTEX: usize = 0;
const READ_COUNT: usize = 1;
const WRITE_SEM: usize = 2;

const INITIAL_VALUES: [c_ushort; SLOTS_PER_GROUP] = [1, 0, 1];

const ATTACH_ATTEMPTS: u32 = 50;

pub type SemKey = libc::key_t;

fn semop(set_id: c_int, slot: usize, delta: c_short, flags: c_short) -> Result<()> {
    let mut op = libc::sembuf {
        sem_num: slot as c_ushort,
        sem_op: delta,
        sem_flg: flags,
    };
    loop {
        if unsafe { libc::semop(set_id, &mut op, 1) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(RecStoreError::Semaphore { op: "semop", source: err });
        }
    }
}

#[inline]
fn wait(set_id: c_int, slot: usize) -> Result<()> {
    semop(set_id, slot, -1, 0)
}

#[inline]
fn signal(set_id: c_int, slot: usize) -> Result<()> {
    semop(set_id, slot, 1, 0)
}

fn get_value(set_id: c_int, slot: usize) -> Result<i32> {
    let value = unsafe { libc::semctl(set_id, slot as c_int, libc::GETVAL) };
    if value == -1 {
        return Err(RecStoreError::last_semaphore_error("semctl(GETVAL)"));
    }
    Ok(value)
}

pub(crate) fn remove_bank(set_id: c_int) -> Result<()> {
    if unsafe { libc::semctl(set_id, 0, libc::IPC_RMID) } == -1 {
        return Err(RecStoreError::last_semaphore_error("semctl(IPC_RMID)"));
    }
    debug!(set_id, "removed semaphore bank");
    Ok(())
}

/// Handle to a whole semaphore bank.
#[derive(Debug)]
pub struct SemaphoreBank {
    id: c_int,
    groups: usize,
}

impl SemaphoreBank {
    /// Creates the bank for `key`, or attaches to it when another process got
    /// there first.
    ///
    /// The creator sets every slot with a single `SETALL`. Until that happens
    /// every slot reads 0, so an attacher that cycles group 0's reader-count
    /// mutex blocks until initialization is complete.
    ///
    /// A bank removed between the failed exclusive create and the attach is
    /// not an error; creation is tried again.
    pub fn create_or_attach(key: SemKey, groups: usize) -> Result<SemaphoreBank> {
        if groups == 0 {
            return Err(RecStoreError::Logic("a semaphore bank needs at least one group".into()));
        }
        for attempt in 1..=ATTACH_ATTEMPTS {
            if let Some(bank) = Self::create_or_attach_once(key, groups)? {
                return Ok(bank);
            }
            debug!(key, attempt, "semaphore bank vanished while attaching, retrying");
        }
        Err(RecStoreError::Logic(format!(
            "semaphore bank {} kept vanishing after {} attempts",
            key, ATTACH_ATTEMPTS
        )))
    }

    fn create_or_attach_once(key: SemKey, groups: usize) -> Result<Option<SemaphoreBank>> {
        let nsems = (groups * SLOTS_PER_GROUP) as c_int;

        let id = unsafe { libc::semget(key, nsems, 0o600 | libc::IPC_CREAT | libc::IPC_EXCL) };
        if id != -1 {
            let values: Vec<c_ushort> = INITIAL_VALUES
                .iter()
                .copied()
                .cycle()
                .take(nsems as usize)
                .collect();
            if unsafe { libc::semctl(id, 0, libc::SETALL, values.as_ptr()) } == -1 {
                let err = RecStoreError::last_semaphore_error("semctl(SETALL)");
                // Attachers blocked on slot 0 wake up with EIDRM instead of seeing a half-built bank.
                let _ = remove_bank(id);
                return Err(err);
            }
            debug!(key, id, groups, "created semaphore bank");
            return Ok(Some(SemaphoreBank { id, groups }));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(RecStoreError::Semaphore { op: "semget", source: err });
        }
        match Self::attach(key, nsems)? {
            Some(id) => {
                debug!(key, id, groups, "attached to semaphore bank");
                Ok(Some(SemaphoreBank { id, groups }))
            }
            None => Ok(None),
        }
    }

    /// Opens an existing bank and waits out its initialization. `None` when
    /// the bank was removed before or during the wait.
    fn attach(key: SemKey, nsems: c_int) -> Result<Option<c_int>> {
        let id = unsafe { libc::semget(key, nsems, 0o600) };
        if id == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(RecStoreError::Semaphore { op: "semget", source: err });
        }
        let cycled = wait(id, READ_COUNT_MUTEX).and_then(|()| signal(id, READ_COUNT_MUTEX));
        match cycled {
            Ok(()) => Ok(Some(id)),
            Err(RecStoreError::Semaphore { ref source, .. })
                if matches!(source.raw_os_error(), Some(libc::EIDRM) | Some(libc::EINVAL)) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Lock handle for slot group `group`.
    pub fn group(&self, group: usize) -> Result<RwSemaphore> {
        if group >= self.groups {
            return Err(RecStoreError::Logic(format!(
                "slot group {} out of range for a bank of {} groups",
                group, self.groups
            )));
        }
        Ok(RwSemaphore::new(self.id, group))
    }

    /// Removes the bank. Every other holder's next lock call fails.
    pub fn destroy(self) -> Result<()> {
        remove_bank(self.id)
    }
}

/// One readers-writers lock: a slot group inside a bank.
///
/// Holds no state of its own, so it is handed to stores and registries by
/// value. Fairness is whatever the kernel's per-semaphore wait queues give;
/// a steady stream of readers can starve a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwSemaphore {
    set_id: c_int,
    group: usize,
}

impl RwSemaphore {
    pub fn new(set_id: c_int, group: usize) -> RwSemaphore {
        RwSemaphore { set_id, group }
    }

    pub fn set_id(&self) -> c_int {
        self.set_id
    }

    pub fn group(&self) -> usize {
        self.group
    }

    #[inline]
    fn slot(&self, offset: usize) -> usize {
        self.group * SLOTS_PER_GROUP + offset
    }

    fn under_count_mutex<F>(&self, f: F) -> Result<()>
        where F: FnOnce() -> Result<()>,
    {
        wait(self.set_id, self.slot(READ_COUNT_MUTEX))?;
        let result = f();
        signal(self.set_id, self.slot(READ_COUNT_MUTEX))?;
        result
    }

    /// Reader entry. The first reader in also takes the write semaphore.
    pub fn acquire_shared(&self) -> Result<()> {
        self.under_count_mutex(|| {
            signal(self.set_id, self.slot(READ_COUNT))?;
            if get_value(self.set_id, self.slot(READ_COUNT))? == 1 {
                wait(self.set_id, self.slot(WRITE_SEM))?;
            }
            Ok(())
        })
    }

    /// Reader exit. The last reader out hands the write semaphore back.
    pub fn release_shared(&self) -> Result<()> {
        self.under_count_mutex(|| {
            semop(self.set_id, self.slot(READ_COUNT), -1, libc::IPC_NOWAIT as c_short).map_err(
                |e| match e {
                    RecStoreError::Semaphore { ref source, .. }
                        if source.raw_os_error() == Some(libc::EAGAIN) =>
                    {
                        RecStoreError::Logic("shared release without a matching acquire".into())
                    }
                    other => other,
                },
            )?;
            if get_value(self.set_id, self.slot(READ_COUNT))? == 0 {
                signal(self.set_id, self.slot(WRITE_SEM))?;
            }
            Ok(())
        })
    }

    pub fn acquire_exclusive(&self) -> Result<()> {
        wait(self.set_id, self.slot(WRITE_SEM))
    }

    pub fn release_exclusive(&self) -> Result<()> {
        signal(self.set_id, self.slot(WRITE_SEM))
    }

    pub fn read_lock(&self) -> Result<ReadGuard<'_>> {
        self.acquire_shared()?;
        Ok(ReadGuard { sem: self })
    }

    pub fn write_lock(&self) -> Result<WriteGuard<'_>> {
        self.acquire_exclusive()?;
        Ok(WriteGuard { sem: self })
    }

    pub fn with_shared<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce() -> R,
    {
        let _guard = self.read_lock()?;
        Ok(f())
    }

    pub fn with_exclusive<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce() -> R,
    {
        let _guard = self.write_lock()?;
        Ok(f())
    }

    /// Current `[reader-count mutex, reader count, write]` values.
    pub fn values(&self) -> Result<[i32; SLOTS_PER_GROUP]> {
        Ok([
            get_value(self.set_id, self.slot(READ_COUNT_MUTEX))?,
            get_value(self.set_id, self.slot(READ_COUNT))?,
            get_value(self.set_id, self.slot(WRITE_SEM))?,
        ])
    }

    /// Removes the whole bank this group lives in, not just the group.
    pub fn destroy(self) -> Result<()> {
        remove_bank(self.set_id)
    }
}

#[must_use = "the shared lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    sem: &'a RwSemaphore,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release_shared() {
            error!(set_id = self.sem.set_id, group = self.sem.group, error = %e, "failed to release shared lock");
        }
    }
}

#[must_use = "the exclusive lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    sem: &'a RwSemaphore,
}

impl WriteGuard<'_> {
    /// Removes the bank while still holding the write lock, instead of
    /// releasing it. Used by the last process out.
    pub fn destroy_bank(self) -> Result<()> {
        let set_id = self.sem.set_id;
        std::mem::forget(self);
        remove_bank(set_id)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.release_exclusive() {
            error!(set_id = self.sem.set_id, group = self.sem.group, error = %e, "failed to release exclusive lock");
        }
    }
}
