//! Fixed-size record files shared between processes.
//!
//! Record `i` lives at byte offset `i * size_of::<T>()` and the record count
//! is `file length / size_of::<T>()`. Reads and counts run under the shared
//! side of the store's [`RwSemaphore`], appends and updates under the
//! exclusive side. The store never removes the semaphore bank; that belongs
//! to whoever created it.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::marker::PhantomData;
use std::mem;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use tracing::{trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::errors::{RecStoreError, Result};
use crate::sem::RwSemaphore;

/// Flat, fixed-size value that can be stored byte-for-byte.
pub trait Record: FromBytes + IntoBytes + Immutable + Copy {}

impl<T> Record for T where T: FromBytes + IntoBytes + Immutable + Copy {}

pub struct RecordStore<T: Record> {
    file: File,
    lock: RwSemaphore,
    _record: PhantomData<T>,
}

impl<T: Record> RecordStore<T> {
    pub const RECORD_SIZE: usize = mem::size_of::<T>();

    pub fn new(file: File, lock: RwSemaphore) -> Result<RecordStore<T>> {
        if Self::RECORD_SIZE == 0 {
            return Err(RecStoreError::Logic("records must have a non-zero size".into()));
        }
        Ok(RecordStore { file, lock, _record: PhantomData })
    }

    /// Opens an existing file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P, lock: RwSemaphore) -> Result<RecordStore<T>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::new(file, lock)
    }

    /// Opens the file, creating it empty with mode 0600 if it does not exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P, lock: RwSemaphore) -> Result<RecordStore<T>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)?;
        Self::new(file, lock)
    }

    pub fn lock(&self) -> &RwSemaphore {
        &self.lock
    }

    fn offset(index: usize) -> Result<u64> {
        (index as u64)
            .checked_mul(Self::RECORD_SIZE as u64)
            .ok_or_else(|| RecStoreError::Logic(format!("record index {} overflows the file", index)))
    }

    fn end_of_file(&self) -> Result<u64> {
        Ok((&self.file).seek(SeekFrom::End(0))?)
    }

    pub fn count(&self) -> Result<usize> {
        let _guard = self.lock.read_lock()?;
        let len = self.end_of_file()?;
        Ok((len / Self::RECORD_SIZE as u64) as usize)
    }

    /// Reads record `index`. The index is not checked against the current
    /// count; a short read past the end is an error.
    pub fn read(&self, index: usize) -> Result<T> {
        let offset = Self::offset(index)?;
        let _guard = self.lock.read_lock()?;
        let mut record = T::new_zeroed();
        self.file.read_exact_at(record.as_mut_bytes(), offset)?;
        trace!(index, "read record");
        Ok(record)
    }

    /// Appends `record` and returns its index.
    ///
    /// The end-of-file lookup and the write happen under one exclusive hold,
    /// so the returned index is the record's. A failed write is truncated
    /// away again.
    pub fn append(&self, record: &T) -> Result<usize> {
        let _guard = self.lock.write_lock()?;
        let end = self.end_of_file()?;
        if let Err(e) = self.file.write_all_at(record.as_bytes(), end) {
            if let Err(trunc) = self.file.set_len(end) {
                warn!(error = %trunc, len = end, "could not drop partial record after failed append");
            }
            return Err(e.into());
        }
        let index = (end / Self::RECORD_SIZE as u64) as usize;
        trace!(index, "appended record");
        Ok(index)
    }

    /// Overwrites record `index` in place. No existence check is made.
    pub fn update(&self, index: usize, record: &T) -> Result<()> {
        let offset = Self::offset(index)?;
        let _guard = self.lock.write_lock()?;
        self.file.write_all_at(record.as_bytes(), offset)?;
        trace!(index, "updated record");
        Ok(())
    }

    /// Every record, read one at a time after a fresh count.
    pub fn read_all(&self) -> Result<Vec<T>> {
        let count = self.count()?;
        (0..count).map(|i| self.read(i)).collect()
    }
}
