use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use super::{RumPage, RUM_PAGE_SIZE};
use crate::error::{RumError, RumResult};

struct BufferDesc {
    blkno: u32,
    page: Arc<RwLock<Box<RumPage>>>,
    pins: AtomicU32,
}

struct RelationData {
    name: String,
    blocks: RwLock<Vec<Arc<BufferDesc>>>,
    fsm: Mutex<BTreeSet<u32>>,
    extension_lock: Mutex<()>,
    backend_local: bool,
    lsn: AtomicU64,
    interrupt_pending: AtomicBool,
    vacuum_delay: Mutex<Option<Duration>>,
    page_combines: Mutex<Vec<(u32, u32)>>,
}

/// Block storage of one index: a shared buffer pool of 8 KiB pages with
/// pins, content locks, a free space map and an extension lock.
#[derive(Clone)]
pub struct Relation {
    inner: Arc<RelationData>,
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.inner.name)
            .field("nblocks", &self.nblocks())
            .finish()
    }
}

impl Relation {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, false)
    }

    /// A relation only visible to the current backend skips the extension lock.
    pub fn with_options(name: impl Into<String>, backend_local: bool) -> Self {
        Self {
            inner: Arc::new(RelationData {
                name: name.into(),
                blocks: RwLock::new(Vec::new()),
                fsm: Mutex::new(BTreeSet::new()),
                extension_lock: Mutex::new(()),
                backend_local,
                lsn: AtomicU64::new(1),
                interrupt_pending: AtomicBool::new(false),
                vacuum_delay: Mutex::new(None),
                page_combines: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn nblocks(&self) -> u32 {
        self.inner.blocks.read().len() as u32
    }

    /// Pins `blkno` without locking it.
    pub fn read_buffer(&self, blkno: u32) -> RumResult<Buffer> {
        let blocks = self.inner.blocks.read();
        let desc = blocks.get(blkno as usize).cloned().ok_or_else(|| {
            RumError::internal(format!(
                "could not read block {} in index \"{}\"",
                blkno, self.inner.name
            ))
            .with_detail(format!("Relation has {} blocks.", blocks.len()))
        })?;
        desc.pins.fetch_add(1, Ordering::AcqRel);
        Ok(Buffer { desc })
    }

    /// Appends a zeroed block and returns it pinned.
    pub fn extend(&self) -> RumResult<Buffer> {
        let _guard = (!self.inner.backend_local).then(|| self.inner.extension_lock.lock());
        let mut blocks = self.inner.blocks.write();
        let blkno = u32::try_from(blocks.len())
            .ok()
            .filter(|&n| n != super::INVALID_BLOCK_NUMBER)
            .ok_or_else(|| RumError::limit_exceeded("cannot extend index beyond 2^32-1 blocks"))?;
        let desc = Arc::new(BufferDesc {
            blkno,
            page: Arc::new(RwLock::new(bytemuck::zeroed_box())),
            pins: AtomicU32::new(1),
        });
        blocks.push(desc.clone());
        Ok(Buffer { desc })
    }

    pub fn record_free_page(&self, blkno: u32) {
        self.inner.fsm.lock().insert(blkno);
    }

    pub fn get_free_page(&self) -> Option<u32> {
        self.inner.fsm.lock().pop_first()
    }

    pub fn free_pages(&self) -> Vec<u32> {
        self.inner.fsm.lock().iter().copied().collect()
    }

    pub(crate) fn next_lsn(&self) -> u64 {
        self.inner.lsn.fetch_add(1, Ordering::AcqRel)
    }

    /// Copy of the current content of `blkno`, taken under a share lock.
    pub fn get_raw_page(&self, blkno: u32) -> RumResult<Vec<u8>> {
        let page = super::page_read(self, blkno)?;
        let raw = page.as_bytes().to_vec();
        debug_assert_eq!(raw.len(), RUM_PAGE_SIZE);
        Ok(raw)
    }

    /// Asks the operations running against this relation to stop at their
    /// next interrupt check.
    pub fn request_cancel(&self) {
        self.inner.interrupt_pending.store(true, Ordering::Release);
    }

    pub fn check_for_interrupts(&self) -> RumResult<()> {
        if self.inner.interrupt_pending.swap(false, Ordering::AcqRel) {
            return Err(RumError::canceled());
        }
        Ok(())
    }

    pub fn set_vacuum_delay(&self, delay: Option<Duration>) {
        *self.inner.vacuum_delay.lock() = delay;
    }

    pub fn vacuum_delay_point(&self) -> RumResult<()> {
        self.check_for_interrupts()?;
        let delay = *self.inner.vacuum_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    /// Records that the key range of `old_blkno` now lives on `new_blkno`.
    pub fn predicate_lock_page_combine(&self, old_blkno: u32, new_blkno: u32) {
        self.inner.page_combines.lock().push((old_blkno, new_blkno));
    }

    pub fn page_combines(&self) -> Vec<(u32, u32)> {
        self.inner.page_combines.lock().clone()
    }
}

/// A pinned page. The pin is released on drop.
pub struct Buffer {
    desc: Arc<BufferDesc>,
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.desc.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            desc: self.desc.clone(),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.desc.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({})", self.desc.blkno)
    }
}

impl Buffer {
    pub fn blkno(&self) -> u32 {
        self.desc.blkno
    }

    pub fn lock_share(self) -> PageReadGuard {
        let guard = self.desc.page.read_arc();
        PageReadGuard {
            guard,
            buffer: self,
        }
    }

    pub fn lock_exclusive(self) -> PageWriteGuard {
        let guard = self.desc.page.write_arc();
        PageWriteGuard {
            guard,
            buffer: self,
        }
    }

    pub fn conditional_lock_exclusive(self) -> Result<PageWriteGuard, Buffer> {
        match self.desc.page.try_write_arc() {
            Some(guard) => Ok(PageWriteGuard {
                guard,
                buffer: self,
            }),
            None => Err(self),
        }
    }

    fn only_pin(&self) -> bool {
        self.desc.pins.load(Ordering::Acquire) == 1
    }

    /// Exclusive lock that additionally requires no other pins on the page.
    pub fn conditional_lock_for_cleanup(self) -> Result<PageWriteGuard, Buffer> {
        match self.conditional_lock_exclusive() {
            Ok(page) if page.buffer.only_pin() => Ok(page),
            Ok(page) => Err(page.unlock()),
            Err(buffer) => Err(buffer),
        }
    }

    /// Waits until this is the only pin on the page, then locks it.
    pub fn lock_for_cleanup(self, rel: &Relation) -> RumResult<PageWriteGuard> {
        let mut buffer = self;
        let mut backoff = Duration::from_micros(50);
        loop {
            let page = buffer.lock_exclusive();
            if page.buffer.only_pin() {
                return Ok(page);
            }
            buffer = page.unlock();
            rel.check_for_interrupts()?;
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }
}

pub struct PageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Box<RumPage>>,
    buffer: Buffer,
}

impl PageReadGuard {
    pub fn blkno(&self) -> u32 {
        self.buffer.blkno()
    }

    /// Releases the lock and keeps the pin.
    pub fn unlock(self) -> Buffer {
        let PageReadGuard { guard, buffer } = self;
        drop(guard);
        buffer
    }
}

impl Deref for PageReadGuard {
    type Target = RumPage;

    fn deref(&self) -> &RumPage {
        &self.guard
    }
}

pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<RumPage>>,
    buffer: Buffer,
}

impl PageWriteGuard {
    pub fn blkno(&self) -> u32 {
        self.buffer.blkno()
    }

    pub fn unlock(self) -> Buffer {
        let PageWriteGuard { guard, buffer } = self;
        drop(guard);
        buffer
    }
}

impl Deref for PageWriteGuard {
    type Target = RumPage;

    fn deref(&self) -> &RumPage {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut RumPage {
        &mut self.guard
    }
}
