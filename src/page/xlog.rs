use arrayvec::ArrayVec;

use super::{PageWriteGuard, Relation, RumPage};

pub const MAX_GENERIC_XLOG_PAGES: usize = 4;

/// Atomic multi-page modification. Registered pages are edited through
/// private copies; [`GenericXLog::finish`] installs every copy at once with
/// a fresh LSN. Dropping the action without finishing leaves all pages
/// untouched.
pub struct GenericXLog<'a> {
    rel: &'a Relation,
    pages: ArrayVec<(&'a mut PageWriteGuard, Box<RumPage>), MAX_GENERIC_XLOG_PAGES>,
}

impl<'a> GenericXLog<'a> {
    pub fn start(rel: &'a Relation) -> Self {
        Self {
            rel,
            pages: ArrayVec::new(),
        }
    }

    /// Registers a locked page. With `full_image` the copy starts zeroed and
    /// the caller is expected to rewrite it entirely.
    pub fn register(&mut self, page: &'a mut PageWriteGuard, full_image: bool) -> usize {
        let image = if full_image {
            bytemuck::zeroed_box()
        } else {
            Box::new(**page)
        };
        self.pages.push((page, image));
        self.pages.len() - 1
    }

    pub fn page(&self, idx: usize) -> &RumPage {
        &self.pages[idx].1
    }

    pub fn page_mut(&mut self, idx: usize) -> &mut RumPage {
        &mut self.pages[idx].1
    }

    pub fn blkno(&self, idx: usize) -> u32 {
        self.pages[idx].0.blkno()
    }

    pub fn finish(self) -> u64 {
        let lsn = self.rel.next_lsn();
        for (page, mut image) in self.pages {
            image.header.pd_lsn = lsn;
            **page = *image;
        }
        lsn
    }

    pub fn abort(self) {}
}
