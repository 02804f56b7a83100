//! # Circular Flash Log
//!
//! Append-only ring of pages inside one domain's run of the history region.
//!
//! Power-loss behavior comes entirely from write ordering: a page's identity
//! is committed by its header write, and every item is written before the
//! fragment bit covering it is cleared. After a crash a reader can trust the
//! fragments whose bit is cleared and nothing else.

use tracing::{debug, trace};

use super::layout::{
    item_fragment, item_offset, Domain, PageBitmap, PageHeader, DATA_PAGES, FRAGMENT_SIZE,
    PAGE_HEADER_SIZE, PAGE_ITEMS, PAGE_SIZE,
};
use crate::error::{PwmonError, Result};
use crate::flash::Flash;

/// Flash region holding every domain's pages plus the used-page bitmap
#[derive(Debug)]
pub struct PageStore<F: Flash> {
    flash: F,
    used: PageBitmap,
}

impl<F: Flash> PageStore<F> {
    /// Wrap a flash device large enough for the whole history region
    pub fn new(flash: F) -> Result<Self> {
        if flash.page_size() != PAGE_SIZE || flash.page_count() < DATA_PAGES {
            return Err(PwmonError::Invariant(format!(
                "flash geometry {}x{} cannot hold {} pages of {} bytes",
                flash.page_count(),
                flash.page_size(),
                DATA_PAGES,
                PAGE_SIZE
            )));
        }
        Ok(Self {
            flash,
            used: PageBitmap::new(),
        })
    }

    /// Pages currently holding data
    pub fn used_pages(&self) -> &PageBitmap {
        &self.used
    }

    pub fn is_used(&self, page: usize) -> bool {
        page < DATA_PAGES && self.used.get(page)
    }

    /// Header as currently stored
    pub fn header(&self, page: usize) -> Result<PageHeader> {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        self.flash.read(page, 0, &mut bytes)?;
        Ok(PageHeader::from_bytes(&bytes))
    }

    /// Raw contents of one fragment
    pub fn read_fragment(&self, page: usize, fragment: usize) -> Result<[u8; FRAGMENT_SIZE]> {
        let mut buf = [0u8; FRAGMENT_SIZE];
        self.flash.read(page, fragment * FRAGMENT_SIZE, &mut buf)?;
        Ok(buf)
    }

    pub fn read_item(&self, page: usize, idx: usize) -> Result<u32> {
        Ok(self.flash.read_word(page, item_offset(idx))?)
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Erase `page` and commit a fresh header carrying `sn`
    fn start_page(&mut self, domain: Domain, page: usize, sn: u32) -> Result<()> {
        self.flash.erase_page(page)?;
        if !self.header(page)?.is_erased() {
            return Err(PwmonError::Invariant(format!(
                "page {} sequence field not erased before commit",
                page
            )));
        }
        let header = PageHeader::initial(domain, page, sn);
        self.flash.write_word(page, 0, header.tag_word())?;
        self.flash.write_word(page, 4, header.sn)?;
        let stored = self.header(page)?;
        if stored.sn != sn {
            return Err(PwmonError::Invariant(format!(
                "page {} header readback sn {:#x}, expected {:#x}",
                page, stored.sn, sn
            )));
        }
        self.used.set(page);
        Ok(())
    }

    /// Clear the unused bit of `fragment` with a dedicated header write
    fn mark_fragment_used(&mut self, page: usize, fragment: usize) -> Result<()> {
        let mut header = self.header(page)?;
        header.unused_fragments.remove(fragment);
        self.flash.write_word(page, 0, header.tag_word())?;
        if self.header(page)?.unused_fragments.contains(fragment) {
            return Err(PwmonError::Invariant(format!(
                "page {} fragment {} still marked unused after commit",
                page, fragment
            )));
        }
        Ok(())
    }
}

/// Placement of one log inside the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogParam {
    pub first_page: usize,
    pub page_count: usize,
    pub domain: Domain,
}

/// Cursor state of one circular log
#[derive(Debug, Clone)]
pub struct DataLog {
    param: LogParam,
    first_pg: Option<usize>,
    last_pg: Option<usize>,
    next_item: usize,
    suspended: bool,
}

impl DataLog {
    /// Attach a log to its run of pages. Every page of the run is marked as
    /// holding no data.
    pub fn new<F: Flash>(param: LogParam, store: &mut PageStore<F>) -> Self {
        assert!(param.page_count > 0, "log needs at least one page");
        assert!(
            param.first_page + param.page_count <= DATA_PAGES,
            "log run exceeds the history region"
        );
        for page in param.first_page..param.first_page + param.page_count {
            store.used.clear(page);
        }
        Self {
            param,
            first_pg: None,
            last_pg: None,
            next_item: 0,
            suspended: false,
        }
    }

    pub fn param(&self) -> &LogParam {
        &self.param
    }

    /// Oldest retained page
    pub fn first_page(&self) -> Option<usize> {
        self.first_pg
    }

    /// Page being appended to
    pub fn last_page(&self) -> Option<usize> {
        self.last_pg
    }

    /// Number of pages currently holding this log's data
    pub fn retained_pages(&self) -> usize {
        match (self.first_pg, self.last_pg) {
            (Some(first), Some(last)) if last >= first => last - first + 1,
            (Some(first), Some(last)) => self.param.page_count - (first - last) + 1,
            _ => 0,
        }
    }

    /// Start a new page on the next append
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    fn next_page(&self, page: usize) -> usize {
        let next = page + 1;
        if next >= self.param.first_page + self.param.page_count {
            self.param.first_page
        } else {
            next
        }
    }

    /// Append one item. `sn` becomes the page's sequence number when the item
    /// opens a new page.
    pub fn append_item<F: Flash>(
        &mut self,
        store: &mut PageStore<F>,
        item: u32,
        sn: u32,
    ) -> Result<()> {
        let page = match self.last_pg {
            Some(page) if self.next_item < PAGE_ITEMS && !self.suspended && self.next_item > 0 => page,
            _ => self.open_page(store, sn)?,
        };

        store.flash.write_word(page, item_offset(self.next_item), item)?;
        let fragment = item_fragment(self.next_item);
        self.next_item += 1;
        if store.header(page)?.unused_fragments.contains(fragment) {
            store.mark_fragment_used(page, fragment)?;
        }
        trace!(page, item = self.next_item - 1, sn, "item appended");
        Ok(())
    }

    fn open_page<F: Flash>(&mut self, store: &mut PageStore<F>, sn: u32) -> Result<usize> {
        let page = match self.last_pg {
            None => {
                if self.next_item != 0 {
                    return Err(PwmonError::Invariant(
                        "item cursor set without an active page".to_string(),
                    ));
                }
                self.first_pg = Some(self.param.first_page);
                self.param.first_page
            }
            Some(last) => {
                let next = self.next_page(last);
                if Some(next) == self.first_pg {
                    self.first_pg = Some(self.next_page(next));
                    debug!(
                        domain = self.param.domain.name(),
                        evicted = next,
                        "log wrapped, oldest page evicted"
                    );
                }
                next
            }
        };
        self.last_pg = Some(page);
        self.next_item = 0;
        self.suspended = false;
        store.start_page(self.param.domain, page, sn)?;
        debug!(domain = self.param.domain.name(), page, sn, "page started");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::FragmentMask;
    use crate::flash::{FlashError, RamFlash};

    fn store() -> PageStore<RamFlash> {
        PageStore::new(RamFlash::new(DATA_PAGES, PAGE_SIZE)).unwrap()
    }

    fn param(first_page: usize, page_count: usize) -> LogParam {
        LogParam {
            first_page,
            page_count,
            domain: Domain::Battery,
        }
    }

    #[test]
    fn test_rejects_small_flash() {
        assert!(PageStore::new(RamFlash::new(DATA_PAGES - 1, PAGE_SIZE)).is_err());
        assert!(PageStore::new(RamFlash::new(DATA_PAGES, 512)).is_err());
    }

    #[test]
    fn test_first_item_commits_header() {
        let mut store = store();
        let mut log = DataLog::new(param(10, 3), &mut store);
        assert!(store.header(10).unwrap().is_erased());

        log.append_item(&mut store, 0xAABB_CCDD, 42).unwrap();

        let header = store.header(10).unwrap();
        assert_eq!(header.sn, 42);
        assert_eq!(header.domain, Domain::Battery as u8);
        assert_eq!(header.page_idx, 10);
        assert_eq!(header.unused_fragments, FragmentMask(0xFE));
        assert_eq!(store.read_item(10, 0).unwrap(), 0xAABB_CCDD);
        assert!(store.is_used(10));
        assert!(!store.is_used(11));
    }

    #[test]
    fn test_fragment_bits_follow_items() {
        let mut store = store();
        let mut log = DataLog::new(param(0, 2), &mut store);
        for i in 0..30 {
            log.append_item(&mut store, i, 0).unwrap();
        }
        // Items 0..30 end exactly at the fragment 0 boundary
        assert_eq!(store.header(0).unwrap().unused_fragments, FragmentMask(0xFE));

        log.append_item(&mut store, 30, 0).unwrap();
        assert_eq!(store.header(0).unwrap().unused_fragments, FragmentMask(0xFC));

        for i in 31..PAGE_ITEMS as u32 {
            log.append_item(&mut store, i, 0).unwrap();
        }
        assert_eq!(store.header(0).unwrap().unused_fragments, FragmentMask(0x00));
        assert_eq!(log.last_page(), Some(0));
    }

    #[test]
    fn test_full_page_moves_to_next_with_item_sn() {
        let mut store = store();
        let mut log = DataLog::new(param(0, 2), &mut store);
        for i in 0..PAGE_ITEMS as u32 + 1 {
            log.append_item(&mut store, i, 1000 + i).unwrap();
        }
        assert_eq!(log.last_page(), Some(1));
        assert_eq!(store.header(1).unwrap().sn, 1000 + PAGE_ITEMS as u32);
        assert_eq!(log.retained_pages(), 2);
    }

    #[test]
    fn test_wrap_evicts_oldest_page() {
        let mut store = store();
        let mut log = DataLog::new(param(5, 3), &mut store);
        let total = PAGE_ITEMS * 7 + 1;
        for i in 0..total as u32 {
            log.append_item(&mut store, i, i).unwrap();
            assert!(log.retained_pages() <= 3);
        }
        // Eight pages were started in a ring of three
        assert_eq!(log.retained_pages(), 3);
        let last = log.last_page().unwrap();
        let first = log.first_page().unwrap();
        assert_eq!(last, 5 + 7 % 3);
        assert_eq!(first, log.next_page(last));

        // The oldest retained page holds the oldest surviving sequence numbers
        let first_sn = store.header(first).unwrap().sn;
        let last_sn = store.header(last).unwrap().sn;
        assert_eq!(last_sn, (PAGE_ITEMS * 7) as u32);
        assert_eq!(first_sn, (PAGE_ITEMS * 5) as u32);
        assert_eq!(store.flash().erase_count(last), 3);
    }

    #[test]
    fn test_suspend_starts_new_page() {
        let mut store = store();
        let mut log = DataLog::new(param(0, 4), &mut store);
        log.append_item(&mut store, 1, 10).unwrap();
        log.append_item(&mut store, 2, 12).unwrap();
        log.suspend();
        log.append_item(&mut store, 3, 50).unwrap();

        assert_eq!(log.last_page(), Some(1));
        assert_eq!(store.header(1).unwrap().sn, 50);
        assert_eq!(store.read_item(1, 0).unwrap(), 3);
    }

    #[test]
    fn test_new_log_clears_only_its_run() {
        let mut store = store();
        let mut a = DataLog::new(param(0, 2), &mut store);
        a.append_item(&mut store, 1, 1).unwrap();
        let _b = DataLog::new(param(2, 2), &mut store);
        assert!(store.is_used(0));

        let _a2 = DataLog::new(param(0, 2), &mut store);
        assert!(!store.is_used(0));
    }

    /// Flash that stops accepting writes after a budget, as on power loss
    struct DyingFlash {
        inner: RamFlash,
        writes_left: usize,
    }

    impl Flash for DyingFlash {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
        fn page_count(&self) -> usize {
            self.inner.page_count()
        }
        fn read(&self, page: usize, offset: usize, buf: &mut [u8]) -> std::result::Result<(), FlashError> {
            self.inner.read(page, offset, buf)
        }
        fn erase_page(&mut self, page: usize) -> std::result::Result<(), FlashError> {
            self.inner.erase_page(page)
        }
        fn write_word(&mut self, page: usize, offset: usize, word: u32) -> std::result::Result<(), FlashError> {
            if self.writes_left == 0 {
                return Err(FlashError::OutOfRange { page, offset });
            }
            self.writes_left -= 1;
            self.inner.write_word(page, offset, word)
        }
    }

    #[test]
    fn test_interrupted_fragment_commit_stays_untrusted() {
        // 2 header words + 30 items with no extra bit writes fill fragment 0.
        // The 31st item lands in fragment 1 but power dies before its bit clears.
        let flash = DyingFlash {
            inner: RamFlash::new(DATA_PAGES, PAGE_SIZE),
            writes_left: 2 + 30 + 1,
        };
        let mut store = PageStore::new(flash).unwrap();
        let mut log = DataLog::new(param(0, 1), &mut store);
        for i in 0..31 {
            log.append_item(&mut store, i, 7).unwrap_or_default();
        }
        let header = store.header(0).unwrap();
        assert_eq!(header.sn, 7);
        assert!(header.unused_fragments.contains(1), "fragment 1 must not be trusted");
        assert!(!header.unused_fragments.contains(0));
        assert_eq!(store.read_item(0, 30).unwrap(), 30);
    }
}
