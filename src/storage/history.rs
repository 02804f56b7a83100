//! # History Downsampler
//!
//! Averages raw samples into 16-bit half-items and logs them in pairs.

use super::layout::{Domain, DomainLayout};
use super::log::{DataLog, LogParam, PageStore};
use crate::error::Result;
use crate::flash::Flash;

/// Build-time parameters of one history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryParam {
    pub log: LogParam,
    /// Raw samples averaged into one half-item
    pub item_samples: u32,
}

impl From<&DomainLayout> for HistoryParam {
    fn from(layout: &DomainLayout) -> Self {
        Self {
            log: LogParam {
                first_page: layout.first_page,
                page_count: layout.page_count,
                domain: layout.domain,
            },
            item_samples: layout.item_samples,
        }
    }
}

/// Decimating front end of one domain's log
#[derive(Debug, Clone)]
pub struct History {
    storage: DataLog,
    item_samples: u32,
    slots: [u16; 2],
    /// Next slot to fill; `None` when no item is open
    slot: Option<usize>,
    item_sn: u32,
    samples_sum: u32,
    samples_cnt: u32,
}

impl History {
    pub fn new<F: Flash>(param: HistoryParam, store: &mut PageStore<F>) -> Self {
        assert!(param.item_samples > 0, "decimation factor must be positive");
        Self {
            storage: DataLog::new(param.log, store),
            item_samples: param.item_samples,
            slots: [0; 2],
            slot: None,
            item_sn: 0,
            samples_sum: 0,
            samples_cnt: 0,
        }
    }

    pub fn domain(&self) -> Domain {
        self.storage.param().domain
    }

    pub fn log(&self) -> &DataLog {
        &self.storage
    }

    /// Absorb one raw sample taken at sequence number `sn`
    pub fn put_sample<F: Flash>(
        &mut self,
        store: &mut PageStore<F>,
        sample: u16,
        sn: u32,
    ) -> Result<()> {
        let slot = match self.slot {
            Some(slot) => slot,
            None => {
                self.item_sn = sn;
                self.slot = Some(0);
                0
            }
        };
        self.samples_sum += u32::from(sample);
        self.samples_cnt += 1;
        if self.samples_cnt < self.item_samples {
            return Ok(());
        }

        self.slots[slot] = (self.samples_sum / self.samples_cnt) as u16;
        self.samples_sum = 0;
        self.samples_cnt = 0;
        if slot == 0 {
            self.slot = Some(1);
            return Ok(());
        }

        self.slot = None;
        let item = u32::from(self.slots[0]) | (u32::from(self.slots[1]) << 16);
        self.storage.append_item(store, item, self.item_sn)
    }

    /// Drop the open aggregate and start the next sample on a fresh page
    pub fn suspend(&mut self) {
        self.storage.suspend();
        self.slot = None;
        self.samples_sum = 0;
        self.samples_cnt = 0;
    }
}

/// Split a logged item into its two half-items
pub fn unpack_item(item: u32) -> [u16; 2] {
    [item as u16, (item >> 16) as u16]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use crate::storage::layout::{DATA_PAGES, PAGE_SIZE};

    fn setup(item_samples: u32) -> (PageStore<RamFlash>, History) {
        let mut store = PageStore::new(RamFlash::new(DATA_PAGES, PAGE_SIZE)).unwrap();
        let param = HistoryParam {
            log: LogParam {
                first_page: 0,
                page_count: 4,
                domain: Domain::FastPower,
            },
            item_samples,
        };
        let history = History::new(param, &mut store);
        (store, history)
    }

    #[test]
    fn test_item_count_and_sn() {
        let d = 3;
        let (mut store, mut history) = setup(d);
        let n = 20u32;
        for sn in 100..100 + n {
            history.put_sample(&mut store, (sn % 7) as u16, sn).unwrap();
        }

        // floor(20 / 6) = 3 items
        let expected = (n / (2 * d)) as usize;
        let items: Vec<u32> = (0..expected).map(|i| store.read_item(0, i).unwrap()).collect();
        assert_eq!(store.read_item(0, expected).unwrap(), u32::MAX);
        assert_eq!(items.len(), 3);
        assert_eq!(store.header(0).unwrap().sn, 100);

        // First item: mean of sn%7 over 100..103 and 103..106
        let [a, b] = unpack_item(items[0]);
        assert_eq!(a, ((100 % 7 + 101 % 7 + 102 % 7) / 3) as u16);
        assert_eq!(b, ((103 % 7 + 104 % 7 + 105 % 7) / 3) as u16);
    }

    #[test]
    fn test_mean_truncates() {
        let (mut store, mut history) = setup(2);
        for (sn, v) in [(0, 1u16), (1, 2), (2, 10), (3, 13)] {
            history.put_sample(&mut store, v, sn).unwrap();
        }
        assert_eq!(unpack_item(store.read_item(0, 0).unwrap()), [1, 11]);
    }

    #[test]
    fn test_item_sn_is_first_sample_of_window() {
        let (mut store, mut history) = setup(1);
        for sn in 0..4 {
            history.put_sample(&mut store, 5, sn).unwrap();
        }
        history.suspend();
        // A fresh page starts with the window's first sample
        history.put_sample(&mut store, 5, 40).unwrap();
        history.put_sample(&mut store, 5, 41).unwrap();
        assert_eq!(store.header(0).unwrap().sn, 0);
        assert_eq!(store.header(1).unwrap().sn, 40);
    }

    #[test]
    fn test_suspend_never_mixes_windows() {
        let (mut store, mut history) = setup(2);
        // Three pre-gap samples: one full half-item plus one partial
        history.put_sample(&mut store, 1000, 0).unwrap();
        history.put_sample(&mut store, 1000, 1).unwrap();
        history.put_sample(&mut store, 1000, 2).unwrap();
        history.suspend();
        for sn in 10..14 {
            history.put_sample(&mut store, 2, sn).unwrap();
        }

        // Nothing from before the gap was logged
        assert!(store.header(0).unwrap().sn != u32::MAX);
        assert_eq!(unpack_item(store.read_item(0, 0).unwrap()), [2, 2]);
        assert_eq!(store.header(0).unwrap().sn, 10);
        assert_eq!(store.read_item(0, 1).unwrap(), u32::MAX);
    }
}
