//! # Fragment Server
//!
//! Walks the outstanding data request and produces one data packet per call.
//! Requested fragments that hold nothing (page evicted, or fragment never
//! committed) are dropped from the request without transmitting anything.

use tracing::trace;

use crate::error::Result;
use crate::flash::Flash;
use crate::proto::{DataPacket, DataRequestPacket, Status};
use crate::storage::layout::DATA_PAGES;
use crate::storage::PageStore;

/// Outstanding request state
#[derive(Debug, Default)]
pub struct FragmentServer {
    request: Option<DataRequestPacket>,
    /// First page that may still have bits set
    cursor: usize,
}

impl FragmentServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outstanding request. The previous one is forgotten, since
    /// the receiver re-requests whatever it still needs on every report.
    pub fn accept(&mut self, request: DataRequestPacket) {
        trace!(
            cookie = request.cookie,
            fragments = request.fragment_count(),
            "request accepted"
        );
        self.request = Some(request);
        self.cursor = 0;
    }

    pub fn has_outstanding(&self) -> bool {
        self.request.is_some()
    }

    /// Cookie of the request being served
    pub fn cookie(&self) -> Option<u32> {
        self.request.as_ref().map(|r| r.cookie)
    }

    /// Produce the next servable fragment, or `None` once the request is
    /// exhausted.
    ///
    /// # Arguments
    ///
    /// * `store` - Local page store to serve from
    /// * `status` - Status byte for the data packet header
    ///
    /// # Errors
    ///
    /// Returns an error only if the flash cannot be read.
    pub fn next_fragment<F: Flash>(
        &mut self,
        store: &PageStore<F>,
        status: Status,
    ) -> Result<Option<DataPacket>> {
        let Some(request) = self.request.as_mut() else {
            return Ok(None);
        };

        while self.cursor < DATA_PAGES {
            let page = self.cursor;
            let wanted = &mut request.fragments[page];
            if wanted.is_empty() {
                self.cursor += 1;
                continue;
            }
            if !store.is_used(page) {
                trace!(page, "requested page no longer in use");
                *wanted = Default::default();
                self.cursor += 1;
                continue;
            }

            let mut header = store.header(page)?;
            while let Some(fragment) = wanted.lowest() {
                wanted.remove(fragment);
                if header.unused_fragments.contains(fragment) {
                    trace!(page, fragment, "requested fragment is empty");
                    continue;
                }
                let data = store.read_fragment(page, fragment)?;
                header.fragment = fragment as u8;
                return Ok(Some(DataPacket {
                    status,
                    cookie: request.cookie,
                    page_header: header,
                    data,
                }));
            }
            self.cursor += 1;
        }

        self.request = None;
        Ok(None)
    }
}
