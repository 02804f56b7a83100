//! # Collector Module
//!
//! The battery-powered measuring node. Every sampling tick it measures,
//! feeds the domain histories and broadcasts a report; between ticks it
//! serves fragment requests from its flash log.
//!
//! This module handles:
//! - Sequence numbering and the battery conservation policy
//! - One history per data domain over a shared page store
//! - Serving data requests one fragment at a time
//! - The radio loop that interleaves sampling with serving

use tracing::{debug, info, warn};

pub mod link;
pub mod sampler;
pub mod serve;

use crate::error::Result;
use crate::flash::Flash;
use crate::proto::{DataPacket, DataRequestPacket, ReportPacket, Status};
use crate::storage::layout::{Domain, DOMAINS};
use crate::storage::{History, HistoryParam, PageStore};
use sampler::{scale_power, Sampler};
use serve::FragmentServer;

/// Battery thresholds in 0.1 mV units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryThresholds {
    /// At or above: fully charged, charging stops
    pub charged: u16,
    /// Below: no data transfer
    pub low: u16,
    /// Below: measurements stop
    pub hibernate: u16,
}

impl Default for BatteryThresholds {
    fn default() -> Self {
        Self {
            charged: 41_000,
            low: 35_000,
            hibernate: 32_000,
        }
    }
}

/// Collector policy parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorParams {
    pub thresholds: BatteryThresholds,
    /// In hibernation only every n-th tick takes a battery reading
    pub hibernate_skip: u32,
}

impl Default for CollectorParams {
    fn default() -> Self {
        Self {
            thresholds: BatteryThresholds::default(),
            hibernate_skip: 300 / crate::storage::layout::MEASURING_PERIOD_S,
        }
    }
}

/// Result of one sampling tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Power measured and logged
    Measured,
    /// Battery too low; only the battery was read
    Hibernating,
    /// Tick skipped while hibernating
    Skipped,
}

/// Collector state: storage, histories, status and the fragment server
#[derive(Debug)]
pub struct Collector<F: Flash> {
    store: PageStore<F>,
    histories: Vec<History>,
    server: FragmentServer,
    params: CollectorParams,
    status: Status,
    data_sn: u32,
    power: u16,
    vbatt: u16,
    hibernating: bool,
    skip_left: u32,
}

impl<F: Flash> Collector<F> {
    /// Create a collector over `flash`. Every domain starts with an empty
    /// history.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` if the flash cannot hold the history region.
    pub fn new(flash: F, params: CollectorParams) -> Result<Self> {
        let mut store = PageStore::new(flash)?;
        let histories = DOMAINS
            .iter()
            .map(|layout| History::new(HistoryParam::from(layout), &mut store))
            .collect();
        Ok(Self {
            store,
            histories,
            server: FragmentServer::new(),
            params,
            status: Status::default(),
            data_sn: 0,
            power: 0,
            vbatt: 0,
            hibernating: false,
            skip_left: params.hibernate_skip.max(1),
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn data_sn(&self) -> u32 {
        self.data_sn
    }

    pub fn store(&self) -> &PageStore<F> {
        &self.store
    }

    pub fn history(&self, domain: Domain) -> &History {
        &self.histories[domain as usize]
    }

    pub fn is_hibernating(&self) -> bool {
        self.hibernating
    }

    /// Advance the sequence number for a new tick. Returns whether this tick
    /// should measure.
    pub fn begin_tick(&mut self) -> bool {
        self.data_sn = self.data_sn.wrapping_add(1);
        if !self.hibernating {
            return true;
        }
        self.skip_left = self.skip_left.saturating_sub(1);
        if self.skip_left == 0 {
            self.skip_left = self.params.hibernate_skip.max(1);
            return true;
        }
        false
    }

    /// Apply the battery policy to a fresh battery reading
    pub fn update_battery(&mut self, dmv: u16) {
        let thresholds = &self.params.thresholds;
        self.vbatt = dmv;
        let base = self
            .status
            .without(Status::CHARGED | Status::LOW_BATT | Status::HIBERNATE);
        let status = if dmv >= thresholds.charged {
            base.with(Status::CHARGED)
        } else if dmv >= thresholds.low {
            base
        } else if dmv >= thresholds.hibernate {
            base.with(Status::LOW_BATT)
        } else {
            base.with(Status::LOW_BATT | Status::HIBERNATE)
        };
        if status != self.status {
            info!(
                vbatt = dmv,
                "battery status changed: {:#04x} -> {:#04x}", self.status.0, status.0
            );
        }
        self.status = status;
    }

    /// Log one power measurement into every domain
    ///
    /// # Errors
    ///
    /// Storage errors are fatal: the log can no longer be trusted.
    pub fn record(&mut self, power: u16) -> Result<()> {
        self.power = power;
        self.hibernating = false;
        let sn = self.data_sn;
        let vbatt = self.vbatt;
        for history in self.histories.iter_mut() {
            let sample = match history.domain() {
                Domain::FastPower | Domain::SlowPower => power,
                Domain::Battery => vbatt,
            };
            history.put_sample(&mut self.store, sample, sn)?;
        }
        Ok(())
    }

    /// Enter hibernation: open aggregates are dropped so nothing is averaged
    /// across the gap
    pub fn suspend_history(&mut self) {
        if self.hibernating {
            return;
        }
        warn!(vbatt = self.vbatt, sn = self.data_sn, "entering hibernation");
        for history in self.histories.iter_mut() {
            history.suspend();
        }
        self.hibernating = true;
    }

    /// Run one tick's measurement against the analog front end
    ///
    /// # Errors
    ///
    /// Returns sampler errors and fatal storage errors.
    pub async fn measure<S: Sampler + ?Sized>(&mut self, sampler: &mut S) -> Result<TickOutcome> {
        if !self.begin_tick() {
            return Ok(TickOutcome::Skipped);
        }
        let dmv = sampler.read_battery().await?;
        self.update_battery(dmv);
        if self.status.has(Status::HIBERNATE) {
            self.suspend_history();
            return Ok(TickOutcome::Hibernating);
        }
        let watts = sampler.sample_power().await?;
        let power = scale_power(watts);
        self.record(power)?;
        debug!(sn = self.data_sn, power, vbatt = dmv, "measured");
        Ok(TickOutcome::Measured)
    }

    /// Current state snapshot
    pub fn report(&self, flags: u8) -> ReportPacket {
        ReportPacket {
            status: self.status.with(flags),
            sn: self.data_sn,
            power: self.power,
            vbatt: self.vbatt,
            page_bitmap: *self.store.used_pages(),
        }
    }

    /// Replace the outstanding data request
    pub fn accept_request(&mut self, request: DataRequestPacket) {
        self.server.accept(request);
    }

    pub fn has_outstanding(&self) -> bool {
        self.server.has_outstanding()
    }

    /// Next fragment to transmit for the outstanding request
    pub fn next_data_packet(&mut self) -> Result<Option<DataPacket>> {
        let status = self.status.with(Status::CONNECTED);
        self.server.next_fragment(&self.store, status)
    }
}
