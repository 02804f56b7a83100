//! # Receiver Radio Loop
//!
//! Listens continuously. Every frame goes through [`Receiver::on_reception`];
//! a data request produced by the sync is transmitted straight back, inside
//! the collector's listen window. Console lines arrive on a second input and
//! are served between frames.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::console::{self, Reply};
use super::Receiver;
use crate::error::Result;
use crate::link::{Radio, Reception};
use crate::proto::encoder::encode_data_request;
use crate::storage::PageImage;
use crate::telemetry::{TelemetryLogger, Timebase};

/// Receiver loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverTiming {
    /// Longest single wait on the radio
    pub poll_interval: Duration,
    /// Collector sampling period, used to timestamp drained samples
    pub measuring_period: Duration,
    /// Drain ready pages into telemetry without waiting for `qd`
    pub auto_drain: bool,
}

impl Default for ReceiverTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            measuring_period: Duration::from_secs(12),
            auto_drain: true,
        }
    }
}

/// The receiver node driving its radio
pub struct ReceiverLink<R: Radio> {
    receiver: Receiver,
    radio: R,
    timing: ReceiverTiming,
    telemetry: Option<TelemetryLogger>,
    requests_sent: u64,
    pages_drained: u64,
}

impl<R: Radio> ReceiverLink<R> {
    pub fn new(receiver: Receiver, radio: R, timing: ReceiverTiming) -> Self {
        Self {
            receiver: receiver.with_measuring_period(timing.measuring_period),
            radio,
            timing,
            telemetry: None,
            requests_sent: 0,
            pages_drained: 0,
        }
    }

    /// Write drained pages to `logger`
    pub fn with_telemetry(mut self, logger: TelemetryLogger) -> Self {
        self.telemetry = Some(logger);
        self
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn pages_drained(&self) -> u64 {
        self.pages_drained
    }

    /// Wait up to one poll interval for a frame and handle it
    ///
    /// # Errors
    ///
    /// Radio failures and telemetry write errors.
    pub async fn step(&mut self) -> Result<()> {
        if let Some(rx) = self.radio.receive(self.timing.poll_interval).await? {
            self.handle_frame(rx).await?;
        }
        Ok(())
    }

    /// Run one console line. A page handed out by `qd` goes to telemetry.
    pub fn command(&mut self, line: &str) -> Result<Reply> {
        let reply = console::execute(line, &mut self.receiver, Instant::now());
        if let Some(page) = &reply.page {
            self.export(page)?;
        }
        Ok(reply)
    }

    /// Serve radio and console until an error occurs. Replies are written
    /// to stdout; the radio keeps being served after the console closes.
    pub async fn run<I>(&mut self, input: I) -> Result<()>
    where
        I: AsyncBufRead + Unpin,
    {
        info!(
            auto_drain = self.timing.auto_drain,
            "receiver loop started, send ? for help"
        );
        let mut lines = input.lines();
        let mut console_open = true;

        loop {
            tokio::select! {
                rx = self.radio.receive(self.timing.poll_interval) => {
                    if let Some(rx) = rx? {
                        self.handle_frame(rx).await?;
                    }
                }
                line = lines.next_line(), if console_open => {
                    match line? {
                        Some(line) if line.trim().is_empty() => {}
                        Some(line) => println!("{}", self.command(&line)?.text),
                        None => {
                            debug!("console input closed");
                            console_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, rx: Reception) -> Result<()> {
        let now = Instant::now();
        if let Some(request) = self.receiver.on_reception(&rx, now) {
            self.radio.transmit(&encode_data_request(&request)).await?;
            self.requests_sent += 1;
            debug!(
                cookie = request.cookie,
                fragments = request.fragment_count(),
                "data request sent"
            );
        }
        if self.timing.auto_drain {
            while let Some(page) = self.receiver.take_ready_page(now) {
                self.export(&page)?;
            }
        }
        Ok(())
    }

    fn export(&mut self, page: &PageImage) -> Result<()> {
        self.pages_drained += 1;
        let Some(logger) = self.telemetry.as_mut() else {
            return Ok(());
        };
        let stats = self.receiver.stats();
        let (Some(report), Some(age)) = (stats.last_report(), stats.last_report_age(Instant::now()))
        else {
            warn!(page = page.header.page_idx, "no report to timestamp page against");
            return Ok(());
        };
        let timebase = Timebase::from_report(report.sn, age, self.timing.measuring_period);
        logger.log_page(page, &timebase)?;
        Ok(())
    }
}
