//! DFU job lifecycle.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal_async::delay::DelayNs;

use crate::config::DfuConfig;
use crate::dfu::engine::{ControlLink, Transfer};
use crate::dfu::progress::Progress;
use crate::dfu::{DfuEvent, DfuJob, DfuTransport, DownloadAction, Downloader, JobError, JobStatus, JobTracker};
use crate::error::{Error, Lookup, TransportError};

/// Engine-wide single-job flag.
#[derive(Debug, Default)]
pub struct DfuLock(AtomicBool);

impl DfuLock {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct DfuService<'t, T, J, L, D>
where
    T: DfuTransport,
    J: JobTracker,
    L: Downloader,
    D: DelayNs,
{
    transport: &'t T,
    tracker: J,
    downloader: L,
    delay: D,
    config: DfuConfig,
    lock: DfuLock,
    job: Option<DfuJob>,
    transfer: Option<Transfer>,
    progress: Progress,
    /// Bytes of the current image received in test mode.
    received: usize,
    socket_retries_left: u8,
    /// The secondary download was started from within the primary's
    /// last fragment.
    chain_restarted: bool,
    test_mode: bool,
}

impl<'t, T, J, L, D> DfuService<'t, T, J, L, D>
where
    T: DfuTransport,
    J: JobTracker,
    L: Downloader,
    D: DelayNs,
{
    pub fn new(transport: &'t T, tracker: J, downloader: L, delay: D, config: DfuConfig) -> Self {
        Self {
            transport,
            tracker,
            downloader,
            delay,
            progress: Progress::new(config.progress_interval),
            config,
            lock: DfuLock::new(),
            job: None,
            transfer: None,
            received: 0,
            socket_retries_left: 0,
            chain_restarted: false,
            test_mode: false,
        }
    }

    /// Count fragments without touching the radio.
    pub fn set_test_mode(&mut self, enabled: bool) {
        self.test_mode = enabled;
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn job(&self) -> Option<&DfuJob> {
        self.job.as_ref()
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    pub fn tracker(&self) -> &J {
        &self.tracker
    }

    pub fn downloader(&self) -> &L {
        &self.downloader
    }

    /// Accept a job for a connected peripheral and start its download.
    pub async fn start_job(&mut self, job: DfuJob) -> Result<(), Error> {
        if job.image.size == 0 || job.secondary.as_ref().is_some_and(|s| s.size == 0) {
            return Err(Error::InvalidArgument);
        }
        if !self.transport.is_connected(&job.target) {
            warn!("Device not connected; ignoring job");
            return Err(Error::NotFound(Lookup::Address));
        }
        if !self.lock.try_acquire() {
            warn!("DFU already in progress");
            return Err(Error::Busy);
        }

        info!(
            "Starting BLE DFU to {} from {} path {} size {} init {}",
            job.target,
            job.host.as_str(),
            job.image.path.as_str(),
            job.image.size,
            job.image.is_init_packet()
        );
        if let Some(second) = &job.secondary {
            info!("Second DFU path {} size {}", second.path.as_str(), second.size);
        }

        self.socket_retries_left = self.config.socket_retries;
        self.reset_image();

        match self.downloader.start(&job.host, &job.image.path).await {
            Ok(()) => {
                info!("Downloading update");
                self.job = Some(job);
                self.report(JobStatus::InProgress, 0, JobError::None).await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to start download: {:?}", e);
                if let Err(e) = self.tracker.update(&job, JobStatus::Failed, 0, JobError::Download).await {
                    warn!("Job update failed: {:?}", e);
                }
                self.lock.release();
                Err(e)
            }
        }
    }

    /// Feed one download client event through the job.
    pub async fn handle(&mut self, event: DfuEvent<'_>) -> DownloadAction {
        match event {
            DfuEvent::DownloadDone => {
                self.on_download_done().await;
                DownloadAction::Stop
            }
            _ if self.job.is_none() => {
                warn!("DFU event without a job");
                DownloadAction::Stop
            }
            DfuEvent::Fragment(data) => match self.on_fragment(data).await {
                Ok(()) => DownloadAction::Continue,
                Err(e) => {
                    error!("Error from peripheral DFU: {:?}", e);
                    self.downloader.stop();
                    self.cancel(JobError::from(&e)).await;
                    DownloadAction::Stop
                }
            },
            DfuEvent::DownloadError(e) => {
                let socket_error = matches!(
                    e,
                    Error::Transport(TransportError::NotConnected | TransportError::ConnectionReset)
                );
                if socket_error && self.socket_retries_left > 0 {
                    warn!("Download socket error. {} retries left...", self.socket_retries_left);
                    self.socket_retries_left -= 1;
                    return DownloadAction::Retry;
                }
                error!("Download client error: {:?}", e);
                self.downloader.stop();
                self.cancel(JobError::Download).await;
                DownloadAction::Stop
            }
        }
    }

    async fn on_download_done(&mut self) {
        info!("Download client done");
        if self.job.is_none() {
            return;
        }
        if core::mem::take(&mut self.chain_restarted) {
            // End of the primary download; the secondary is already running.
            return;
        }
        self.downloader.stop();
        if self.test_mode && self.received >= self.job.as_ref().map_or(0, |j| j.image.size) {
            info!("Test mode transfer complete");
            self.transport.close();
            self.job = None;
            self.lock.release();
            return;
        }
        warn!("Download ended before the image was complete");
        self.cancel(JobError::Download).await;
    }

    async fn on_fragment(&mut self, data: &[u8]) -> Result<(), Error> {
        let (target, total, init_packet) = match &self.job {
            Some(job) => (job.target, job.image.size, job.image.is_init_packet()),
            None => return Ok(()),
        };
        self.chain_restarted = false;

        if self.test_mode {
            self.received += data.len();
            if let Some(percent) = self.progress.update(self.received, total) {
                info!("Test mode: {}% ({} of {} bytes)", percent, self.received, total);
            }
            return Ok(());
        }

        let first = self.transfer.is_none();
        if first {
            debug!("First fragment");
            self.report(JobStatus::Downloading, 0, JobError::None).await;
            self.transfer = Some(Transfer::new(init_packet, total));
        }

        let mut link = ControlLink::new(self.transport, target, &mut self.delay, &self.config);
        let Some(transfer) = self.transfer.as_mut() else {
            return Ok(());
        };
        if first {
            transfer.begin(&mut link).await.inspect_err(|_| transfer.fail())?;
        }
        transfer.feed(&mut link, data).await.inspect_err(|_| transfer.fail())?;

        let sent = transfer.sent();
        let complete = transfer.is_complete();
        let chained = self.job.as_ref().is_some_and(|j| j.secondary.is_some());

        if let Some(percent) = self.progress.update(sent, total) {
            let status = if percent == 100 && !chained {
                JobStatus::Succeeded
            } else {
                JobStatus::Downloading
            };
            info!("DFU progress {}%", percent);
            self.report(status, percent, JobError::None).await;
        }

        if complete {
            if chained {
                self.next_image().await?;
            } else {
                self.finish().await;
            }
        }
        Ok(())
    }

    /// Rotate to the secondary image and restart the download.
    async fn next_image(&mut self) -> Result<(), Error> {
        let Some(target) = self.job.as_ref().map(|j| j.target) else {
            return Ok(());
        };
        if !self.transport.is_connected(&target) {
            error!("Device {} disconnected; abandoning DFU chain", target);
            self.transport.close();
            self.report(JobStatus::Failed, 0, JobError::NotConnected).await;
            self.job = None;
            self.lock.release();
            return Ok(());
        }

        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };
        let Some(second) = job.secondary.take() else {
            return Ok(());
        };
        info!("Starting second image {} size {}", second.path.as_str(), second.size);
        job.image = second;
        let (host, path) = (job.host.clone(), job.image.path.clone());

        self.reset_image();
        self.chain_restarted = true;
        self.socket_retries_left = self.config.socket_retries;
        self.downloader.start(&host, &path).await
    }

    async fn finish(&mut self) {
        let Some(target) = self.job.as_ref().map(|j| j.target) else {
            return;
        };
        info!("DFU complete for {}", target);
        if let Err(e) = self.transport.rediscover(&target).await {
            warn!("Rediscovery failed: {:?}", e);
        }
        self.transport.close();
        self.job = None;
        self.transfer = None;
        self.lock.release();
    }

    /// Abandon the job: abort the target and report the failure.
    pub async fn cancel(&mut self, error: JobError) {
        let Some(target) = self.job.as_ref().map(|j| j.target) else {
            return;
        };
        warn!("Cancelling DFU: {:?}", error);
        self.transport.close();
        if !self.test_mode {
            let mut link = ControlLink::new(self.transport, target, &mut self.delay, &self.config);
            link.abort().await;
        }
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.fail();
        }
        let progress = self.progress.last_reported();
        self.report(JobStatus::Failed, progress, error).await;
        self.job = None;
        self.lock.release();
    }

    fn reset_image(&mut self) {
        self.chain_restarted = false;
        self.transfer = None;
        self.received = 0;
        self.progress.reset();
    }

    async fn report(&mut self, status: JobStatus, progress: u8, error: JobError) {
        let Some(job) = &self.job else {
            return;
        };
        if let Err(e) = self.tracker.update(job, status, progress, error).await {
            error!("Error updating job status: {:?}", e);
        }
    }
}
