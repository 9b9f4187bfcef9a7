use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::protocol::{EncodeRequest, EncodeStage, EncodeSuccess, WorkerResponse};
use crate::worker::{spawn_worker, WorkerHandle};

#[derive(Debug, Error)]
pub enum EncodeJobError {
    /// Raised only by explicit or implicit cancellation. Callers must
    /// check [`EncodeJobError::is_cancellation`] before treating a
    /// settled job as a failure.
    #[error("encoding was cancelled")]
    Cancelled,
    /// Worker-reported failure (undecodable input, rejected raster).
    #[error("{0}")]
    Job(String),
    /// The worker crashed or its channel failed outside the protocol.
    #[error("worker failed while encoding image")]
    WorkerFailed,
}

impl EncodeJobError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EncodeJobError::Cancelled)
    }
}

#[derive(Debug)]
pub struct EncodeInput {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub quality: u8,
}

struct ActiveJob {
    id: Uuid,
    generation: u64,
    result_tx: Sender<Result<EncodeSuccess, EncodeJobError>>,
    status_tx: Sender<EncodeStage>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveJob>>>;

/// Pending outcome of one submitted encode job.
pub struct EncodeTicket {
    result_rx: Receiver<Result<EncodeSuccess, EncodeJobError>>,
    status_rx: Receiver<EncodeStage>,
}

impl EncodeTicket {
    /// Blocks until the job settles. Status messages never settle a
    /// ticket; they ride [`EncodeTicket::status_events`] instead.
    pub fn wait(self) -> Result<EncodeSuccess, EncodeJobError> {
        self.result_rx
            .recv()
            .unwrap_or(Err(EncodeJobError::WorkerFailed))
    }

    /// Stage updates for this job, in emission order.
    pub fn status_events(&self) -> &Receiver<EncodeStage> {
        &self.status_rx
    }
}

/// Owner of the executor worker's lifecycle. At most one job is
/// active per client; submitting while a job is active supersedes it
/// (cancel by teardown) rather than queueing.
pub struct EncodeClient {
    worker: Option<WorkerHandle>,
    active: ActiveSlot,
    generation: u64,
}

impl EncodeClient {
    pub fn new() -> Self {
        EncodeClient {
            worker: None,
            active: Arc::new(Mutex::new(None)),
            generation: 0,
        }
    }

    /// Submits a job against a lazily created worker. The input byte
    /// buffer moves to the worker; an active previous job is
    /// cancelled first.
    pub fn encode(&mut self, input: EncodeInput) -> EncodeTicket {
        self.cancel();

        if self.worker.is_none() {
            self.spawn_worker_instance();
        }

        let id = Uuid::new_v4();
        let (result_tx, result_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        *self.active.lock() = Some(ActiveJob {
            id,
            generation: self.generation,
            result_tx,
            status_tx,
        });

        debug!(%id, file = %input.file_name, "submitting encode job");

        let request = EncodeRequest {
            id,
            file_name: input.file_name,
            mime_type: input.mime_type,
            bytes: input.bytes,
            quality: input.quality,
        };
        let delivered = match self.worker.as_ref() {
            Some(worker) => worker.requests.send(request).is_ok(),
            None => false,
        };
        if !delivered {
            // Worker thread died before accepting the job.
            if let Some(job) = take_if_current(&self.active, id, self.generation) {
                let _ = job.result_tx.send(Err(EncodeJobError::WorkerFailed));
            }
        }

        EncodeTicket {
            result_rx,
            status_rx,
        }
    }

    /// No-op when idle. Otherwise clears the active slot, tears the
    /// worker down unconditionally (a hung encode is
    /// indistinguishable from a slow one), and settles the pending
    /// ticket with [`EncodeJobError::Cancelled`].
    pub fn cancel(&mut self) {
        let job = self.active.lock().take();
        let Some(job) = job else {
            return;
        };

        debug!(id = %job.id, "cancelling active encode job");
        self.worker = None;
        let _ = job.result_tx.send(Err(EncodeJobError::Cancelled));
    }

    /// Drops the worker if one exists; the next `encode` recreates it.
    pub fn dispose(&mut self) {
        self.worker = None;
    }

    fn spawn_worker_instance(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let (responses_tx, responses_rx) = unbounded();
        self.worker = Some(spawn_worker(responses_tx));

        let active = Arc::clone(&self.active);
        thread::spawn(move || route_responses(responses_rx, active, generation));
    }

    #[cfg(test)]
    pub(crate) fn worker_generation(&self) -> u64 {
        self.generation
    }
}

impl Default for EncodeClient {
    fn default() -> Self {
        EncodeClient::new()
    }
}

impl Drop for EncodeClient {
    fn drop(&mut self) {
        self.cancel();
        self.dispose();
    }
}

/// Client-side router for one worker instance. Forwards statuses and
/// settles terminal messages for the job it matches; anything with a
/// stale id or generation is dropped silently. A superseded worker's
/// router can therefore never touch a successor's job.
fn route_responses(responses: Receiver<WorkerResponse>, active: ActiveSlot, generation: u64) {
    while let Ok(response) = responses.recv() {
        let id = response.request_id();
        match response {
            WorkerResponse::Status { stage, .. } => {
                let guard = active.lock();
                if let Some(job) = guard.as_ref() {
                    if job.id == id && job.generation == generation {
                        let _ = job.status_tx.send(stage);
                    }
                }
            }
            WorkerResponse::Success(success) => match take_if_current(&active, id, generation) {
                Some(job) => {
                    let _ = job.result_tx.send(Ok(success));
                }
                None => trace!(%id, "dropping stale success response"),
            },
            WorkerResponse::Error { message, .. } => {
                match take_if_current(&active, id, generation) {
                    Some(job) => {
                        let _ = job.result_tx.send(Err(EncodeJobError::Job(message)));
                    }
                    None => trace!(%id, "dropping stale error response"),
                }
            }
        }
    }

    // Channel disconnected. If this generation's job never settled,
    // the worker died mid-job.
    let crashed = {
        let mut guard = active.lock();
        match guard.as_ref() {
            Some(job) if job.generation == generation => guard.take(),
            _ => None,
        }
    };
    if let Some(job) = crashed {
        debug!(id = %job.id, "worker channel closed with job still active");
        let _ = job.result_tx.send(Err(EncodeJobError::WorkerFailed));
    }
}

fn take_if_current(active: &ActiveSlot, id: Uuid, generation: u64) -> Option<ActiveJob> {
    let mut guard = active.lock();
    match guard.as_ref() {
        Some(job) if job.id == id && job.generation == generation => guard.take(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn png_fixture() -> Vec<u8> {
        let mut raster = image::RgbaImage::new(24, 16);
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            *pixel = image::Rgba([(x * 10) as u8, (y * 10) as u8, 0x80, 0xff]);
        }

        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(raster)
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode png fixture");
        bytes
    }

    fn fixture_input(quality: u8) -> EncodeInput {
        EncodeInput {
            file_name: "photo.png".into(),
            mime_type: "image/png".into(),
            bytes: png_fixture(),
            quality,
        }
    }

    #[test]
    fn encode_resolves_with_consistent_counts() {
        let mut client = EncodeClient::new();
        let input_len = png_fixture().len() as u64;

        let ticket = client.encode(fixture_input(75));
        let success = ticket.wait().expect("encode fixture");

        assert_eq!(success.input_bytes, input_len);
        assert_eq!(success.output_bytes, success.bytes.len() as u64);
        assert_eq!((success.width, success.height), (24, 16));
        assert_eq!(success.file_name, "photo.webp");
    }

    #[test]
    fn statuses_arrive_in_stage_order_and_do_not_settle() {
        let mut client = EncodeClient::new();
        let ticket = client.encode(fixture_input(75));
        let statuses = ticket.status_events().clone();

        assert!(ticket.wait().is_ok());

        let stages: Vec<EncodeStage> = statuses.try_iter().collect();
        assert_eq!(stages, vec![EncodeStage::Loading, EncodeStage::Encoding]);
    }

    #[test]
    fn second_encode_supersedes_the_first() {
        let mut client = EncodeClient::new();

        let first = client.encode(fixture_input(75));
        let second = client.encode(fixture_input(75));

        let first_outcome = first.wait();
        assert!(matches!(first_outcome, Err(EncodeJobError::Cancelled)));
        assert!(second.wait().is_ok());
    }

    #[test]
    fn cancel_on_idle_client_is_a_no_op() {
        let mut client = EncodeClient::new();
        client.cancel();

        let ticket = client.encode(fixture_input(75));
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn cancellation_predicate_matches_only_cancellations() {
        assert!(EncodeJobError::Cancelled.is_cancellation());
        assert!(!EncodeJobError::Job("bad input".into()).is_cancellation());
        assert!(!EncodeJobError::WorkerFailed.is_cancellation());
    }

    #[test]
    fn cancelled_ticket_settles_with_the_marker_error() {
        let mut client = EncodeClient::new();
        let ticket = client.encode(fixture_input(75));
        client.cancel();

        let error = ticket.wait().unwrap_err();
        assert!(error.is_cancellation());
    }

    #[test]
    fn undecodable_input_reports_a_job_error_and_keeps_the_worker() {
        let mut client = EncodeClient::new();

        let ticket = client.encode(EncodeInput {
            file_name: "broken.png".into(),
            mime_type: "image/png".into(),
            bytes: b"not an image".to_vec(),
            quality: 75,
        });
        let error = ticket.wait().unwrap_err();
        assert!(matches!(error, EncodeJobError::Job(ref message) if !message.is_empty()));
        assert!(!error.is_cancellation());

        // A per-job failure must not poison the executor.
        let generation = client.worker_generation();
        let ticket = client.encode(fixture_input(75));
        assert!(ticket.wait().is_ok());
        assert_eq!(client.worker_generation(), generation);
    }

    #[test]
    fn dispose_then_encode_recreates_exactly_one_worker() {
        let mut client = EncodeClient::new();

        let ticket = client.encode(fixture_input(75));
        assert!(ticket.wait().is_ok());
        let generation = client.worker_generation();

        client.dispose();
        let ticket = client.encode(fixture_input(75));
        assert!(ticket.wait().is_ok());
        assert_eq!(client.worker_generation(), generation + 1);
    }

    #[test]
    fn superseded_encode_runs_against_a_fresh_worker() {
        let mut client = EncodeClient::new();

        let first = client.encode(fixture_input(75));
        let first_generation = client.worker_generation();
        let second = client.encode(fixture_input(75));

        assert_eq!(client.worker_generation(), first_generation + 1);
        assert!(first.wait().unwrap_err().is_cancellation());
        assert!(second.wait().is_ok());
    }
}
