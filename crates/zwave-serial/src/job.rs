//! Outbound jobs and the single-outstanding job queue
//!
//! The serial link is half duplex and the controller accepts one request at
//! a time, so exactly one [`Job`] may be in flight. A job in flight is either
//! waiting for the controller's ACK or, once ACKed, for the response or
//! callback frame that finishes it.
//!
//! ```text
//!   enqueue ──► pending ──advance──► AwaitingAck ──ACK──► AwaitingCallback
//!                  ▲                   │    ▲                 │
//!                  │          deadline │    │ retransmit      │ callback / response
//!                  │                   ▼    │                 ▼
//!                  └── next job ◄── dropped (retry limit)   completed
//! ```

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{ProtocolConfig, BROADCAST_NODE_ID, MAX_FRAME_PAYLOAD};
use crate::error::{DriverError, Result};
use crate::frame::{self, Direction, FrameError};
use crate::function::{tx_options, FunctionId};

/// What finishes a job once the controller has ACKed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// The ACK alone completes the job
    None,
    /// A response frame with the same function identifier
    Response,
    /// A callback request frame carrying the job's callback identifier
    Request,
}

/// One outbound protocol operation
#[derive(Debug, Clone)]
pub struct Job {
    direction: Direction,
    payload: Vec<u8>,
    deadline: Option<Instant>,
    attempts: u32,
    callback_id: u8,
    callback_kind: CallbackKind,
    callback_slot: Option<usize>,
    node_id: Option<u8>,
}

impl Job {
    /// Create a host request for `function` with the given arguments
    pub fn new(function: FunctionId, args: &[u8]) -> Result<Self> {
        let mut payload = Vec::with_capacity(args.len() + 2);
        payload.push(function.as_u8());
        payload.extend_from_slice(args);
        Self::from_payload(payload)
    }

    /// Create a job from a raw function identifier + arguments run
    pub fn from_payload(payload: Vec<u8>) -> Result<Self> {
        if payload.is_empty() {
            return Err(DriverError::InvalidArgument(
                "job payload needs a function identifier".to_string(),
            ));
        }
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(DriverError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }
        Ok(Self {
            direction: Direction::Request,
            payload,
            deadline: None,
            attempts: 0,
            callback_id: 0,
            callback_kind: CallbackKind::None,
            callback_slot: None,
            node_id: None,
        })
    }

    /// Send a command class payload to a node (or broadcast)
    ///
    /// The job completes on the controller's transmit-status callback.
    pub fn send_data(node_id: u8, command: &[u8]) -> Result<Self> {
        if command.is_empty() {
            return Err(DriverError::InvalidArgument(
                "send-data needs a command class payload".to_string(),
            ));
        }
        let len = u8::try_from(command.len()).map_err(|_| DriverError::PayloadTooLarge {
            size: command.len(),
            max: u8::MAX as usize,
        })?;

        let mut args = Vec::with_capacity(command.len() + 3);
        args.push(node_id);
        args.push(len);
        args.extend_from_slice(command);
        args.push(tx_options::DEFAULT);

        Ok(Self::new(FunctionId::SendData, &args)?
            .for_node(node_id)
            .expect_callback())
    }

    /// Mark the target endpoint
    pub fn for_node(mut self, node_id: u8) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Complete on a response frame with the same function identifier
    pub fn expect_response(mut self) -> Self {
        self.callback_kind = CallbackKind::Response;
        self
    }

    /// Complete on a callback request frame; reserves a trailing byte for
    /// the callback identifier assigned at enqueue time
    pub fn expect_callback(mut self) -> Self {
        if self.callback_slot.is_none() {
            self.payload.push(0);
            self.callback_slot = Some(self.payload.len() - 1);
        }
        self.callback_kind = CallbackKind::Request;
        self
    }

    /// Function identifier byte
    pub fn function(&self) -> u8 {
        self.payload[0]
    }

    /// Arguments after the function identifier
    pub fn args(&self) -> &[u8] {
        &self.payload[1..]
    }

    /// Function identifier + arguments
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Transmissions made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Deadline for the current wait, if transmitted
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Assigned callback identifier (0 when none)
    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    /// What completes this job after the ACK
    pub fn callback_kind(&self) -> CallbackKind {
        self.callback_kind
    }

    /// Whether a response or callback is expected after the ACK
    pub fn expects_callback(&self) -> bool {
        self.callback_kind != CallbackKind::None
    }

    /// Target endpoint, if the job addresses one
    pub fn node_id(&self) -> Option<u8> {
        self.node_id
    }

    /// Whether the job targets every node
    pub fn is_broadcast(&self) -> bool {
        self.node_id == Some(BROADCAST_NODE_ID)
    }

    /// Encode as a wire frame
    pub fn encode(&self) -> std::result::Result<Vec<u8>, FrameError> {
        frame::encode(self.direction, &self.payload)
    }

    fn assign_callback_id(&mut self, id: u8) {
        if let Some(slot) = self.callback_slot {
            self.callback_id = id;
            self.payload[slot] = id;
        }
    }
}

/// Sub-state of the job in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightPhase {
    /// Transmitted, waiting for the controller's ACK
    AwaitingAck,
    /// ACKed, waiting for a response or callback frame
    AwaitingCallback,
}

/// Result of handing an ACK to the queue
#[derive(Debug)]
pub enum AckOutcome {
    /// The job needed only the ACK and is finished
    Completed(Job),
    /// The job stays in flight until its response/callback
    AwaitingCallback,
    /// Nothing was waiting for an ACK
    Unexpected,
}

/// Counters kept by the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted
    pub enqueued: u64,
    /// Frames written, first attempts and retries
    pub transmissions: u64,
    /// Frames written again after a timeout, NAK or CAN
    pub retransmissions: u64,
    /// Jobs finished
    pub completed: u64,
    /// Jobs dropped after exhausting the retry limit
    pub dropped: u64,
}

#[derive(Debug)]
struct InFlight {
    job: Job,
    phase: InFlightPhase,
}

/// Ordered outbound work with single-outstanding flow control
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    in_flight: Option<InFlight>,
    next_callback_id: u8,
    retry_limit: u32,
    ack_timeout: Duration,
    callback_timeout: Duration,
    dropped: Vec<Job>,
    stats: QueueStats,
}

impl JobQueue {
    /// Create an empty queue using the configured timeouts and retry limit
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            next_callback_id: 1,
            retry_limit: config.retry_limit.max(1),
            ack_timeout: config.ack_timeout,
            callback_timeout: config.callback_timeout,
            dropped: Vec::new(),
            stats: QueueStats::default(),
        }
    }

    /// Append a job to the tail
    ///
    /// Returns the callback identifier assigned to the job (0 if the job does
    /// not complete by callback).
    pub fn enqueue(&mut self, mut job: Job) -> u8 {
        if job.callback_kind == CallbackKind::Request {
            let id = self.allocate_callback_id();
            job.assign_callback_id(id);
        }
        trace!(
            function = job.function(),
            callback_id = job.callback_id,
            pending = self.pending.len() + 1,
            "Job enqueued"
        );
        let id = job.callback_id;
        self.pending.push_back(job);
        self.stats.enqueued += 1;
        id
    }

    /// Rolling callback identifier in 1..=255
    fn allocate_callback_id(&mut self) -> u8 {
        let id = self.next_callback_id;
        self.next_callback_id = self.next_callback_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Service the queue at time `now`
    ///
    /// Returns the frame to write, if any: the head job when nothing is in
    /// flight, or the in-flight job again when its deadline has passed. No
    /// job is written more than `retry_limit` times: one that needs another
    /// transmission after that, including a job requeued by a reconnect, is
    /// dropped and the next job is tried. Dropped jobs are collected for
    /// [`JobQueue::take_dropped`].
    pub fn advance(&mut self, now: Instant) -> Option<Vec<u8>> {
        loop {
            match self.in_flight.as_mut() {
                None => {
                    let job = self.pending.pop_front()?;
                    self.in_flight = Some(InFlight {
                        job,
                        phase: InFlightPhase::AwaitingAck,
                    });
                }
                Some(current) => {
                    let expired = current.job.deadline.map_or(true, |d| d <= now);
                    if !expired {
                        return None;
                    }
                }
            }

            if self
                .in_flight
                .as_ref()
                .is_some_and(|current| current.job.attempts >= self.retry_limit)
            {
                self.drop_in_flight();
                continue;
            }

            if let Some(bytes) = self.transmit_in_flight(now) {
                return Some(bytes);
            }
        }
    }

    fn transmit_in_flight(&mut self, now: Instant) -> Option<Vec<u8>> {
        let current = self.in_flight.as_mut()?;
        let bytes = match current.job.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(function = current.job.function(), error = %e, "Dropping unencodable job");
                if let Some(current) = self.in_flight.take() {
                    self.dropped.push(current.job);
                }
                self.stats.dropped += 1;
                return None;
            }
        };

        let retransmit = current.job.attempts > 0;
        current.job.attempts += 1;
        current.job.deadline = Some(now + self.ack_timeout);
        current.phase = InFlightPhase::AwaitingAck;

        self.stats.transmissions += 1;
        if retransmit {
            self.stats.retransmissions += 1;
            debug!(
                function = current.job.function(),
                attempt = current.job.attempts,
                "Retransmitting job"
            );
        } else {
            debug!(
                function = current.job.function(),
                node = ?current.job.node_id,
                callback_id = current.job.callback_id,
                "Transmitting job"
            );
        }
        Some(bytes)
    }

    fn drop_in_flight(&mut self) {
        let Some(current) = self.in_flight.take() else {
            return;
        };
        let dropped = current.job;
        self.stats.dropped += 1;
        let err = DriverError::RetryExhausted {
            function: dropped.function(),
            attempts: dropped.attempts,
        };
        warn!(node = ?dropped.node_id, error = %err, "Dropping job");
        self.dropped.push(dropped);
    }

    /// Jobs dropped since the last call
    pub fn take_dropped(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.dropped)
    }

    /// Clear the awaiting-ACK sub-state of the job in flight
    pub fn complete_by_ack(&mut self, now: Instant) -> AckOutcome {
        let Some(current) = self.in_flight.as_mut() else {
            return AckOutcome::Unexpected;
        };
        if current.phase != InFlightPhase::AwaitingAck {
            return AckOutcome::Unexpected;
        }

        if current.job.expects_callback() {
            current.phase = InFlightPhase::AwaitingCallback;
            current.job.deadline = Some(now + self.callback_timeout);
            AckOutcome::AwaitingCallback
        } else {
            match self.finish_in_flight() {
                Some(job) => AckOutcome::Completed(job),
                None => AckOutcome::Unexpected,
            }
        }
    }

    /// Complete the in-flight job whose callback identifier matches
    ///
    /// Stale or duplicate identifiers are ignored.
    pub fn complete_by_callback(&mut self, callback_id: u8) -> Option<Job> {
        let current = self.in_flight.as_ref()?;
        if current.job.callback_kind != CallbackKind::Request
            || current.job.callback_id != callback_id
        {
            trace!(callback_id, "Ignoring unmatched callback");
            return None;
        }
        self.finish_in_flight()
    }

    /// Complete the in-flight job waiting for a response to `function`
    pub fn complete_by_response(&mut self, function: u8) -> Option<Job> {
        let current = self.in_flight.as_ref()?;
        if current.job.callback_kind != CallbackKind::Response || current.job.function() != function
        {
            return None;
        }
        self.finish_in_flight()
    }

    /// Finish the in-flight callback job for `function` after the
    /// controller's response refused it; no callback will follow
    pub fn complete_refused(&mut self, function: u8) -> Option<Job> {
        let current = self.in_flight.as_ref()?;
        if current.job.callback_kind != CallbackKind::Request || current.job.function() != function
        {
            return None;
        }
        debug!(function, "Request refused by controller");
        self.finish_in_flight()
    }

    fn finish_in_flight(&mut self) -> Option<Job> {
        let job = self.in_flight.take()?.job;
        self.stats.completed += 1;
        debug!(
            function = job.function(),
            attempts = job.attempts,
            "Job completed"
        );
        Some(job)
    }

    /// Force the in-flight job to be retransmitted on the next advance
    ///
    /// Used when the controller answers with NAK or CAN.
    pub fn expire_in_flight(&mut self, now: Instant) -> bool {
        match self.in_flight.as_mut() {
            Some(current) => {
                current.job.deadline = Some(now);
                true
            }
            None => false,
        }
    }

    /// Return the in-flight job to the head of the queue
    ///
    /// Used after the transport is reopened; attempts already made still count
    /// against the retry limit.
    pub fn requeue_in_flight(&mut self) {
        if let Some(current) = self.in_flight.take() {
            let mut job = current.job;
            job.deadline = None;
            self.pending.push_front(job);
        }
    }

    /// The job in flight, if any
    pub fn in_flight(&self) -> Option<&Job> {
        self.in_flight.as_ref().map(|f| &f.job)
    }

    /// Sub-state of the job in flight
    pub fn phase(&self) -> Option<InFlightPhase> {
        self.in_flight.as_ref().map(|f| f.phase)
    }

    /// Whether no job is in flight
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Jobs waiting behind the one in flight
    pub fn pending(&self) -> impl Iterator<Item = &Job> {
        self.pending.iter()
    }

    /// The job in flight followed by the pending jobs
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.in_flight().into_iter().chain(self.pending.iter())
    }

    /// Number of jobs not yet finished (pending + in flight)
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    /// Whether the queue holds no work at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs dropped after exhausting their retries
    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped
    }

    /// Queue counters
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfigBuilder;

    fn queue_with_limit(limit: u32) -> JobQueue {
        let config = DriverConfigBuilder::new()
            .retry_limit(limit)
            .ack_timeout(Duration::from_millis(100))
            .callback_timeout(Duration::from_millis(500))
            .build();
        JobQueue::new(&config.protocol)
    }

    fn version_job() -> Job {
        Job::new(FunctionId::GetVersion, &[]).unwrap().expect_response()
    }

    #[test]
    fn test_send_data_payload_layout() {
        let job = Job::send_data(5, &[0x20, 0x01, 0xFF]).unwrap();
        assert_eq!(job.function(), 0x13);
        assert_eq!(job.args(), &[5, 3, 0x20, 0x01, 0xFF, tx_options::DEFAULT, 0]);
        assert_eq!(job.node_id(), Some(5));
        assert!(job.expects_callback());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Job::new(FunctionId::MemoryPutBuffer, &vec![0u8; MAX_FRAME_PAYLOAD]).unwrap_err();
        assert_eq!(err.error_code(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn test_enqueue_assigns_rolling_callback_ids() {
        let mut queue = queue_with_limit(3);
        let a = queue.enqueue(Job::send_data(2, &[0x20, 0x02]).unwrap());
        let b = queue.enqueue(Job::send_data(3, &[0x20, 0x02]).unwrap());
        let none = queue.enqueue(version_job());
        assert_eq!((a, b, none), (1, 2, 0));

        queue.next_callback_id = 255;
        assert_eq!(queue.allocate_callback_id(), 255);
        assert_eq!(queue.allocate_callback_id(), 1);
    }

    #[test]
    fn test_single_outstanding_job() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(version_job());
        queue.enqueue(version_job());

        assert!(queue.advance(now).is_some());
        assert_eq!(queue.phase(), Some(InFlightPhase::AwaitingAck));
        // Second job waits while the first is in flight
        assert!(queue.advance(now).is_none());
        assert_eq!(queue.pending().count(), 1);
    }

    #[test]
    fn test_ack_completes_job_without_callback() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(Job::new(FunctionId::SendData, &[1, 2, 3]).unwrap());
        queue.advance(now).unwrap();

        assert!(matches!(queue.complete_by_ack(now), AckOutcome::Completed(_)));
        assert!(queue.is_idle());
        assert!(matches!(queue.complete_by_ack(now), AckOutcome::Unexpected));
    }

    #[test]
    fn test_callback_completion_matches_id() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        let id = queue.enqueue(Job::send_data(7, &[0x25, 0x02]).unwrap());
        queue.advance(now).unwrap();

        assert!(matches!(
            queue.complete_by_ack(now),
            AckOutcome::AwaitingCallback
        ));
        assert_eq!(queue.phase(), Some(InFlightPhase::AwaitingCallback));
        assert!(queue.complete_by_callback(id.wrapping_add(1)).is_none());
        let job = queue.complete_by_callback(id).unwrap();
        assert_eq!(job.node_id(), Some(7));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_response_completion_matches_function() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(version_job());
        queue.advance(now).unwrap();
        queue.complete_by_ack(now);

        assert!(queue.complete_by_response(FunctionId::MemoryGetId.as_u8()).is_none());
        assert!(queue.complete_by_response(FunctionId::GetVersion.as_u8()).is_some());
    }

    #[test]
    fn test_refused_callback_job_completes() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(
            Job::new(FunctionId::RemoveFailedNodeId, &[6])
                .unwrap()
                .expect_callback(),
        );
        queue.advance(now).unwrap();
        queue.complete_by_ack(now);

        assert!(queue.complete_refused(FunctionId::SendData.as_u8()).is_none());
        let job = queue
            .complete_refused(FunctionId::RemoveFailedNodeId.as_u8())
            .unwrap();
        assert_eq!(job.args()[0], 6);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_retransmit_after_deadline() {
        let mut queue = queue_with_limit(3);
        let start = Instant::now();
        queue.enqueue(version_job());

        let first = queue.advance(start).unwrap();
        assert!(queue.advance(start + Duration::from_millis(50)).is_none());
        let second = queue.advance(start + Duration::from_millis(100)).unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.in_flight().unwrap().attempts(), 2);
        assert_eq!(queue.stats().retransmissions, 1);
    }

    #[test]
    fn test_unacked_jobs_are_all_dropped() {
        let limit = 3;
        let mut queue = queue_with_limit(limit);
        let mut now = Instant::now();
        for _ in 0..4 {
            queue.enqueue(version_job());
        }

        let mut writes = 0;
        while !queue.is_empty() {
            if queue.advance(now).is_some() {
                writes += 1;
                assert!(queue.in_flight().unwrap().attempts() <= limit);
            }
            now += Duration::from_millis(100);
        }

        assert_eq!(writes, 4 * limit as usize);
        assert_eq!(queue.dropped_count(), 4);
    }

    #[test]
    fn test_drop_moves_to_next_job() {
        let mut queue = queue_with_limit(1);
        let now = Instant::now();
        queue.enqueue(version_job());
        queue.enqueue(Job::new(FunctionId::MemoryGetId, &[]).unwrap());

        queue.advance(now).unwrap();
        let next = queue.advance(now + Duration::from_millis(100)).unwrap();
        assert_eq!(next[3], FunctionId::MemoryGetId.as_u8());
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn test_nak_forces_retransmit() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(version_job());
        queue.advance(now).unwrap();

        assert!(queue.expire_in_flight(now));
        assert!(queue.advance(now).is_some());
        assert_eq!(queue.in_flight().unwrap().attempts(), 2);
    }

    #[test]
    fn test_requeue_in_flight_goes_to_head() {
        let mut queue = queue_with_limit(3);
        let now = Instant::now();
        queue.enqueue(version_job());
        queue.enqueue(Job::new(FunctionId::MemoryGetId, &[]).unwrap());
        queue.advance(now).unwrap();

        queue.requeue_in_flight();
        assert!(queue.is_idle());
        let head = queue.pending().next().unwrap();
        assert_eq!(head.function(), FunctionId::GetVersion.as_u8());
        assert_eq!(head.attempts(), 1);
    }

    #[test]
    fn test_requeued_job_respects_retry_limit() {
        let limit = 2;
        let mut queue = queue_with_limit(limit);
        let start = Instant::now();
        queue.enqueue(version_job());
        queue.enqueue(Job::new(FunctionId::MemoryGetId, &[]).unwrap());

        queue.advance(start).unwrap();
        queue.advance(start + Duration::from_millis(100)).unwrap();
        assert_eq!(queue.in_flight().unwrap().attempts(), limit);

        // Link reopened after the last attempt
        queue.requeue_in_flight();
        let next = queue.advance(start + Duration::from_millis(150)).unwrap();
        assert_eq!(next[3], FunctionId::MemoryGetId.as_u8());
        assert_eq!(queue.stats().transmissions, 3);
        assert_eq!(queue.dropped_count(), 1);

        let dropped = queue.take_dropped();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].function(), FunctionId::GetVersion.as_u8());
        assert_eq!(dropped[0].attempts(), limit);
        assert!(queue.take_dropped().is_empty());
    }
}
