//! Deferred delivery for sleeping nodes
//!
//! Battery-powered nodes keep their radio off except for short wake
//! windows. Jobs for such nodes are staged here and moved onto the
//! [`JobQueue`] when the node announces it is awake.

use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

use crate::command_class;
use crate::error::Result;
use crate::function::FunctionId;
use crate::job::{Job, JobQueue};

/// Per-node staging of jobs for sleeping endpoints
#[derive(Debug, Default)]
pub struct WakeupQueue {
    staged: BTreeMap<u8, VecDeque<Job>>,
}

impl WakeupQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a job for a sleeping node, after any already staged for it
    pub fn stage(&mut self, node_id: u8, job: Job) {
        let jobs = self.staged.entry(node_id).or_default();
        jobs.push_back(job);
        trace!(node = node_id, staged = jobs.len(), "Job staged for sleeping node");
    }

    /// Move every job staged for `node_id` onto the job queue in order,
    /// followed by a no-more-information message
    ///
    /// A wake with nothing staged only queues the message when none is
    /// already waiting for that node. Returns the number of staged jobs
    /// released.
    pub fn on_wake(&mut self, node_id: u8, queue: &mut JobQueue) -> Result<usize> {
        let jobs = self.staged.remove(&node_id).unwrap_or_default();
        let released = jobs.len();
        for job in jobs {
            queue.enqueue(job);
        }

        if released == 0 && queue.jobs().any(|job| is_no_more_information(job, node_id)) {
            trace!(node = node_id, "No-more-information already queued");
            return Ok(0);
        }
        let no_more = Job::send_data(node_id, &command_class::wake_up_no_more_information())?;
        queue.enqueue(no_more);

        debug!(node = node_id, released, "Node awake, staged jobs released");
        Ok(released)
    }

    /// Jobs waiting for `node_id`
    pub fn pending_for(&self, node_id: u8) -> usize {
        self.staged.get(&node_id).map_or(0, VecDeque::len)
    }

    /// Drop everything staged for a node (e.g. when it leaves the network)
    pub fn discard(&mut self, node_id: u8) -> usize {
        self.staged.remove(&node_id).map_or(0, |jobs| jobs.len())
    }

    /// Drop everything staged for every node
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        self.staged.clear();
        n
    }

    /// Total staged jobs
    pub fn len(&self) -> usize {
        self.staged.values().map(VecDeque::len).sum()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.staged.values().all(VecDeque::is_empty)
    }
}

/// `[node][len][WAKE_UP][NO_MORE_INFORMATION]...` send-data job for `node_id`
fn is_no_more_information(job: &Job, node_id: u8) -> bool {
    job.function() == FunctionId::SendData.as_u8()
        && job.node_id() == Some(node_id)
        && job.args().get(2..4) == Some(&command_class::wake_up_no_more_information()[..])
}
