//! Protocol engine
//!
//! The engine is the only code that touches the transport. It runs one loop
//! that alternates between servicing the queues and a bounded read:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       ProtocolEngine                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌───────────┐   bytes   ┌─────────────┐   frames  ┌────────┐ │
//! │  │ Transport │──────────►│ FrameReader │──────────►│dispatch│ │
//! │  │           │◄──┐       └─────────────┘           └───┬────┘ │
//! │  └───────────┘   │                                     │      │
//! │             ACK/NAK/job frames          ┌──────────────▼────┐ │
//! │                  │                      │ Session (mutex)   │ │
//! │                  └──────────────────────│ queue · wakeup ·  │ │
//! │                                         │ intents · registry│ │
//! │                                         └──────────▲────────┘ │
//! └────────────────────────────────────────────────────┼──────────┘
//!                                                      │
//!                                               DriverHandle (callers)
//! ```
//!
//! Every valid inbound frame is ACKed before it is dispatched. Checksum
//! failures are NAKed; all corruption is handled here and only shows up in
//! the statistics.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zwave_serial::{DriverConfig, NoopHandler, ProtocolEngine, SerialTransport};
//!
//! let config = DriverConfig::default();
//! let transport = SerialTransport::from_config(&config.transport);
//! let (engine, handle) = ProtocolEngine::new(transport, &config, Arc::new(NoopHandler));
//!
//! tokio::spawn(engine.run());
//! handle.basic_set(5, 0xFF)?;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::command_class::{decode_command, CommandReport};
use crate::config::{DriverConfig, ACK, MAX_NODE_ID, NAK};
use crate::error::{DriverError, Result};
use crate::frame::{ControlByte, Direction, Frame, FrameReader, Inbound};
use crate::function::{
    failed_node, inclusion, neighbor_update, update_status, FunctionId, TRANSMIT_COMPLETE_OK,
};
use crate::handler::{self, ReportHandler};
use crate::intent::IntentKind;
use crate::job::{AckOutcome, Job};
use crate::memory;
use crate::registry::{ManufacturerInfo, VersionInfo};
use crate::session::{inclusion_job, query_job, query_subject, DriverHandle, Session};
use crate::transport::Transport;

/// Bytes requested per transport read
const READ_CHUNK: usize = 256;

/// Result of one engine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep running
    Continue,
    /// Shutdown was requested or every handle was dropped
    Shutdown,
}

enum Signal {
    /// Shutdown channel changed; `false` when every handle is gone
    Shutdown(bool),
    Notified,
    Read(Result<usize>),
}

/// Owner of the transport and the receive/dispatch loop
pub struct ProtocolEngine<T: Transport> {
    /// Controller link
    transport: T,
    /// State shared with the handles
    session: Arc<Mutex<Session>>,
    /// Report callbacks
    handler: Arc<dyn ReportHandler>,
    /// Inbound byte accumulator
    reader: FrameReader,
    /// Driver configuration
    config: DriverConfig,
    /// Signalled when a handle queues work
    wake: Arc<Notify>,
    /// Shutdown signal
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport + 'static> ProtocolEngine<T> {
    /// Create an engine and the handle used to drive it
    pub fn new(
        transport: T,
        config: &DriverConfig,
        handler: Arc<dyn ReportHandler>,
    ) -> (Self, DriverHandle) {
        let session = Arc::new(Mutex::new(Session::new(config)));
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = DriverHandle::new(session.clone(), wake.clone(), shutdown_tx);
        let engine = Self {
            transport,
            session,
            handler,
            reader: FrameReader::new(),
            config: config.clone(),
            wake,
            shutdown_rx,
        };

        (engine, handle)
    }

    /// Run the engine until shutdown
    ///
    /// Opens the transport, queues discovery when configured, then loops.
    /// Transport failures trigger reconnection; the loop ends with the
    /// transport error once reconnection is disabled or exhausted.
    pub async fn run(mut self) -> Result<()> {
        info!(transport = self.transport.name(), "Starting protocol engine");
        self.config.validate()?;
        self.start().await?;

        let result = loop {
            match self.step().await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Shutdown) => {
                    info!("Engine shutdown requested");
                    break Ok(());
                }
                Err(e) if e.is_retriable() => {
                    error!(error = %e, "Transport failure");
                    match self.try_reconnect(e).await {
                        Ok(StepOutcome::Continue) => {}
                        Ok(StepOutcome::Shutdown) => break Ok(()),
                        Err(e) => {
                            error!(error = %e, "Failed to reconnect");
                            break Err(e);
                        }
                    }
                }
                Err(e) if e.is_transport_error() => {
                    error!(error = %e, "Controller link lost");
                    break Err(e);
                }
                Err(e) if e.is_protocol_error() => {
                    debug!(error = %e, code = e.error_code(), "Protocol error");
                }
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "Engine step failed");
                }
            }
        };

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }
        self.session.lock().running = false;

        info!("Protocol engine stopped");
        result
    }

    /// Open the transport and queue discovery when configured
    pub async fn start(&mut self) -> Result<()> {
        self.transport.open().await?;
        info!(transport = self.transport.name(), "Controller link open");

        let mut session = self.session.lock();
        session.running = true;
        if self.config.protocol.discover_on_start {
            session.enqueue_discovery()?;
        }
        Ok(())
    }

    /// Run one iteration: service the queues, then one bounded read
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.service().await?;

        let timeout = self.config.protocol.read_timeout;
        let mut buf = [0u8; READ_CHUNK];
        let signal = tokio::select! {
            biased;
            changed = self.shutdown_rx.changed() => Signal::Shutdown(changed.is_ok()),
            read = self.transport.read(&mut buf, timeout) => Signal::Read(read),
            _ = self.wake.notified() => Signal::Notified,
        };

        match signal {
            Signal::Shutdown(open) => {
                if !open || *self.shutdown_rx.borrow() {
                    return Ok(StepOutcome::Shutdown);
                }
            }
            Signal::Notified => {}
            Signal::Read(read) => match read? {
                0 => self.on_quiet_link(),
                n => {
                    trace!(bytes = ?&buf[..n], "Received");
                    self.reader.push(&buf[..n]);
                    self.drain_inbound().await?;
                }
            },
        }

        self.session.lock().resyncing = self.reader.is_resyncing();
        Ok(StepOutcome::Continue)
    }

    /// Expire intents, run due polls and advance the job queue, writing at
    /// most one frame
    async fn service(&mut self) -> Result<()> {
        let now = Instant::now();
        let frame = {
            let mut session = self.session.lock();
            for intent in session.intents.expire(now) {
                match query_job(intent.kind, intent.node_id) {
                    Ok(job) => {
                        debug!(kind = ?intent.kind, node = intent.node_id, "Reissuing query");
                        session.submit(job);
                        session.intents.reissue(intent);
                    }
                    Err(e) => warn!(error = %e, "Cannot reissue query"),
                }
            }
            session.poll(now);
            session.advance(now)
        };

        if let Some(bytes) = frame {
            trace!(bytes = ?bytes, "Writing frame");
            self.transport.write(&bytes).await?;
        }
        Ok(())
    }

    /// A full read timeout passed with nothing received
    fn on_quiet_link(&mut self) {
        if !self.reader.has_partial() && !self.reader.is_resyncing() {
            return;
        }
        let dropped = self.reader.abandon_partial();
        if dropped > 0 {
            warn!(dropped, "Read timeout inside a frame, resynchronizing");
            let mut session = self.session.lock();
            session.stats.framing_errors += 1;
            session.stats.bytes_discarded += dropped as u64;
        }
    }

    async fn drain_inbound(&mut self) -> Result<()> {
        while let Some(item) = self.reader.next_inbound() {
            match item {
                Inbound::Frame(frame) => {
                    self.transport.write(&[ACK]).await?;
                    let reports = {
                        let mut session = self.session.lock();
                        session.stats.acks_sent += 1;
                        session.stats.frames_received += 1;
                        handle_frame(&mut session, &frame)
                    };
                    self.dispatch_reports(reports);
                }
                Inbound::Control(control) => {
                    let mut session = self.session.lock();
                    handle_control(&mut session, control, Instant::now());
                }
                Inbound::Corrupt(err) => {
                    warn!(error = %err, "Corrupt inbound data, resynchronizing");
                    if err.is_checksum() {
                        self.transport.write(&[NAK]).await?;
                        let mut session = self.session.lock();
                        session.stats.checksum_errors += 1;
                        session.stats.naks_sent += 1;
                    } else {
                        self.session.lock().stats.framing_errors += 1;
                    }
                }
                Inbound::Discarded(n) => {
                    self.session.lock().stats.bytes_discarded += n as u64;
                }
            }
        }
        Ok(())
    }

    /// Call the report handler outside the session lock
    fn dispatch_reports(&self, reports: Vec<(u8, CommandReport)>) {
        if reports.is_empty() {
            return;
        }
        let dispatched = reports
            .iter()
            .filter(|(node_id, report)| handler::dispatch(self.handler.as_ref(), *node_id, report))
            .count();
        if dispatched > 0 {
            self.session.lock().stats.reports_dispatched += dispatched as u64;
        }
    }

    /// Reopen the transport with exponential backoff
    async fn try_reconnect(&mut self, cause: DriverError) -> Result<StepOutcome> {
        let reconnect = self.config.reconnect.clone();
        if !reconnect.enabled {
            return Err(cause);
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }
        self.reader.reset();
        {
            let mut session = self.session.lock();
            session.resyncing = false;
            session.queue.requeue_in_flight();
        }

        let mut last_error = cause;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if reconnect.max_attempts != 0 && attempt > reconnect.max_attempts {
                error!(attempts = reconnect.max_attempts, "Giving up reconnecting");
                return Err(last_error);
            }

            let delay = reconnect.delay_for_attempt(attempt);
            warn!(attempt, delay = ?delay, "Attempting to reconnect to controller");
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => None,
                changed = self.shutdown_rx.changed() => Some(changed.is_ok()),
            };
            if let Some(open) = interrupted {
                if !open || *self.shutdown_rx.borrow() {
                    return Ok(StepOutcome::Shutdown);
                }
            }

            match self.transport.open().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to controller");
                    let mut session = self.session.lock();
                    session.stats.reconnects += 1;
                    if self.config.protocol.discover_on_start {
                        session.enqueue_discovery()?;
                    }
                    return Ok(StepOutcome::Continue);
                }
                Err(e) if e.is_transport_error() => {
                    warn!(attempt, error = %e, "Reconnect failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Transport (for inspection)
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> std::fmt::Debug for ProtocolEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("transport", &self.transport.name())
            .field("buffered", &self.reader.buffered_len())
            .finish()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn handle_control(session: &mut Session, control: ControlByte, now: Instant) {
    match control {
        ControlByte::Ack => {
            session.stats.acks_received += 1;
            match session.queue.complete_by_ack(now) {
                AckOutcome::Completed(job) => {
                    trace!(function = job.function(), "Job completed by ACK");
                }
                AckOutcome::AwaitingCallback => {
                    trace!("ACKed, awaiting callback");
                }
                AckOutcome::Unexpected => {
                    session.stats.unexpected_acks += 1;
                    debug!("ACK with nothing awaiting one");
                }
            }
        }
        ControlByte::Nak => {
            session.stats.naks_received += 1;
            warn!("Controller sent NAK, retransmitting");
            session.queue.expire_in_flight(now);
        }
        ControlByte::Cancel => {
            session.stats.cans_received += 1;
            warn!("Controller sent CAN, retransmitting");
            session.queue.expire_in_flight(now);
        }
        ControlByte::StartOfFrame | ControlByte::Unknown(_) => {}
    }
}

/// Complete the matching job and dispatch a frame by function identifier
///
/// Returns the reports to forward to the report handler.
fn handle_frame(session: &mut Session, frame: &Frame) -> Vec<(u8, CommandReport)> {
    let function = frame.function_id();
    let completed = match (frame.direction, function) {
        (Direction::Response, _) => session.queue.complete_by_response(frame.function),
        (Direction::Request, Some(f)) if f.carries_callback_id() && !is_progress(f, &frame.args) => {
            frame
                .arg(0)
                .and_then(|id| session.queue.complete_by_callback(id))
        }
        _ => None,
    };

    let Some(function) = function else {
        debug!(function = frame.function, "Ignoring unknown function");
        return Vec::new();
    };
    debug!(%function, direction = ?frame.direction, "Frame received");

    let args = &frame.args[..];
    match (frame.direction, function) {
        (Direction::Response, FunctionId::GetVersion) => apply_library_version(session, args),
        (Direction::Response, FunctionId::MemoryGetId) => apply_memory_id(session, args),
        (Direction::Response, FunctionId::GetInitData) => apply_init_data(session, args),
        (Direction::Response, FunctionId::GetNodeProtocolInfo) => {
            match resolve_subject(session, IntentKind::NodeProtocolInfo, completed.as_ref()) {
                Some(node_id) => {
                    if let Err(e) = session.registry.apply_protocol_info(node_id, args) {
                        debug!(node = node_id, error = %e, "Bad protocol info");
                    }
                }
                None => debug!("Protocol info without a pending intent"),
            }
        }
        (Direction::Response, FunctionId::GetRoutingInfo) => {
            match resolve_subject(session, IntentKind::RoutingInfo, completed.as_ref()) {
                Some(node_id) => {
                    let neighbors = bitmask_nodes(args).filter(|&n| n != node_id);
                    session.registry.set_neighbors(node_id, neighbors);
                }
                None => debug!("Routing info without a pending intent"),
            }
        }
        (Direction::Response, FunctionId::RequestNodeInfo) => {
            // A zero return value means the request was not queued for sending
            if args.first() == Some(&0) {
                if let Some(node_id) = completed.as_ref().and_then(Job::node_id) {
                    session.intents.resolve_node(IntentKind::NodeInfo, node_id);
                    warn!(node = node_id, "Controller refused node info request");
                }
            }
        }
        (Direction::Response, FunctionId::MemoryGetBuffer) => {
            if let Some(job) = &completed {
                apply_memory_chunk(session, job, args);
            }
        }
        (Direction::Request, FunctionId::ApplicationUpdate) => apply_update(session, args),
        (Direction::Request, FunctionId::AddNodeToNetwork) => apply_inclusion(session, args),
        (Direction::Request, FunctionId::RemoveNodeFromNetwork) => apply_exclusion(session, args),
        (Direction::Request, FunctionId::SendData) => {
            if let Some(&status) = args.get(1) {
                if status != TRANSMIT_COMPLETE_OK {
                    session.stats.transmit_failures += 1;
                    warn!(callback_id = args[0], status, "Transmission to node failed");
                }
            }
        }
        (Direction::Response, FunctionId::RemoveFailedNodeId) => {
            if let Some(&status) = args.first() {
                if status != failed_node::REMOVE_STARTED {
                    session.queue.complete_refused(frame.function);
                    warn!(status, "Controller refused to remove failed node");
                }
            }
        }
        (Direction::Response, FunctionId::AssignReturnRoute | FunctionId::AssignSucReturnRoute) => {
            // Zero means the controller is busy and will not call back
            if args.first() == Some(&0) {
                session.queue.complete_refused(frame.function);
                warn!(%function, "Controller refused route assignment");
            }
        }
        (Direction::Request, FunctionId::RemoveFailedNodeId) => {
            apply_failed_node_removal(session, completed.as_ref(), args)
        }
        (Direction::Request, FunctionId::RequestNodeNeighborUpdate) => {
            apply_neighbor_update(session, completed.as_ref(), args)
        }
        (Direction::Request, FunctionId::AssignReturnRoute | FunctionId::AssignSucReturnRoute) => {
            let node = completed.as_ref().and_then(|job| job.args().first().copied());
            match args.get(1) {
                Some(&TRANSMIT_COMPLETE_OK) => debug!(%function, node = ?node, "Return route assigned"),
                Some(&status) => warn!(%function, node = ?node, status, "Return route not assigned"),
                None => {}
            }
        }
        (Direction::Request, FunctionId::SetDefault) => {
            if completed.is_some() {
                if let Err(e) = session.reset_network() {
                    warn!(error = %e, "Cannot queue discovery after reset");
                }
            }
        }
        (Direction::Request, FunctionId::ApplicationCommandHandler) => {
            return apply_application_command(session, args);
        }
        _ => trace!(%function, "No dispatch for frame"),
    }
    Vec::new()
}

/// Intermediate callbacks that leave their job in flight
fn is_progress(function: FunctionId, args: &[u8]) -> bool {
    function == FunctionId::RequestNodeNeighborUpdate && args.get(1) == Some(&neighbor_update::STARTED)
}

/// Node an identifier-less query response belongs to
///
/// The completed job names the node; without one the oldest intent of the
/// kind is used.
fn resolve_subject(session: &mut Session, kind: IntentKind, completed: Option<&Job>) -> Option<u8> {
    match completed.and_then(query_subject) {
        Some((job_kind, node_id)) if job_kind == kind => {
            session.intents.resolve_node(kind, node_id);
            Some(node_id)
        }
        _ => session.intents.resolve(kind).map(|intent| intent.node_id),
    }
}

/// Node ids set in a node bitmask (bit 0 of byte 0 is node 1)
fn bitmask_nodes(mask: &[u8]) -> impl Iterator<Item = u8> + '_ {
    mask.iter().enumerate().flat_map(|(index, &byte)| {
        (0..8u8).filter_map(move |bit| {
            let node = index * 8 + usize::from(bit) + 1;
            (byte & (1u8 << bit) != 0 && node <= usize::from(MAX_NODE_ID)).then_some(node as u8)
        })
    })
}

/// `[len][body...]` clamped to what the frame carries
fn length_prefixed(bytes: &[u8]) -> &[u8] {
    match bytes.split_first() {
        Some((&len, rest)) => &rest[..rest.len().min(usize::from(len))],
        None => &[],
    }
}

fn apply_library_version(session: &mut Session, args: &[u8]) {
    let end = args.iter().position(|&b| b == 0).unwrap_or(args.len());
    let version = String::from_utf8_lossy(&args[..end]).trim().to_string();
    let library_type = args.get(end + 1).copied();
    info!(version = %version, library_type = ?library_type, "Controller library");
    session.controller.library_version = Some(version);
    session.controller.library_type = library_type;
}

fn apply_memory_id(session: &mut Session, args: &[u8]) {
    let [h0, h1, h2, h3, node_id, ..] = args else {
        debug!("Short memory id response");
        return;
    };
    let home_id = u32::from_be_bytes([*h0, *h1, *h2, *h3]);
    info!(home_id = %format!("{:08X}", home_id), node = node_id, "Controller identity");
    session.controller.home_id = Some(home_id);
    session.controller.node_id = Some(*node_id);
    session.registry.mark_seen(*node_id);
}

fn apply_init_data(session: &mut Session, args: &[u8]) {
    let [_version, capabilities, rest @ ..] = args else {
        debug!("Short init data response");
        return;
    };
    session.controller.capabilities = Some(*capabilities);

    let nodes: Vec<u8> = bitmask_nodes(length_prefixed(rest)).collect();
    info!(nodes = nodes.len(), "Node list received");
    for node_id in nodes {
        session.registry.mark_seen(node_id);
        if let Err(e) = session.submit_query(IntentKind::NodeProtocolInfo, node_id) {
            warn!(node = node_id, error = %e, "Cannot queue protocol info query");
        }
    }
}

fn apply_memory_chunk(session: &mut Session, job: &Job, data: &[u8]) {
    let Some(offset) = memory::offset_of(job.args()) else {
        return;
    };
    if let Err(e) = session.memory.store_chunk(offset, data) {
        warn!(offset, error = %e, "Memory chunk outside snapshot");
    }
}

/// `[status][node][len][basic][generic][specific][classes...]`
fn apply_update(session: &mut Session, args: &[u8]) {
    let [status, node_id, rest @ ..] = args else {
        return;
    };
    let (status, node_id) = (*status, *node_id);
    let info = length_prefixed(rest);

    match status {
        update_status::NODE_INFO_RECEIVED => {
            session.intents.resolve_node(IntentKind::NodeInfo, node_id);
            match session.registry.apply_node_info(node_id, info) {
                Ok(()) => debug!(node = node_id, "Node info received"),
                Err(e) => debug!(node = node_id, error = %e, "Bad node info"),
            }
        }
        update_status::NODE_INFO_REQ_FAILED => match session.intents.resolve(IntentKind::NodeInfo) {
            Some(intent) => warn!(node = intent.node_id, "Node info request failed"),
            None => debug!("Node info failure without a pending intent"),
        },
        update_status::NEW_ID_ASSIGNED => {
            info!(node = node_id, "Node added by another controller");
            if session.registry.apply_node_info(node_id, info).is_err() {
                session.registry.mark_seen(node_id);
            }
        }
        update_status::DELETE_DONE => {
            info!(node = node_id, "Node removed by another controller");
            remove_node(session, node_id);
        }
        other => trace!(status = other, node = node_id, "Unhandled application update"),
    }
}

/// `[callback id][status]`
fn apply_failed_node_removal(session: &mut Session, job: Option<&Job>, args: &[u8]) {
    let (Some(node_id), Some(&status)) = (job.and_then(|j| j.args().first().copied()), args.get(1))
    else {
        return;
    };
    match status {
        failed_node::REMOVED => {
            info!(node = node_id, "Failed node removed");
            remove_node(session, node_id);
        }
        failed_node::NODE_OK => info!(node = node_id, "Node answered, not removed"),
        failed_node::NOT_REMOVED => warn!(node = node_id, "Failed node could not be removed"),
        other => trace!(node = node_id, status = other, "Unhandled failed node status"),
    }
}

/// `[callback id][status]`
fn apply_neighbor_update(session: &mut Session, job: Option<&Job>, args: &[u8]) {
    let node = job.and_then(|j| j.args().first().copied());
    match args.get(1) {
        Some(&neighbor_update::STARTED) => debug!(node = ?node, "Neighbour update started"),
        Some(&neighbor_update::DONE) => {
            let Some(node_id) = node else {
                return;
            };
            debug!(node = node_id, "Neighbour update done");
            if let Err(e) = session.submit_query(IntentKind::RoutingInfo, node_id) {
                warn!(node = node_id, error = %e, "Cannot queue routing info query");
            }
        }
        Some(&neighbor_update::FAILED) => warn!(node = ?node, "Neighbour update failed"),
        Some(&other) => trace!(node = ?node, status = other, "Unhandled neighbour update status"),
        None => {}
    }
}

fn remove_node(session: &mut Session, node_id: u8) {
    session.registry.remove(node_id);
    let discarded = session.wakeup.discard(node_id);
    if discarded > 0 {
        debug!(node = node_id, discarded, "Discarded staged jobs");
    }
}

/// `[callback id][status][node][len][node info...]`
fn apply_inclusion(session: &mut Session, args: &[u8]) {
    let [_callback_id, status, node_id, rest @ ..] = args else {
        return;
    };
    let (status, node_id) = (*status, *node_id);

    match status {
        inclusion::STATUS_LEARN_READY => info!("Controller ready to include a node"),
        inclusion::STATUS_NODE_FOUND => info!("Node found"),
        inclusion::STATUS_SLAVE | inclusion::STATUS_CONTROLLER if node_id != 0 => {
            info!(node = node_id, "Node included");
            if session
                .registry
                .apply_node_info(node_id, length_prefixed(rest))
                .is_err()
            {
                session.registry.mark_seen(node_id);
            }
        }
        inclusion::STATUS_PROTOCOL_DONE | inclusion::STATUS_FAILED => {
            if status == inclusion::STATUS_FAILED {
                warn!("Inclusion failed");
            }
            queue_inclusion_stop(session, FunctionId::AddNodeToNetwork);
        }
        inclusion::STATUS_DONE => info!("Inclusion finished"),
        other => trace!(status = other, "Unhandled inclusion status"),
    }
}

fn apply_exclusion(session: &mut Session, args: &[u8]) {
    let [_callback_id, status, node_id, ..] = args else {
        return;
    };
    let (status, node_id) = (*status, *node_id);

    match status {
        inclusion::STATUS_LEARN_READY => info!("Controller ready to exclude a node"),
        inclusion::STATUS_NODE_FOUND => info!("Node found"),
        inclusion::STATUS_SLAVE | inclusion::STATUS_CONTROLLER if node_id != 0 => {
            info!(node = node_id, "Node excluded");
            remove_node(session, node_id);
        }
        inclusion::STATUS_DONE | inclusion::STATUS_FAILED => {
            if status == inclusion::STATUS_FAILED {
                warn!("Exclusion failed");
            }
            queue_inclusion_stop(session, FunctionId::RemoveNodeFromNetwork);
        }
        other => trace!(status = other, "Unhandled exclusion status"),
    }
}

fn queue_inclusion_stop(session: &mut Session, function: FunctionId) {
    match inclusion_job(function, inclusion::MODE_STOP) {
        Ok(job) => {
            session.queue.enqueue(job);
        }
        Err(e) => warn!(error = %e, "Cannot queue inclusion stop"),
    }
}

/// `[rx status][source node][len][command...]`
fn apply_application_command(session: &mut Session, args: &[u8]) -> Vec<(u8, CommandReport)> {
    let [_rx_status, node_id, rest @ ..] = args else {
        return Vec::new();
    };
    let node_id = *node_id;
    let command = length_prefixed(rest);

    session.registry.mark_seen(node_id);
    let Some(report) = decode_command(command) else {
        trace!(node = node_id, command = ?command, "Untracked command");
        return Vec::new();
    };
    debug!(node = node_id, report = ?report, "Report received");

    apply_report(session, node_id, &report);

    vec![(node_id, report)]
}

/// Record what a report says about the node that sent it
fn apply_report(session: &mut Session, node_id: u8, report: &CommandReport) {
    let registry = &mut session.registry;
    match report {
        CommandReport::Basic { value, .. } => registry.set_basic_value(node_id, *value),
        CommandReport::Battery { level } => registry.set_battery_level(node_id, *level),
        CommandReport::WakeUpNotification => {
            registry.upsert(node_id).sleeping = true;
            if let Err(e) = session.wakeup.on_wake(node_id, &mut session.queue) {
                warn!(node = node_id, error = %e, "Cannot release staged jobs");
            }
        }
        CommandReport::WakeUpInterval { seconds, .. } => {
            registry.set_wakeup_interval(node_id, *seconds)
        }
        CommandReport::ManufacturerSpecific {
            manufacturer_id,
            product_type,
            product_id,
        } => registry.apply_manufacturer_info(
            node_id,
            ManufacturerInfo {
                manufacturer_id: *manufacturer_id,
                product_type: *product_type,
                product_id: *product_id,
            },
        ),
        CommandReport::Version {
            library_type,
            protocol,
            application,
        } => registry.apply_version_info(
            node_id,
            VersionInfo {
                library_type: *library_type,
                protocol: *protocol,
                application: *application,
            },
        ),
        CommandReport::CommandClassVersion { class, version } => {
            registry.apply_command_class_version(node_id, *class, *version)
        }
        CommandReport::Association { group, members, .. } => {
            if let Err(e) = registry.set_association_members(node_id, *group, members.iter().copied()) {
                debug!(node = node_id, error = %e, "Association report ignored");
            }
        }
        CommandReport::MultiInstance { class, instances } => {
            registry.set_instances(node_id, *class, *instances)
        }
        CommandReport::Encapsulated { instance, report } => {
            trace!(node = node_id, instance, "Instance report");
            // An instance's value is not the node's own basic value
            if !matches!(report.as_ref(), CommandReport::Basic { .. }) {
                apply_report(session, node_id, report);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_class::class;
    use crate::config::DriverConfigBuilder;
    use crate::session::EngineState;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(&DriverConfigBuilder::new().build())
    }

    fn request(function: FunctionId, args: &[u8]) -> Frame {
        Frame::new(Direction::Request, function.as_u8(), args.to_vec())
    }

    fn response(function: FunctionId, args: &[u8]) -> Frame {
        Frame::new(Direction::Response, function.as_u8(), args.to_vec())
    }

    /// Write `job` and ACK it, returning its callback id
    fn transmit_and_ack(session: &mut Session, job: Job) -> u8 {
        let id = session.queue.enqueue(job);
        let now = Instant::now();
        session.advance(now).unwrap();
        handle_control(session, ControlByte::Ack, now);
        id
    }

    #[test]
    fn test_bitmask_nodes() {
        let nodes: Vec<u8> = bitmask_nodes(&[0b0000_0101, 0x00, 0b1000_0000]).collect();
        assert_eq!(nodes, vec![1, 3, 24]);
    }

    #[test]
    fn test_init_data_registers_nodes_and_queries() {
        let mut session = session();
        handle_frame(
            &mut session,
            &response(FunctionId::GetInitData, &[0x05, 0x08, 2, 0b0000_0011, 0b0000_0001]),
        );

        assert_eq!(session.registry.node_ids(), vec![1, 2, 9]);
        assert_eq!(session.intents.pending(IntentKind::NodeProtocolInfo), 3);
        assert_eq!(session.queue.len(), 3);
        assert_eq!(session.controller.capabilities, Some(0x08));
    }

    #[test]
    fn test_protocol_info_resolves_oldest_intent() {
        let mut session = session();
        session.submit_query(IntentKind::NodeProtocolInfo, 4).unwrap();
        session.submit_query(IntentKind::NodeProtocolInfo, 5).unwrap();

        let listening = [0x80, 0x00, 0x00, 0x04, 0x10, 0x01];
        let sleeping = [0x00, 0x00, 0x00, 0x04, 0x21, 0x01];
        handle_frame(&mut session, &response(FunctionId::GetNodeProtocolInfo, &listening));
        handle_frame(&mut session, &response(FunctionId::GetNodeProtocolInfo, &sleeping));

        assert!(!session.registry.is_sleeping(4));
        assert!(session.registry.is_sleeping(5));
        assert_eq!(session.intents.len(), 0);
    }

    #[test]
    fn test_protocol_info_follows_the_query_it_answers() {
        let config = DriverConfigBuilder::new()
            .retry_limit(1)
            .ack_timeout(Duration::from_millis(100))
            .build();
        let mut session = Session::new(&config);
        let start = Instant::now();
        session.submit_query(IntentKind::NodeProtocolInfo, 3).unwrap();
        session.submit_query(IntentKind::NodeProtocolInfo, 4).unwrap();

        // Node 3's query goes unanswered and is dropped
        session.advance(start).unwrap();
        let later = start + Duration::from_millis(100);
        session.advance(later).unwrap();
        handle_control(&mut session, ControlByte::Ack, later);
        handle_frame(
            &mut session,
            &response(FunctionId::GetNodeProtocolInfo, &[0x00, 0x00, 0x00, 0x04, 0x21, 0x01]),
        );

        assert!(session.registry.is_sleeping(4));
        assert!(!session.registry.contains(3));
        assert!(session.intents.is_empty());
        assert_eq!(session.intents.stats().cancelled, 1);
    }

    #[test]
    fn test_routing_info_sets_neighbors() {
        let mut session = session();
        session.submit_query(IntentKind::RoutingInfo, 2).unwrap();
        handle_frame(&mut session, &response(FunctionId::GetRoutingInfo, &[0b0000_1011]));

        let node = session.registry.get(2).unwrap();
        assert_eq!(node.neighbors.iter().copied().collect::<Vec<_>>(), vec![1, 4]);
        assert!(session.registry.contains(4));
    }

    #[test]
    fn test_node_info_update_applies_capabilities() {
        let mut session = session();
        session.submit_query(IntentKind::NodeInfo, 6).unwrap();

        handle_frame(
            &mut session,
            &request(
                FunctionId::ApplicationUpdate,
                &[0x84, 6, 5, 0x04, 0x11, 0x01, 0x26, 0x20],
            ),
        );
        let node = session.registry.get(6).unwrap();
        assert!(node.supports(class::SWITCH_MULTILEVEL));
        assert_eq!(session.intents.pending(IntentKind::NodeInfo), 0);
    }

    #[test]
    fn test_node_info_failure_resolves_oldest() {
        let mut session = session();
        session.submit_query(IntentKind::NodeInfo, 3).unwrap();
        session.submit_query(IntentKind::NodeInfo, 7).unwrap();

        handle_frame(&mut session, &request(FunctionId::ApplicationUpdate, &[0x81, 0, 0]));
        assert_eq!(
            session.intents.resolve(IntentKind::NodeInfo).unwrap().node_id,
            7
        );
    }

    #[test]
    fn test_application_command_updates_registry_and_reports() {
        let mut session = session();
        let reports = handle_frame(
            &mut session,
            &request(
                FunctionId::ApplicationCommandHandler,
                &[0x00, 12, 3, 0x80, 0x03, 0x4B],
            ),
        );

        assert_eq!(reports, vec![(12, CommandReport::Battery { level: 0x4B })]);
        assert_eq!(session.registry.get(12).unwrap().battery_level, Some(0x4B));
    }

    #[test]
    fn test_instance_reports_keep_node_basic_value() {
        let mut session = session();
        let reports = handle_frame(
            &mut session,
            &request(
                FunctionId::ApplicationCommandHandler,
                &[0x00, 9, 6, 0x60, 0x06, 0x02, 0x20, 0x03, 0xFF],
            ),
        );

        assert_eq!(
            reports,
            vec![(
                9,
                CommandReport::Encapsulated {
                    instance: 2,
                    report: Box::new(CommandReport::Basic {
                        class: class::BASIC,
                        value: 0xFF
                    }),
                }
            )]
        );
        assert_eq!(session.registry.get(9).unwrap().basic_value, None);
    }

    #[test]
    fn test_wakeup_notification_releases_staged_jobs() {
        let mut session = session();
        session
            .registry
            .apply_node_info(8, &[0x04, 0x21, 0x01, 0x84, 0x31])
            .unwrap();
        let job = Job::send_data(8, &[0x31, 0x04]).unwrap();
        assert_eq!(session.submit(job), crate::session::Delivery::Staged);
        assert!(session.queue.is_empty());

        handle_frame(
            &mut session,
            &request(FunctionId::ApplicationCommandHandler, &[0x00, 8, 2, 0x84, 0x07]),
        );
        // Staged job plus no-more-information
        assert_eq!(session.queue.len(), 2);
        assert_eq!(session.wakeup.pending_for(8), 0);
    }

    #[test]
    fn test_exclusion_removes_node() {
        let mut session = session();
        session.registry.mark_seen(9);
        session
            .registry
            .set_association_members(1, 1, [9])
            .unwrap();
        session.wakeup.stage(9, Job::send_data(9, &[0x20, 0x02]).unwrap());

        handle_frame(
            &mut session,
            &request(FunctionId::RemoveNodeFromNetwork, &[1, 0x03, 9, 0]),
        );
        assert!(!session.registry.contains(9));
        assert!(!session.registry.get(1).unwrap().references(9));
        assert_eq!(session.wakeup.pending_for(9), 0);
    }

    #[test]
    fn test_inclusion_protocol_done_queues_stop() {
        let mut session = session();
        handle_frame(
            &mut session,
            &request(
                FunctionId::AddNodeToNetwork,
                &[1, 0x03, 14, 3, 0x04, 0x10, 0x01],
            ),
        );
        assert!(session.registry.contains(14));

        handle_frame(
            &mut session,
            &request(FunctionId::AddNodeToNetwork, &[1, 0x05, 14, 0]),
        );
        let stop = session.queue.pending().last().unwrap();
        assert_eq!(stop.args(), &[inclusion::MODE_STOP, 0]);
        assert!(!stop.expects_callback());
    }

    #[test]
    fn test_neighbor_update_done_requests_routing_info() {
        let mut session = session();
        let job = Job::new(FunctionId::RequestNodeNeighborUpdate, &[5])
            .unwrap()
            .expect_callback();
        let id = transmit_and_ack(&mut session, job);

        handle_frame(
            &mut session,
            &request(FunctionId::RequestNodeNeighborUpdate, &[id, neighbor_update::STARTED]),
        );
        assert_eq!(session.state(), EngineState::AwaitingCallback);

        handle_frame(
            &mut session,
            &request(FunctionId::RequestNodeNeighborUpdate, &[id, neighbor_update::DONE]),
        );
        assert!(session.queue.is_idle());
        assert_eq!(session.intents.pending(IntentKind::RoutingInfo), 1);
        let query = session.queue.pending().next().unwrap();
        assert_eq!(query.function(), FunctionId::GetRoutingInfo.as_u8());
        assert_eq!(query.args()[0], 5);
    }

    #[test]
    fn test_failed_node_removal() {
        let mut session = session();
        session.registry.mark_seen(6);
        session.registry.set_association_members(1, 1, [6]).unwrap();
        let job = Job::new(FunctionId::RemoveFailedNodeId, &[6])
            .unwrap()
            .expect_callback();
        let id = transmit_and_ack(&mut session, job);

        handle_frame(
            &mut session,
            &response(FunctionId::RemoveFailedNodeId, &[failed_node::REMOVE_STARTED]),
        );
        assert_eq!(session.state(), EngineState::AwaitingCallback);

        handle_frame(
            &mut session,
            &request(FunctionId::RemoveFailedNodeId, &[id, failed_node::REMOVED]),
        );
        assert!(session.queue.is_idle());
        assert!(!session.registry.contains(6));
        assert!(!session.registry.get(1).unwrap().references(6));
    }

    #[test]
    fn test_refused_failed_node_removal_finishes_job() {
        let mut session = session();
        session.registry.mark_seen(6);
        let job = Job::new(FunctionId::RemoveFailedNodeId, &[6])
            .unwrap()
            .expect_callback();
        transmit_and_ack(&mut session, job);

        handle_frame(&mut session, &response(FunctionId::RemoveFailedNodeId, &[0x08]));
        assert!(session.queue.is_idle());
        assert!(session.registry.contains(6));
    }

    #[test]
    fn test_set_default_resets_network() {
        let mut session = session();
        session.registry.mark_seen(4);
        session.controller.home_id = Some(0xDEADBEEF);
        let job = Job::new(FunctionId::SetDefault, &[]).unwrap().expect_callback();
        let id = transmit_and_ack(&mut session, job);

        handle_frame(&mut session, &request(FunctionId::SetDefault, &[id]));
        assert!(session.registry.is_empty());
        assert_eq!(session.controller.home_id, None);
        // Rediscovery
        assert_eq!(session.queue.len(), 3);
    }

    #[test]
    fn test_controller_identity() {
        let mut session = session();
        handle_frame(
            &mut session,
            &response(FunctionId::MemoryGetId, &[0xDE, 0xAD, 0xBE, 0xEF, 1]),
        );
        handle_frame(
            &mut session,
            &response(FunctionId::GetVersion, b"Z-Wave 4.05\0\x01"),
        );
        assert_eq!(session.controller.home_id, Some(0xDEADBEEF));
        assert_eq!(session.controller.node_id, Some(1));
        assert_eq!(session.controller.library_version.as_deref(), Some("Z-Wave 4.05"));
        assert_eq!(session.controller.library_type, Some(1));
    }

    #[test]
    fn test_nak_and_can_expire_in_flight() {
        let mut session = session();
        let now = Instant::now();
        session
            .queue
            .enqueue(Job::new(FunctionId::GetVersion, &[]).unwrap().expect_response());
        session.queue.advance(now).unwrap();
        assert_eq!(session.state(), EngineState::AwaitingAck);

        handle_control(&mut session, ControlByte::Nak, now);
        assert!(session.queue.advance(now).is_some());
        handle_control(&mut session, ControlByte::Cancel, now);
        assert!(session.queue.advance(now).is_some());
        assert_eq!(session.stats.naks_received, 1);
        assert_eq!(session.stats.cans_received, 1);
        assert_eq!(session.queue.in_flight().unwrap().attempts(), 3);
    }
}
