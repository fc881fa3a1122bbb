//! Driver session state and the public handle
//!
//! All state shared between callers and the engine task lives in one
//! `Session` behind a single mutex: the job queue, the wakeup queue, the
//! intent tracker, the node registry and the memory snapshot. Callers hold a
//! cloneable [`DriverHandle`]; every public operation builds a job, takes the
//! lock briefly to queue it, and returns without waiting for the controller.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::command_class::{self, association, class, ScaledValue};
use crate::config::{DriverConfig, ASSOCIATION_GROUPS, BROADCAST_NODE_ID, MAX_NODE_ID};
use crate::error::{DriverError, Result};
use crate::function::{inclusion, FunctionId};
use crate::intent::{IntentKind, IntentTracker};
use crate::job::{InFlightPhase, Job, JobQueue};
use crate::memory::{self, MemorySnapshot, MEMORY_CHUNK_SIZE};
use crate::registry::{DeviceDescriptors, DeviceTemplate, Node, NodeRegistry};
use crate::wakeup::WakeupQueue;

/// Protocol engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing in flight
    Idle,
    /// A job was written and the controller has not ACKed it
    AwaitingAck,
    /// A job was ACKed and waits for its response or callback
    AwaitingCallback,
    /// Inbound bytes are discarded until the next start of frame
    Resynchronizing,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::AwaitingAck => write!(f, "awaiting-ack"),
            EngineState::AwaitingCallback => write!(f, "awaiting-callback"),
            EngineState::Resynchronizing => write!(f, "resynchronizing"),
        }
    }
}

/// Where a submitted job went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// On the job queue, with the callback identifier assigned (0 if none)
    Queued { callback_id: u8 },
    /// Staged until the sleeping target wakes up
    Staged,
}

/// What the controller reported about itself during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerInfo {
    /// Network home id
    pub home_id: Option<u32>,
    /// The controller's own node id
    pub node_id: Option<u8>,
    /// Library version string
    pub library_version: Option<String>,
    /// Library type
    pub library_type: Option<u8>,
    /// Serial API capability flags from the init data
    pub capabilities: Option<u8>,
}

/// Driver statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Data frames written (first transmissions and retries)
    pub frames_sent: u64,
    /// Valid data frames received
    pub frames_received: u64,
    /// ACKs written for inbound frames
    pub acks_sent: u64,
    /// NAKs written for corrupt frames
    pub naks_sent: u64,
    /// ACKs received
    pub acks_received: u64,
    /// NAKs received
    pub naks_received: u64,
    /// CANs received
    pub cans_received: u64,
    /// ACKs received with nothing waiting for one
    pub unexpected_acks: u64,
    /// Frames that failed checksum validation
    pub checksum_errors: u64,
    /// Malformed lengths and stray bytes
    pub framing_errors: u64,
    /// Bytes thrown away while resynchronizing
    pub bytes_discarded: u64,
    /// Jobs accepted onto the job queue
    pub jobs_enqueued: u64,
    /// Jobs staged for sleeping nodes
    pub jobs_staged: u64,
    /// Jobs finished
    pub jobs_completed: u64,
    /// Jobs dropped after the retry limit
    pub jobs_dropped: u64,
    /// Retransmissions
    pub retransmissions: u64,
    /// Send-data callbacks reporting a failed transmission
    pub transmit_failures: u64,
    /// Intents registered
    pub intents_registered: u64,
    /// Intents matched to a response
    pub intents_resolved: u64,
    /// Intents abandoned
    pub intents_expired: u64,
    /// Intent queries reissued
    pub intents_reissued: u64,
    /// Intents retired because their query was dropped
    pub intents_cancelled: u64,
    /// Poll rounds run
    pub poll_rounds: u64,
    /// Basic gets queued by polling
    pub polls_queued: u64,
    /// Reports forwarded to the report handler
    pub reports_dispatched: u64,
    /// Transport reconnections
    pub reconnects: u64,
}

/// Mutable state shared by the handle and the engine
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) queue: JobQueue,
    pub(crate) wakeup: WakeupQueue,
    pub(crate) intents: IntentTracker,
    pub(crate) registry: NodeRegistry,
    pub(crate) memory: MemorySnapshot,
    pub(crate) controller: ControllerInfo,
    pub(crate) stats: DriverStats,
    pub(crate) resyncing: bool,
    pub(crate) running: bool,
    poll_interval: Duration,
    next_poll: Option<Instant>,
}

impl Session {
    pub(crate) fn new(config: &DriverConfig) -> Self {
        Self {
            queue: JobQueue::new(&config.protocol),
            wakeup: WakeupQueue::new(),
            intents: IntentTracker::new(&config.protocol),
            registry: NodeRegistry::new(),
            memory: MemorySnapshot::new(),
            controller: ControllerInfo::default(),
            stats: DriverStats::default(),
            resyncing: false,
            running: false,
            poll_interval: config.protocol.poll_interval,
            next_poll: None,
        }
    }

    /// Queue a job, or stage it when its target is asleep
    pub(crate) fn submit(&mut self, job: Job) -> Delivery {
        match job.node_id() {
            Some(node_id) if self.registry.is_sleeping(node_id) => {
                self.wakeup.stage(node_id, job);
                self.stats.jobs_staged += 1;
                Delivery::Staged
            }
            _ => Delivery::Queued {
                callback_id: self.queue.enqueue(job),
            },
        }
    }

    /// Register an intent and submit the query it stands for
    pub(crate) fn submit_query(&mut self, kind: IntentKind, node_id: u8) -> Result<Delivery> {
        let job = query_job(kind, node_id)?;
        self.intents.register(kind, node_id);
        Ok(self.submit(job))
    }

    /// Advance the job queue, keeping intents in step with their queries
    ///
    /// A query dropped after its retries retires its intent; a query written
    /// to the link starts (or restarts) its intent's window.
    pub(crate) fn advance(&mut self, now: Instant) -> Option<Vec<u8>> {
        let frame = self.queue.advance(now);
        for job in self.queue.take_dropped() {
            if let Some((kind, node_id)) = query_subject(&job) {
                self.intents.cancel(kind, node_id);
            }
        }
        if frame.is_some() {
            if let Some((kind, node_id)) = self.queue.in_flight().and_then(query_subject) {
                self.intents.arm(kind, node_id, now);
            }
        }
        frame
    }

    /// Queue a basic get for every listening device once per poll interval
    ///
    /// Returns the number of gets queued. Nodes that already have work queued
    /// are skipped for this round.
    pub(crate) fn poll(&mut self, now: Instant) -> usize {
        match self.next_poll {
            Some(due) if due <= now => {}
            _ => return 0,
        }
        self.next_poll = Some(now + self.poll_interval);
        self.stats.poll_rounds += 1;

        let controller = self.controller.node_id;
        let targets: Vec<u8> = self
            .registry
            .node_ids()
            .into_iter()
            .filter(|&id| Some(id) != controller)
            .filter(|&id| {
                self.registry.get(id).is_some_and(|node| {
                    !node.sleeping
                        && !matches!(
                            node.template,
                            DeviceTemplate::Controller | DeviceTemplate::StaticController
                        )
                })
            })
            .filter(|&id| !self.queue.jobs().any(|job| job.node_id() == Some(id)))
            .collect();

        let mut queued = 0;
        for node_id in targets {
            match Job::send_data(node_id, &command_class::value_get(class::BASIC)) {
                Ok(job) => {
                    self.queue.enqueue(job);
                    queued += 1;
                }
                Err(e) => debug!(node = node_id, error = %e, "Cannot queue poll"),
            }
        }
        self.stats.polls_queued += queued as u64;
        trace!(queued, "Poll round");
        queued
    }

    /// Forget the network after the controller was reset to defaults, then
    /// rediscover it
    pub(crate) fn reset_network(&mut self) -> Result<()> {
        self.registry.clear();
        let staged = self.wakeup.clear();
        let cancelled = self.intents.clear();
        self.controller = ControllerInfo::default();
        info!(staged, cancelled, "Controller reset to defaults");
        self.enqueue_discovery()
    }

    /// Queue version, home id and init data requests
    pub(crate) fn enqueue_discovery(&mut self) -> Result<()> {
        for function in [
            FunctionId::GetVersion,
            FunctionId::MemoryGetId,
            FunctionId::GetInitData,
        ] {
            self.queue.enqueue(Job::new(function, &[])?.expect_response());
        }
        info!("Discovery queued");
        Ok(())
    }

    pub(crate) fn state(&self) -> EngineState {
        if self.resyncing {
            return EngineState::Resynchronizing;
        }
        match self.queue.phase() {
            None => EngineState::Idle,
            Some(InFlightPhase::AwaitingAck) => EngineState::AwaitingAck,
            Some(InFlightPhase::AwaitingCallback) => EngineState::AwaitingCallback,
        }
    }

    pub(crate) fn stats_snapshot(&self) -> DriverStats {
        let queue = self.queue.stats();
        let intents = self.intents.stats();
        DriverStats {
            frames_sent: queue.transmissions,
            jobs_enqueued: queue.enqueued,
            jobs_completed: queue.completed,
            jobs_dropped: queue.dropped,
            retransmissions: queue.retransmissions,
            intents_registered: intents.registered,
            intents_resolved: intents.resolved,
            intents_expired: intents.expired,
            intents_reissued: intents.reissued,
            intents_cancelled: intents.cancelled,
            ..self.stats.clone()
        }
    }
}

/// Build the query an intent stands for
///
/// These are answered by the controller itself, except node info requests
/// which go over the air to the node.
pub(crate) fn query_job(kind: IntentKind, node_id: u8) -> Result<Job> {
    let job = match kind {
        IntentKind::NodeProtocolInfo => {
            Job::new(FunctionId::GetNodeProtocolInfo, &[node_id])?.expect_response()
        }
        IntentKind::RoutingInfo => {
            Job::new(FunctionId::GetRoutingInfo, &[node_id, 0, 0])?.expect_response()
        }
        IntentKind::NodeInfo => Job::new(FunctionId::RequestNodeInfo, &[node_id])?
            .for_node(node_id)
            .expect_response(),
    };
    Ok(job)
}

/// Intent kind and node of a query job, if the job is one
pub(crate) fn query_subject(job: &Job) -> Option<(IntentKind, u8)> {
    let kind = match FunctionId::from_u8(job.function())? {
        FunctionId::GetNodeProtocolInfo => IntentKind::NodeProtocolInfo,
        FunctionId::GetRoutingInfo => IntentKind::RoutingInfo,
        FunctionId::RequestNodeInfo => IntentKind::NodeInfo,
        _ => return None,
    };
    Some((kind, *job.args().first()?))
}

/// Add/remove node request
///
/// Stop requests carry callback id 0 so the controller sends no callback
/// for them.
pub(crate) fn inclusion_job(function: FunctionId, mode: u8) -> Result<Job> {
    if mode == inclusion::MODE_STOP {
        Job::new(function, &[mode, 0])
    } else {
        Ok(Job::new(function, &[mode])?.expect_callback())
    }
}

fn check_node_id(node_id: u8) -> Result<()> {
    if node_id == 0 || node_id > MAX_NODE_ID {
        return Err(DriverError::InvalidNodeId(node_id));
    }
    Ok(())
}

fn check_group(group: u8) -> Result<()> {
    if group == 0 || group > ASSOCIATION_GROUPS {
        return Err(DriverError::InvalidGroup {
            group,
            max: ASSOCIATION_GROUPS,
        });
    }
    Ok(())
}

/// Handle for queueing work and inspecting the driver
///
/// Cheap to clone. Operations fail immediately only when their arguments
/// cannot be encoded, the target node is unknown, or the engine is gone;
/// everything else is reported through [`DriverStats`].
#[derive(Clone)]
pub struct DriverHandle {
    session: Arc<Mutex<Session>>,
    wake: Arc<Notify>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DriverHandle {
    pub(crate) fn new(
        session: Arc<Mutex<Session>>,
        wake: Arc<Notify>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            session,
            wake,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Run `f` under the session lock and wake the engine
    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
        if self.shutdown_tx.is_closed() {
            return Err(DriverError::EngineNotRunning);
        }
        let result = {
            let mut session = self.session.lock();
            f(&mut session)
        };
        if result.is_ok() {
            self.wake.notify_one();
        }
        result
    }

    /// Send a command class payload to a registered node
    fn send_command(&self, node_id: u8, command: Vec<u8>) -> Result<Delivery> {
        self.send_command_with(node_id, command, |_| Ok(()))
    }

    /// Send a command class payload, applying `update` to the registry
    /// under the same lock
    fn send_command_with(
        &self,
        node_id: u8,
        command: Vec<u8>,
        update: impl FnOnce(&mut NodeRegistry) -> Result<()>,
    ) -> Result<Delivery> {
        check_node_id(node_id)?;
        let job = Job::send_data(node_id, &command)?;
        self.with_session(|s| {
            s.registry.require(node_id)?;
            update(&mut s.registry)?;
            Ok(s.submit(job))
        })
    }

    /// Send a command class payload to one instance of a registered node
    fn send_instance_command(&self, node_id: u8, instance: u8, command: &[u8]) -> Result<Delivery> {
        self.send_command(node_id, command_class::multi_instance_encap(instance, command)?)
    }

    /// Submit a controller request that reports back through a callback
    fn controller_request(&self, function: FunctionId, args: &[u8]) -> Result<Delivery> {
        debug!(%function, args = ?args, "Controller request");
        self.submit(Job::new(function, args)?.expect_callback())
    }

    // ===== Raw jobs =====

    /// Submit a prepared job
    pub fn submit(&self, job: Job) -> Result<Delivery> {
        self.with_session(|s| Ok(s.submit(job)))
    }

    /// Send a request that completes on the controller's ACK
    pub fn send_request(&self, function: FunctionId, args: &[u8]) -> Result<Delivery> {
        self.submit(Job::new(function, args)?)
    }

    /// Send a command class payload; `0xFF` broadcasts to every node
    pub fn send_data(&self, node_id: u8, command: &[u8]) -> Result<Delivery> {
        if node_id == BROADCAST_NODE_ID {
            let job = Job::send_data(node_id, command)?;
            return self.submit(job);
        }
        self.send_command(node_id, command.to_vec())
    }

    // ===== Basic / switches / sensors =====

    /// Set the basic value of a node
    pub fn basic_set(&self, node_id: u8, value: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_set(class::BASIC, value))
    }

    /// Request the basic value of a node
    pub fn basic_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_get(class::BASIC))
    }

    /// Set a multilevel switch level (0-99, or 0xFF for last level)
    pub fn switch_multilevel_set(&self, node_id: u8, level: u8) -> Result<Delivery> {
        if level > 99 && level != 0xFF {
            return Err(DriverError::InvalidArgument(format!(
                "multilevel switch level {} out of range",
                level
            )));
        }
        self.send_command(
            node_id,
            command_class::value_set(class::SWITCH_MULTILEVEL, level),
        )
    }

    /// Request a multilevel sensor reading
    pub fn sensor_multilevel_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::sensor_multilevel_get())
    }

    /// Set the basic value of one instance of a multi-instance node
    pub fn basic_set_instance(&self, node_id: u8, instance: u8, value: u8) -> Result<Delivery> {
        self.send_instance_command(node_id, instance, &command_class::value_set(class::BASIC, value))
    }

    /// Request the basic value of one instance
    pub fn basic_get_instance(&self, node_id: u8, instance: u8) -> Result<Delivery> {
        self.send_instance_command(node_id, instance, &command_class::value_get(class::BASIC))
    }

    /// Request a multilevel sensor reading from one instance
    pub fn sensor_multilevel_get_instance(&self, node_id: u8, instance: u8) -> Result<Delivery> {
        self.send_instance_command(node_id, instance, &command_class::sensor_multilevel_get())
    }

    /// Request a binary sensor state
    pub fn sensor_binary_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_get(class::SENSOR_BINARY))
    }

    /// Request the battery level
    pub fn battery_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_get(class::BATTERY))
    }

    /// Request a meter reading
    pub fn meter_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::meter_get())
    }

    // ===== Thermostat =====

    /// Set a thermostat setpoint
    pub fn thermostat_setpoint_set(
        &self,
        node_id: u8,
        setpoint_type: u8,
        value: ScaledValue,
    ) -> Result<Delivery> {
        let command = command_class::thermostat_setpoint_set(setpoint_type, value)?;
        self.send_command(node_id, command)
    }

    /// Request a thermostat setpoint
    pub fn thermostat_setpoint_get(&self, node_id: u8, setpoint_type: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::thermostat_setpoint_get(setpoint_type))
    }

    /// Set the thermostat mode
    pub fn thermostat_mode_set(&self, node_id: u8, mode: u8) -> Result<Delivery> {
        self.send_command(
            node_id,
            command_class::value_set(class::THERMOSTAT_MODE, mode & 0x1F),
        )
    }

    /// Request the thermostat mode
    pub fn thermostat_mode_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_get(class::THERMOSTAT_MODE))
    }

    /// Set the thermostat fan mode
    pub fn thermostat_fan_mode_set(&self, node_id: u8, mode: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::thermostat_fan_mode_set(mode))
    }

    /// Request the thermostat fan mode
    pub fn thermostat_fan_mode_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::value_get(class::THERMOSTAT_FAN_MODE))
    }

    // ===== Configuration =====

    /// Set a configuration parameter as a signed 1, 2 or 4 byte value
    pub fn configuration_set(
        &self,
        node_id: u8,
        parameter: u8,
        value: i32,
        size: u8,
    ) -> Result<Delivery> {
        let command = command_class::configuration_set(parameter, value, size)?;
        self.send_command(node_id, command)
    }

    // ===== Associations =====

    /// Add members to an association group
    pub fn association_set(&self, node_id: u8, group: u8, members: &[u8]) -> Result<Delivery> {
        check_group(group)?;
        for &member in members {
            check_node_id(member)?;
        }
        self.send_command_with(
            node_id,
            command_class::association_change(association::SET, group, members),
            |registry| registry.add_association_members(node_id, group, members),
        )
    }

    /// Remove members from an association group (all members when empty)
    pub fn association_remove(&self, node_id: u8, group: u8, members: &[u8]) -> Result<Delivery> {
        check_group(group)?;
        self.send_command_with(
            node_id,
            command_class::association_change(association::REMOVE, group, members),
            |registry| registry.remove_association_members(node_id, group, members),
        )
    }

    /// Request the members of an association group
    pub fn association_get(&self, node_id: u8, group: u8) -> Result<Delivery> {
        check_group(group)?;
        self.send_command(node_id, command_class::association_get(group))
    }

    // ===== Wake-up / metadata =====

    /// Configure how often a sleeping node wakes up and whom it notifies
    pub fn wakeup_interval_set(&self, node_id: u8, seconds: u32, target: u8) -> Result<Delivery> {
        let command = command_class::wake_up_interval_set(seconds, target)?;
        self.send_command(node_id, command)
    }

    /// Request manufacturer and product identifiers
    pub fn manufacturer_specific_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::manufacturer_specific_get())
    }

    /// Request library and firmware versions
    pub fn version_get(&self, node_id: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::version_get())
    }

    /// Request the version of one command class
    pub fn command_class_version_get(&self, node_id: u8, cc: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::command_class_version_get(cc))
    }

    /// Request the instance count of one command class
    pub fn multi_instance_get(&self, node_id: u8, cc: u8) -> Result<Delivery> {
        self.send_command(node_id, command_class::multi_instance_get(cc))
    }

    // ===== Topology queries =====

    /// Ask a node to send its node information frame
    pub fn request_node_info(&self, node_id: u8) -> Result<Delivery> {
        self.query(IntentKind::NodeInfo, node_id)
    }

    /// Ask the controller for a node's listening flags and device classes
    pub fn request_protocol_info(&self, node_id: u8) -> Result<Delivery> {
        self.query(IntentKind::NodeProtocolInfo, node_id)
    }

    /// Ask the controller for a node's neighbours
    pub fn request_routing_info(&self, node_id: u8) -> Result<Delivery> {
        self.query(IntentKind::RoutingInfo, node_id)
    }

    fn query(&self, kind: IntentKind, node_id: u8) -> Result<Delivery> {
        check_node_id(node_id)?;
        self.with_session(|s| s.submit_query(kind, node_id))
    }

    // ===== Network maintenance =====

    /// Have a node rediscover its neighbours; routing info is requested
    /// again once it finishes
    pub fn request_node_neighbor_update(&self, node_id: u8) -> Result<Delivery> {
        check_node_id(node_id)?;
        self.controller_request(FunctionId::RequestNodeNeighborUpdate, &[node_id])
    }

    /// Remove a node that no longer answers from the controller's tables
    pub fn remove_failed_node(&self, node_id: u8) -> Result<Delivery> {
        check_node_id(node_id)?;
        self.controller_request(FunctionId::RemoveFailedNodeId, &[node_id])
    }

    /// Give a node a route to `destination`
    pub fn assign_return_route(&self, node_id: u8, destination: u8) -> Result<Delivery> {
        check_node_id(node_id)?;
        check_node_id(destination)?;
        self.controller_request(FunctionId::AssignReturnRoute, &[node_id, destination])
    }

    /// Give a node a route to the static update controller
    pub fn assign_suc_return_route(&self, node_id: u8) -> Result<Delivery> {
        check_node_id(node_id)?;
        self.controller_request(FunctionId::AssignSucReturnRoute, &[node_id])
    }

    // ===== Polling =====

    /// Start or stop polling every listening device with a basic get
    ///
    /// The first round runs one poll interval after polling is enabled.
    pub fn poll_devices(&self, enabled: bool) -> Result<()> {
        self.with_session(|s| {
            let interval = s.poll_interval;
            s.next_poll = enabled.then(|| Instant::now() + interval);
            info!(enabled, interval = ?interval, "Device polling");
            Ok(())
        })
    }

    /// Whether device polling is enabled
    pub fn is_polling(&self) -> bool {
        self.session.lock().next_poll.is_some()
    }

    // ===== Inclusion / exclusion =====

    /// Start accepting nodes into the network
    pub fn add_node_start(&self) -> Result<Delivery> {
        self.inclusion(FunctionId::AddNodeToNetwork, inclusion::MODE_ANY)
    }

    /// Stop accepting nodes
    pub fn add_node_stop(&self) -> Result<Delivery> {
        self.inclusion(FunctionId::AddNodeToNetwork, inclusion::MODE_STOP)
    }

    /// Start removing nodes from the network
    pub fn remove_node_start(&self) -> Result<Delivery> {
        self.inclusion(FunctionId::RemoveNodeFromNetwork, inclusion::MODE_ANY)
    }

    /// Stop removing nodes
    pub fn remove_node_stop(&self) -> Result<Delivery> {
        self.inclusion(FunctionId::RemoveNodeFromNetwork, inclusion::MODE_STOP)
    }

    fn inclusion(&self, function: FunctionId, mode: u8) -> Result<Delivery> {
        debug!(%function, mode, "Inclusion request");
        self.submit(inclusion_job(function, mode)?)
    }

    // ===== Controller memory =====

    /// Read a range of controller memory into the snapshot
    ///
    /// Returns the number of chunk requests queued.
    pub fn read_memory(&self, offset: usize, len: usize) -> Result<usize> {
        self.with_session(|s| {
            s.memory.check(offset, len)?;
            let jobs = memory::chunks(offset, len)?
                .map(|(start, size)| {
                    let args = memory::get_buffer_args(start, size)?;
                    Ok(Job::new(FunctionId::MemoryGetBuffer, &args)?.expect_response())
                })
                .collect::<Result<Vec<_>>>()?;

            let count = jobs.len();
            for job in jobs {
                s.queue.enqueue(job);
            }
            Ok(count)
        })
    }

    /// Write bytes to controller memory, keeping the snapshot in step
    ///
    /// Returns the number of chunk writes queued.
    pub fn write_memory(&self, offset: usize, data: &[u8]) -> Result<usize> {
        self.with_session(|s| {
            s.memory.check(offset, data.len())?;
            let jobs = data
                .chunks(MEMORY_CHUNK_SIZE)
                .enumerate()
                .map(|(i, chunk)| {
                    let args = memory::put_buffer_args(offset + i * MEMORY_CHUNK_SIZE, chunk)?;
                    Ok(Job::new(FunctionId::MemoryPutBuffer, &args)?.expect_callback())
                })
                .collect::<Result<Vec<_>>>()?;

            s.memory.write(offset, data)?;
            let count = jobs.len();
            for job in jobs {
                s.queue.enqueue(job);
            }
            Ok(count)
        })
    }

    /// Copy a range out of the memory snapshot
    pub fn memory(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let session = self.session.lock();
        Ok(session.memory.read(offset, len)?.to_vec())
    }

    // ===== Lifecycle / inspection =====

    /// Query version, home id and node list
    pub fn initialize(&self) -> Result<()> {
        self.with_session(Session::enqueue_discovery)
    }

    /// Restart the controller's serial API; the network is kept
    pub fn soft_reset(&self) -> Result<Delivery> {
        info!("Soft reset requested");
        self.submit(Job::new(FunctionId::SerialApiSoftReset, &[])?)
    }

    /// Reset the controller to factory defaults, erasing its network
    ///
    /// Once the controller confirms, the registry is cleared and discovery
    /// runs again.
    pub fn set_default(&self) -> Result<Delivery> {
        info!("Factory reset requested");
        self.controller_request(FunctionId::SetDefault, &[])
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        self.session.lock().state()
    }

    /// Whether the engine loop is running
    pub fn is_running(&self) -> bool {
        self.session.lock().running
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DriverStats {
        self.session.lock().stats_snapshot()
    }

    /// Controller identity learned during discovery
    pub fn controller(&self) -> ControllerInfo {
        self.session.lock().controller.clone()
    }

    /// Copy of one registry entry
    pub fn node(&self, node_id: u8) -> Option<Node> {
        self.session.lock().registry.get(node_id).cloned()
    }

    /// Registered node ids
    pub fn node_ids(&self) -> Vec<u8> {
        self.session.lock().registry.node_ids()
    }

    /// Snapshot of human-readable descriptors for every node
    pub fn list_device_descriptors(&self) -> DeviceDescriptors {
        self.session.lock().registry.list_device_descriptors()
    }

    /// Jobs not yet finished (pending + in flight)
    pub fn pending_jobs(&self) -> usize {
        self.session.lock().queue.len()
    }

    /// Jobs staged for a sleeping node
    pub fn staged_jobs(&self, node_id: u8) -> usize {
        self.session.lock().wakeup.pending_for(node_id)
    }

    /// Stop the engine loop
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(true)?;
        self.wake.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("state", &self.state())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfigBuilder;

    fn handle() -> (DriverHandle, watch::Receiver<bool>) {
        let config = DriverConfigBuilder::new().build();
        let session = Arc::new(Mutex::new(Session::new(&config)));
        let (tx, rx) = watch::channel(false);
        (DriverHandle::new(session, Arc::new(Notify::new()), tx), rx)
    }

    fn register(handle: &DriverHandle, node_id: u8, sleeping: bool) {
        let mut session = handle.session.lock();
        let info: &[u8] = if sleeping {
            &[0x04, 0x21, 0x01, 0x31, 0x84]
        } else {
            &[0x04, 0x10, 0x01, 0x25]
        };
        session.registry.apply_node_info(node_id, info).unwrap();
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let (handle, _rx) = handle();
        let err = handle.basic_set(9, 0xFF).unwrap_err();
        assert_eq!(err.error_code(), "REGISTRY_MISS");
        assert_eq!(handle.pending_jobs(), 0);
    }

    #[test]
    fn test_invalid_arguments_fail_immediately() {
        let (handle, _rx) = handle();
        register(&handle, 3, false);
        assert!(matches!(
            handle.basic_set(0, 1),
            Err(DriverError::InvalidNodeId(0))
        ));
        assert!(matches!(
            handle.association_set(3, 5, &[1]),
            Err(DriverError::InvalidGroup { group: 5, .. })
        ));
        assert!(handle.switch_multilevel_set(3, 150).is_err());
    }

    #[test]
    fn test_sleeping_target_is_staged() {
        let (handle, _rx) = handle();
        register(&handle, 4, false);
        register(&handle, 8, true);

        assert!(matches!(
            handle.basic_get(4).unwrap(),
            Delivery::Queued { callback_id: 1 }
        ));
        assert_eq!(handle.battery_get(8).unwrap(), Delivery::Staged);
        assert_eq!(handle.pending_jobs(), 1);
        assert_eq!(handle.staged_jobs(8), 1);
        assert_eq!(handle.stats().jobs_staged, 1);
    }

    #[test]
    fn test_broadcast_skips_registry() {
        let (handle, _rx) = handle();
        assert!(matches!(
            handle.send_data(BROADCAST_NODE_ID, &[0x20, 0x01, 0x00]),
            Ok(Delivery::Queued { .. })
        ));
    }

    #[test]
    fn test_queries_register_intents() {
        let (handle, _rx) = handle();
        handle.request_protocol_info(5).unwrap();
        handle.request_routing_info(6).unwrap();

        let session = handle.session.lock();
        assert_eq!(session.intents.pending(IntentKind::NodeProtocolInfo), 1);
        assert_eq!(session.intents.pending(IntentKind::RoutingInfo), 1);
        assert_eq!(session.queue.len(), 2);
    }

    #[test]
    fn test_memory_write_updates_snapshot_and_chunks() {
        let (handle, _rx) = handle();
        let data: Vec<u8> = (0..100).collect();
        assert_eq!(handle.write_memory(0x100, &data).unwrap(), 2);
        assert_eq!(handle.memory(0x100, 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(handle.read_memory(0, 130).unwrap(), 3);
        assert!(handle.read_memory(16 * 1024 - 1, 2).is_err());
    }

    #[test]
    fn test_memory_ranges_past_address_space_are_rejected() {
        let (handle, _rx) = handle();
        let err = handle.read_memory(usize::MAX, 2).unwrap_err();
        assert_eq!(err.error_code(), "MEMORY_OUT_OF_RANGE");

        let data = vec![0xAA; 200];
        let err = handle.write_memory(usize::MAX - 10, &data).unwrap_err();
        assert_eq!(err.error_code(), "MEMORY_OUT_OF_RANGE");
        assert!(handle.write_memory(16 * 1024 - 100, &data).is_err());
        assert_eq!(handle.pending_jobs(), 0);
    }

    #[test]
    fn test_association_changes_update_registry() {
        let (handle, _rx) = handle();
        register(&handle, 3, false);
        handle.association_set(3, 1, &[1, 7]).unwrap();
        handle.association_remove(3, 1, &[7]).unwrap();

        let node = handle.node(3).unwrap();
        let members: Vec<u8> = node.association_members(1).unwrap().iter().copied().collect();
        assert_eq!(members, vec![1]);
        assert_eq!(handle.pending_jobs(), 2);
    }

    #[test]
    fn test_instance_and_configuration_commands() {
        let (handle, _rx) = handle();
        register(&handle, 5, false);
        handle.basic_set_instance(5, 2, 0xFF).unwrap();
        handle.sensor_multilevel_get_instance(5, 3).unwrap();
        handle.configuration_set(5, 12, -200, 2).unwrap();
        handle.thermostat_fan_mode_set(5, 1).unwrap();
        assert!(handle.basic_get_instance(5, 0).is_err());
        assert!(handle.configuration_set(5, 12, 70_000, 2).is_err());

        let session = handle.session.lock();
        let commands: Vec<Vec<u8>> = session
            .queue
            .jobs()
            .map(|job| {
                let args = job.args();
                args[2..2 + usize::from(args[1])].to_vec()
            })
            .collect();
        assert_eq!(
            commands,
            vec![
                vec![0x60, 0x06, 2, 0x20, 0x01, 0xFF],
                vec![0x60, 0x06, 3, 0x31, 0x04],
                vec![0x70, 0x04, 12, 2, 0xFF, 0x38],
                vec![0x44, 0x01, 0x01],
            ]
        );
    }

    #[test]
    fn test_network_maintenance_requests() {
        let (handle, _rx) = handle();
        handle.request_node_neighbor_update(4).unwrap();
        handle.remove_failed_node(6).unwrap();
        handle.assign_return_route(4, 1).unwrap();
        handle.assign_suc_return_route(4).unwrap();
        handle.soft_reset().unwrap();
        assert!(handle.assign_return_route(4, 0).is_err());

        let session = handle.session.lock();
        let jobs: Vec<(u8, Vec<u8>, bool)> = session
            .queue
            .jobs()
            .map(|job| (job.function(), job.args().to_vec(), job.expects_callback()))
            .collect();
        let expected: Vec<(u8, Vec<u8>, bool)> = vec![
            (0x48, vec![4, 1], true),
            (0x61, vec![6, 2], true),
            (0x46, vec![4, 1, 3], true),
            (0x51, vec![4, 4], true),
            (0x08, Vec::new(), false),
        ];
        assert_eq!(jobs, expected);
    }

    #[test]
    fn test_query_subject() {
        let job = query_job(IntentKind::RoutingInfo, 9).unwrap();
        assert_eq!(query_subject(&job), Some((IntentKind::RoutingInfo, 9)));
        let job = query_job(IntentKind::NodeInfo, 4).unwrap();
        assert_eq!(query_subject(&job), Some((IntentKind::NodeInfo, 4)));
        let job = Job::send_data(4, &[0x20, 0x02]).unwrap();
        assert_eq!(query_subject(&job), None);
    }

    #[test]
    fn test_dropped_query_cancels_its_intent() {
        let config = DriverConfigBuilder::new()
            .retry_limit(1)
            .ack_timeout(Duration::from_millis(100))
            .build();
        let mut session = Session::new(&config);
        let now = Instant::now();
        session.submit_query(IntentKind::NodeProtocolInfo, 3).unwrap();
        session.submit_query(IntentKind::NodeProtocolInfo, 4).unwrap();

        assert!(session.advance(now).is_some());
        // Node 3's query is never ACKed; node 4's goes out in its place
        assert!(session.advance(now + Duration::from_millis(100)).is_some());
        assert_eq!(session.intents.len(), 1);
        assert_eq!(
            session.intents.resolve(IntentKind::NodeProtocolInfo).unwrap().node_id,
            4
        );
        assert_eq!(session.stats_snapshot().intents_cancelled, 1);
    }

    #[test]
    fn test_poll_round_skips_sleepers_and_controller() {
        let config = DriverConfigBuilder::new()
            .poll_interval(Duration::from_secs(30))
            .build();
        let mut session = Session::new(&config);
        session.controller.node_id = Some(1);
        session.registry.apply_node_info(1, &[0x02, 0x02, 0x07]).unwrap();
        session.registry.apply_node_info(2, &[0x02, 0x01, 0x01]).unwrap();
        session.registry.apply_node_info(4, &[0x04, 0x10, 0x01, 0x25]).unwrap();
        session.registry.apply_node_info(5, &[0x04, 0x11, 0x01, 0x26]).unwrap();
        session
            .registry
            .apply_node_info(8, &[0x04, 0x21, 0x01, 0x31, 0x84])
            .unwrap();

        let now = Instant::now();
        assert_eq!(session.poll(now), 0);
        session.next_poll = Some(now);
        assert_eq!(session.poll(now), 2);
        let polled: Vec<Option<u8>> = session.queue.jobs().map(Job::node_id).collect();
        assert_eq!(polled, vec![Some(4), Some(5)]);

        // Not due yet, and the next round skips nodes with work queued
        assert_eq!(session.poll(now + Duration::from_secs(10)), 0);
        assert_eq!(session.poll(now + Duration::from_secs(30)), 0);
        assert_eq!(session.stats.poll_rounds, 2);
        assert_eq!(session.stats.polls_queued, 2);
    }

    #[test]
    fn test_reset_network_forgets_nodes() {
        let (handle, _rx) = handle();
        register(&handle, 4, false);
        register(&handle, 8, true);
        handle.battery_get(8).unwrap();
        handle.request_routing_info(4).unwrap();

        let mut session = handle.session.lock();
        session.controller.home_id = Some(0xC0FFEE);
        session.reset_network().unwrap();
        assert!(session.registry.is_empty());
        assert!(session.wakeup.is_empty());
        assert!(session.intents.is_empty());
        assert_eq!(session.controller, ControllerInfo::default());
        // Routing query plus rediscovery
        assert_eq!(session.queue.len(), 4);
    }

    #[test]
    fn test_engine_gone_rejects_work() {
        let (handle, rx) = handle();
        drop(rx);
        assert!(matches!(
            handle.initialize(),
            Err(DriverError::EngineNotRunning)
        ));
        assert!(matches!(handle.shutdown(), Err(DriverError::ChannelClosed)));
    }

    #[test]
    fn test_initial_state() {
        let (handle, _rx) = handle();
        assert_eq!(handle.state(), EngineState::Idle);
        handle.initialize().unwrap();
        assert_eq!(handle.pending_jobs(), 3);
        assert_eq!(handle.stats().jobs_enqueued, 3);
    }
}
