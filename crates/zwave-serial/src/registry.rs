//! Node registry
//!
//! Authoritative store of the nodes discovered on the network and the
//! capabilities they reported.
//!
//! # Discovery sources
//!
//! Entries are created on first sight of a node id, from any of:
//!
//! - the controller's init data (node bitmask)
//! - node protocol info and routing info responses
//! - node information frames (solicited or unsolicited)
//! - inclusion callbacks
//!
//! Rediscovery updates the entry in place. An entry leaves the registry only
//! when the node is removed from the network, and removal also scrubs it from
//! every other node's association groups.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::command_class::class;
use crate::config::ASSOCIATION_GROUPS;
use crate::error::{DriverError, Result};

// ============================================================================
// Device template
// ============================================================================

/// Coarse device kind derived from the generic/specific device classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceTemplate {
    /// Generic class not recognised
    #[default]
    Unknown,
    /// Portable controller
    Controller,
    /// Mains-powered controller
    StaticController,
    /// Thermostat
    Thermostat,
    /// On/off switch
    BinarySwitch,
    /// Dimmer
    MultilevelSwitch,
    /// Blinds, shutters and other motor drives
    MotorControl,
    /// Wall or handheld remote
    RemoteSwitch,
    /// On/off sensor
    BinarySensor,
    /// Scaled sensor
    MultilevelSensor,
    /// Meter
    Meter,
    /// Entry control
    DoorLock,
}

impl DeviceTemplate {
    /// Derive the template from generic and specific device class codes
    pub fn from_classes(generic: u8, specific: u8) -> Self {
        match generic {
            0x01 => DeviceTemplate::Controller,
            0x02 => DeviceTemplate::StaticController,
            0x08 => DeviceTemplate::Thermostat,
            0x10 => DeviceTemplate::BinarySwitch,
            0x11 if (0x05..=0x07).contains(&specific) => DeviceTemplate::MotorControl,
            0x11 => DeviceTemplate::MultilevelSwitch,
            0x12 => DeviceTemplate::RemoteSwitch,
            0x20 => DeviceTemplate::BinarySensor,
            0x21 => DeviceTemplate::MultilevelSensor,
            0x31 => DeviceTemplate::Meter,
            0x40 => DeviceTemplate::DoorLock,
            _ => DeviceTemplate::Unknown,
        }
    }

    /// Short human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            DeviceTemplate::Unknown => "unknown",
            DeviceTemplate::Controller => "controller",
            DeviceTemplate::StaticController => "static controller",
            DeviceTemplate::Thermostat => "thermostat",
            DeviceTemplate::BinarySwitch => "binary switch",
            DeviceTemplate::MultilevelSwitch => "multilevel switch",
            DeviceTemplate::MotorControl => "motor control",
            DeviceTemplate::RemoteSwitch => "remote switch",
            DeviceTemplate::BinarySensor => "binary sensor",
            DeviceTemplate::MultilevelSensor => "multilevel sensor",
            DeviceTemplate::Meter => "meter",
            DeviceTemplate::DoorLock => "door lock",
        }
    }
}

impl fmt::Display for DeviceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Node
// ============================================================================

/// Manufacturer/product identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManufacturerInfo {
    /// Assigned manufacturer id
    pub manufacturer_id: u16,
    /// Manufacturer's product line
    pub product_type: u16,
    /// Product within the line
    pub product_id: u16,
}

/// Library and firmware versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Z-Wave library type
    pub library_type: u8,
    /// Protocol version (major, minor)
    pub protocol: (u8, u8),
    /// Application firmware version (major, minor)
    pub application: (u8, u8),
}

/// A discovered endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node identifier
    pub id: u8,
    /// Basic device class
    pub basic: u8,
    /// Generic device class
    pub generic: u8,
    /// Specific device class
    pub specific: u8,
    /// Radio is off except during wake windows
    pub sleeping: bool,
    /// Supported command class -> addressable instances
    pub command_classes: BTreeMap<u8, u8>,
    /// Derived device kind
    pub template: DeviceTemplate,
    /// Last basic value reported
    pub basic_value: Option<u8>,
    /// Association group -> member node ids
    pub associations: BTreeMap<u8, BTreeSet<u8>>,
    /// Nodes in direct radio range
    pub neighbors: BTreeSet<u8>,
    /// Manufacturer-specific report
    pub manufacturer: Option<ManufacturerInfo>,
    /// Version report
    pub version: Option<VersionInfo>,
    /// Per-class versions
    pub command_class_versions: BTreeMap<u8, u8>,
    /// Configured wake-up interval in seconds
    pub wakeup_interval: Option<u32>,
    /// Last battery level reported
    pub battery_level: Option<u8>,
    /// Last time anything was heard from or about the node
    pub last_seen: DateTime<Utc>,
}

impl Node {
    fn new(id: u8) -> Self {
        Self {
            id,
            basic: 0,
            generic: 0,
            specific: 0,
            sleeping: false,
            command_classes: BTreeMap::new(),
            template: DeviceTemplate::Unknown,
            basic_value: None,
            associations: BTreeMap::new(),
            neighbors: BTreeSet::new(),
            manufacturer: None,
            version: None,
            command_class_versions: BTreeMap::new(),
            wakeup_interval: None,
            battery_level: None,
            last_seen: Utc::now(),
        }
    }

    /// Whether the node reported support for a command class
    pub fn supports(&self, class: u8) -> bool {
        self.command_classes.contains_key(&class)
    }

    /// Members of an association group
    pub fn association_members(&self, group: u8) -> Option<&BTreeSet<u8>> {
        self.associations.get(&group)
    }

    /// Whether any association group references `node_id`
    pub fn references(&self, node_id: u8) -> bool {
        self.associations.values().any(|m| m.contains(&node_id))
    }

    fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:3} {} (basic 0x{:02X}, generic 0x{:02X}, specific 0x{:02X})",
            self.id, self.template, self.basic, self.generic, self.specific
        )?;
        if self.sleeping {
            f.write_str(" sleeping")?;
        }
        if let Some(m) = &self.manufacturer {
            write!(
                f,
                " mfr {:04X}:{:04X}:{:04X}",
                m.manufacturer_id, m.product_type, m.product_id
            )?;
        }
        if !self.command_classes.is_empty() {
            f.write_str(" classes [")?;
            for (i, (class, instances)) in self.command_classes.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{:02X}", class)?;
                if *instances > 1 {
                    write!(f, "x{}", instances)?;
                }
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Map of node id to node record
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<u8, Node>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node, creating a default entry on first sight
    pub fn upsert(&mut self, node_id: u8) -> &mut Node {
        self.nodes.entry(node_id).or_insert_with(|| {
            debug!(node = node_id, "Node discovered");
            Node::new(node_id)
        })
    }

    /// Look up a node
    pub fn get(&self, node_id: u8) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Look up a node mutably
    pub fn get_mut(&mut self, node_id: u8) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Whether the node is registered
    pub fn contains(&self, node_id: u8) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Look up a node or fail with a registry miss
    pub fn require(&self, node_id: u8) -> Result<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or(DriverError::UnknownNode(node_id))
    }

    /// Whether the node is registered and flagged as sleeping
    pub fn is_sleeping(&self, node_id: u8) -> bool {
        self.nodes.get(&node_id).is_some_and(|n| n.sleeping)
    }

    /// Registered node ids in ascending order
    pub fn node_ids(&self) -> Vec<u8> {
        self.nodes.keys().copied().collect()
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply a node information frame: `[basic][generic][specific][classes...]`
    ///
    /// Classes after the support/control mark are controlled, not supported,
    /// and are not recorded. A node advertising the wake-up class is marked
    /// sleeping.
    pub fn apply_node_info(&mut self, node_id: u8, info: &[u8]) -> Result<()> {
        let [basic, generic, specific, classes @ ..] = info else {
            return Err(DriverError::InvalidArgument(format!(
                "node info for {} too short ({} bytes)",
                node_id,
                info.len()
            )));
        };

        let node = self.upsert(node_id);
        node.basic = *basic;
        node.generic = *generic;
        node.specific = *specific;
        node.template = DeviceTemplate::from_classes(*generic, *specific);

        for &cc in classes.iter().take_while(|&&cc| cc != class::MARK) {
            node.command_classes.entry(cc).or_insert(1);
        }
        if node.supports(class::WAKE_UP) {
            node.sleeping = true;
        }
        node.touch();

        trace!(
            node = node_id,
            template = %node.template,
            classes = node.command_classes.len(),
            sleeping = node.sleeping,
            "Node info applied"
        );
        Ok(())
    }

    /// Apply a node protocol info response:
    /// `[capability][security][reserved][basic][generic][specific]`
    ///
    /// A node that is neither always listening nor frequently listening is
    /// sleeping.
    pub fn apply_protocol_info(&mut self, node_id: u8, info: &[u8]) -> Result<()> {
        let [capability, security, _reserved, basic, generic, specific, ..] = info else {
            return Err(DriverError::InvalidArgument(format!(
                "protocol info for {} too short ({} bytes)",
                node_id,
                info.len()
            )));
        };

        let listening = capability & 0x80 != 0;
        let frequent_listening = security & 0x60 != 0;

        let node = self.upsert(node_id);
        node.basic = *basic;
        node.generic = *generic;
        node.specific = *specific;
        node.template = DeviceTemplate::from_classes(*generic, *specific);
        node.sleeping = !listening && !frequent_listening;
        node.touch();
        Ok(())
    }

    /// Record manufacturer/product identifiers
    pub fn apply_manufacturer_info(&mut self, node_id: u8, info: ManufacturerInfo) {
        let node = self.upsert(node_id);
        node.manufacturer = Some(info);
        node.touch();
    }

    /// Record library/firmware versions
    pub fn apply_version_info(&mut self, node_id: u8, info: VersionInfo) {
        let node = self.upsert(node_id);
        node.version = Some(info);
        node.touch();
    }

    /// Record the version of one command class
    pub fn apply_command_class_version(&mut self, node_id: u8, cc: u8, version: u8) {
        let node = self.upsert(node_id);
        node.command_class_versions.insert(cc, version);
        node.touch();
    }

    /// Record the instance count of one command class
    pub fn set_instances(&mut self, node_id: u8, cc: u8, instances: u8) {
        let node = self.upsert(node_id);
        node.command_classes.insert(cc, instances.max(1));
        node.touch();
    }

    /// Replace the members of one association group
    pub fn set_association_members(
        &mut self,
        node_id: u8,
        group: u8,
        members: impl IntoIterator<Item = u8>,
    ) -> Result<()> {
        check_group(group)?;
        let node = self.upsert(node_id);
        node.associations.insert(group, members.into_iter().collect());
        Ok(())
    }

    /// Add members to one association group
    pub fn add_association_members(&mut self, node_id: u8, group: u8, members: &[u8]) -> Result<()> {
        check_group(group)?;
        let node = self.upsert(node_id);
        node.associations
            .entry(group)
            .or_default()
            .extend(members.iter().copied());
        Ok(())
    }

    /// Remove members from one association group (all members when empty)
    pub fn remove_association_members(
        &mut self,
        node_id: u8,
        group: u8,
        members: &[u8],
    ) -> Result<()> {
        check_group(group)?;
        if let Some(set) = self
            .nodes
            .get_mut(&node_id)
            .and_then(|n| n.associations.get_mut(&group))
        {
            if members.is_empty() {
                set.clear();
            } else {
                for m in members {
                    set.remove(m);
                }
            }
        }
        Ok(())
    }

    /// Replace the neighbour set, registering each neighbour
    pub fn set_neighbors(&mut self, node_id: u8, neighbors: impl IntoIterator<Item = u8>) {
        let neighbors: BTreeSet<u8> = neighbors.into_iter().filter(|&n| n != node_id).collect();
        for &n in &neighbors {
            self.upsert(n);
        }
        let node = self.upsert(node_id);
        node.neighbors = neighbors;
        node.touch();
    }

    /// Note traffic from a node, registering it on first sight
    pub fn mark_seen(&mut self, node_id: u8) {
        self.upsert(node_id).touch();
    }

    /// Record a basic value report
    pub fn set_basic_value(&mut self, node_id: u8, value: u8) {
        let node = self.upsert(node_id);
        node.basic_value = Some(value);
        node.touch();
    }

    /// Record a battery level report
    pub fn set_battery_level(&mut self, node_id: u8, level: u8) {
        let node = self.upsert(node_id);
        node.battery_level = Some(level);
        node.touch();
    }

    /// Record the configured wake-up interval
    pub fn set_wakeup_interval(&mut self, node_id: u8, seconds: u32) {
        let node = self.upsert(node_id);
        node.wakeup_interval = Some(seconds);
        node.sleeping = true;
        node.touch();
    }

    /// Remove a node and scrub it from every association group
    pub fn remove(&mut self, node_id: u8) -> Option<Node> {
        let removed = self.nodes.remove(&node_id)?;
        for node in self.nodes.values_mut() {
            for members in node.associations.values_mut() {
                members.remove(&node_id);
            }
            node.neighbors.remove(&node_id);
        }
        debug!(node = node_id, "Node removed");
        Some(removed)
    }

    /// Forget every node, as after the controller is reset to defaults
    pub fn clear(&mut self) {
        debug!(nodes = self.nodes.len(), "Registry cleared");
        self.nodes.clear();
    }

    /// Snapshot of every node for the reporting collaborator
    pub fn list_device_descriptors(&self) -> DeviceDescriptors {
        DeviceDescriptors {
            nodes: self.nodes.values().cloned().collect(),
        }
    }
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

/// Point-in-time snapshot of the registry
///
/// Descriptor strings are formatted lazily as the sequence is walked, and
/// [`DeviceDescriptors::iter`] can be called again to restart from the first
/// node. Cloning shares the snapshot.
#[derive(Debug, Clone)]
pub struct DeviceDescriptors {
    nodes: Arc<[Node]>,
}

impl DeviceDescriptors {
    /// Walk the snapshot from the first node
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        self.nodes.iter().map(|node| node.to_string())
    }

    /// Nodes in the snapshot
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
