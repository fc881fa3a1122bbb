//! Serial API function identifiers
//!
//! Every data frame carries a function identifier right after the direction
//! byte. The identifier selects both the request the host is making and the
//! shape of the controller's response or callback.

/// Function identifiers understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionId {
    /// Node bitmask and controller capabilities
    GetInitData = 0x02,
    /// Inbound application command from a node
    ApplicationCommandHandler = 0x04,
    /// Restart the controller's serial API
    SerialApiSoftReset = 0x08,
    /// Transmit a command class payload to a node
    SendData = 0x13,
    /// Controller library version
    GetVersion = 0x15,
    /// Home id and controller node id
    MemoryGetId = 0x20,
    /// Read from controller memory
    MemoryGetBuffer = 0x23,
    /// Write to controller memory
    MemoryPutBuffer = 0x24,
    /// Listening flags and device classes for a node
    GetNodeProtocolInfo = 0x41,
    /// Reset the controller to factory defaults, leaving the network
    SetDefault = 0x42,
    /// Give a node a route to another node
    AssignReturnRoute = 0x46,
    /// Ask a node to rediscover its neighbours
    RequestNodeNeighborUpdate = 0x48,
    /// Unsolicited node information updates
    ApplicationUpdate = 0x49,
    /// Inclusion
    AddNodeToNetwork = 0x4A,
    /// Exclusion
    RemoveNodeFromNetwork = 0x4B,
    /// Give a node a route to the static update controller
    AssignSucReturnRoute = 0x51,
    /// Ask a node to broadcast its node information frame
    RequestNodeInfo = 0x60,
    /// Remove a node the controller has marked as failed
    RemoveFailedNodeId = 0x61,
    /// Neighbour bitmask for a node
    GetRoutingInfo = 0x80,
}

impl FunctionId {
    /// Look up a function identifier by its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x02 => FunctionId::GetInitData,
            0x04 => FunctionId::ApplicationCommandHandler,
            0x08 => FunctionId::SerialApiSoftReset,
            0x13 => FunctionId::SendData,
            0x15 => FunctionId::GetVersion,
            0x20 => FunctionId::MemoryGetId,
            0x23 => FunctionId::MemoryGetBuffer,
            0x24 => FunctionId::MemoryPutBuffer,
            0x41 => FunctionId::GetNodeProtocolInfo,
            0x42 => FunctionId::SetDefault,
            0x46 => FunctionId::AssignReturnRoute,
            0x48 => FunctionId::RequestNodeNeighborUpdate,
            0x49 => FunctionId::ApplicationUpdate,
            0x4A => FunctionId::AddNodeToNetwork,
            0x4B => FunctionId::RemoveNodeFromNetwork,
            0x51 => FunctionId::AssignSucReturnRoute,
            0x60 => FunctionId::RequestNodeInfo,
            0x61 => FunctionId::RemoveFailedNodeId,
            0x80 => FunctionId::GetRoutingInfo,
            _ => return None,
        })
    }

    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether callback request frames for this function lead with the
    /// callback identifier the host assigned
    pub fn carries_callback_id(self) -> bool {
        matches!(
            self,
            FunctionId::SendData
                | FunctionId::MemoryPutBuffer
                | FunctionId::AddNodeToNetwork
                | FunctionId::RemoveNodeFromNetwork
                | FunctionId::SetDefault
                | FunctionId::AssignReturnRoute
                | FunctionId::RequestNodeNeighborUpdate
                | FunctionId::AssignSucReturnRoute
                | FunctionId::RemoveFailedNodeId
        )
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FunctionId::GetInitData => "get-init-data",
            FunctionId::ApplicationCommandHandler => "application-command",
            FunctionId::SerialApiSoftReset => "soft-reset",
            FunctionId::SendData => "send-data",
            FunctionId::GetVersion => "get-version",
            FunctionId::MemoryGetId => "memory-get-id",
            FunctionId::MemoryGetBuffer => "memory-get-buffer",
            FunctionId::MemoryPutBuffer => "memory-put-buffer",
            FunctionId::GetNodeProtocolInfo => "get-node-protocol-info",
            FunctionId::SetDefault => "set-default",
            FunctionId::AssignReturnRoute => "assign-return-route",
            FunctionId::RequestNodeNeighborUpdate => "request-neighbor-update",
            FunctionId::ApplicationUpdate => "application-update",
            FunctionId::AddNodeToNetwork => "add-node",
            FunctionId::RemoveNodeFromNetwork => "remove-node",
            FunctionId::AssignSucReturnRoute => "assign-suc-return-route",
            FunctionId::RequestNodeInfo => "request-node-info",
            FunctionId::RemoveFailedNodeId => "remove-failed-node",
            FunctionId::GetRoutingInfo => "get-routing-info",
        };
        write!(f, "{}", name)
    }
}

/// Transmit option flags appended to send-data requests
pub mod tx_options {
    /// Request a routed acknowledgement from the destination
    pub const ACK: u8 = 0x01;
    /// Let the controller pick a route
    pub const AUTO_ROUTE: u8 = 0x04;
    /// Options used for every send-data job
    pub const DEFAULT: u8 = ACK | AUTO_ROUTE;
}

/// Status codes carried by application-update frames
pub mod update_status {
    /// Node information frame received
    pub const NODE_INFO_RECEIVED: u8 = 0x84;
    /// Node information request failed (no node id in the frame)
    pub const NODE_INFO_REQ_FAILED: u8 = 0x81;
    /// A node was added by another controller
    pub const NEW_ID_ASSIGNED: u8 = 0x40;
    /// A node was removed by another controller
    pub const DELETE_DONE: u8 = 0x20;
}

/// Add/remove node modes and callback statuses
pub mod inclusion {
    /// Include or exclude any node type
    pub const MODE_ANY: u8 = 0x01;
    /// Stop inclusion/exclusion
    pub const MODE_STOP: u8 = 0x05;
    /// Ready for a node to announce itself
    pub const STATUS_LEARN_READY: u8 = 0x01;
    /// A node was found
    pub const STATUS_NODE_FOUND: u8 = 0x02;
    /// Adding/removing a slave; node info follows
    pub const STATUS_SLAVE: u8 = 0x03;
    /// Adding/removing a controller; node info follows
    pub const STATUS_CONTROLLER: u8 = 0x04;
    /// Protocol part done, host must send stop
    pub const STATUS_PROTOCOL_DONE: u8 = 0x05;
    /// Finished
    pub const STATUS_DONE: u8 = 0x06;
    /// Failed
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Request-neighbour-update callback statuses
pub mod neighbor_update {
    /// The node started rediscovering its neighbours
    pub const STARTED: u8 = 0x21;
    /// Neighbours rediscovered; routing info is current
    pub const DONE: u8 = 0x22;
    /// Rediscovery failed
    pub const FAILED: u8 = 0x23;
}

/// Remove-failed-node response and callback statuses
pub mod failed_node {
    /// Response: the controller started checking the node
    pub const REMOVE_STARTED: u8 = 0x00;
    /// The node answered, so it is not failed and was kept
    pub const NODE_OK: u8 = 0x00;
    /// The node was removed from the controller's tables
    pub const REMOVED: u8 = 0x01;
    /// The node could not be removed
    pub const NOT_REMOVED: u8 = 0x02;
}

/// Transmit status carried by send-data and route-assignment callbacks
pub const TRANSMIT_COMPLETE_OK: u8 = 0x00;
