//! Intent tracking for identifier-less responses
//!
//! Some controller responses (node protocol info, routing info, node
//! information frames that fail) do not say which node they concern. Before
//! issuing such a query the driver registers an [`Intent`]; the response is
//! matched to the intent for the node whose query it completes, or failing
//! that to the oldest intent of the same kind.
//!
//! An intent's clock starts when its query is written to the link, not when
//! it is queued: a query stuck behind a long queue or staged for a sleeping
//! node cannot expire before the controller has seen it.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::error::DriverError;

/// Operation an intent stands in for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    /// Listening flags and device classes for a node
    NodeProtocolInfo,
    /// Neighbour bitmask for a node
    RoutingInfo,
    /// Node information frame requested from a node
    NodeInfo,
}

/// A pending query waiting for its identifier-less response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    /// Operation type
    pub kind: IntentKind,
    /// Node the query concerns
    pub node_id: u8,
    /// When the intent is abandoned; `None` until the query is transmitted
    pub deadline: Option<Instant>,
    /// Times the query has been reissued
    pub retries: u8,
}

/// Intent counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentStats {
    /// Intents registered
    pub registered: u64,
    /// Intents matched to a response
    pub resolved: u64,
    /// Intents abandoned after their deadline
    pub expired: u64,
    /// Queries reissued after expiry
    pub reissued: u64,
    /// Intents retired because their query was dropped
    pub cancelled: u64,
}

/// FIFO-per-kind correlation of queries to responses
#[derive(Debug)]
pub struct IntentTracker {
    intents: VecDeque<Intent>,
    timeout: Duration,
    max_retries: u8,
    stats: IntentStats,
}

impl IntentTracker {
    /// Create an empty tracker using the configured window and retry count
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            intents: VecDeque::new(),
            timeout: config.intent_timeout,
            max_retries: config.intent_retries,
            stats: IntentStats::default(),
        }
    }

    /// Append an intent for a query about to be queued
    ///
    /// The intent has no deadline until [`IntentTracker::arm`] is called for
    /// the transmission of its query.
    pub fn register(&mut self, kind: IntentKind, node_id: u8) {
        trace!(?kind, node = node_id, "Intent registered");
        self.intents.push_back(Intent {
            kind,
            node_id,
            deadline: None,
            retries: 0,
        });
        self.stats.registered += 1;
    }

    /// Start (or restart) the correlation window for a query just written
    ///
    /// Returns `false` when no intent is waiting for that query.
    pub fn arm(&mut self, kind: IntentKind, node_id: u8, now: Instant) -> bool {
        let timeout = self.timeout;
        match self
            .intents
            .iter_mut()
            .find(|i| i.kind == kind && i.node_id == node_id)
        {
            Some(intent) => {
                intent.deadline = Some(now + timeout);
                true
            }
            None => false,
        }
    }

    /// Remove and return the oldest intent of `kind`
    pub fn resolve(&mut self, kind: IntentKind) -> Option<Intent> {
        let index = self.intents.iter().position(|i| i.kind == kind)?;
        let intent = self.intents.remove(index)?;
        self.stats.resolved += 1;
        debug!(?kind, node = intent.node_id, "Intent resolved");
        Some(intent)
    }

    /// Remove the oldest intent of `kind` for a specific node
    ///
    /// Used when the response can be tied to a node (it names the node, or
    /// it completes that node's query) so the bookkeeping entry is retired.
    pub fn resolve_node(&mut self, kind: IntentKind, node_id: u8) -> Option<Intent> {
        let intent = self.take(kind, node_id)?;
        self.stats.resolved += 1;
        debug!(?kind, node = node_id, "Intent resolved");
        Some(intent)
    }

    /// Retire the intent of a query that will never be answered
    pub fn cancel(&mut self, kind: IntentKind, node_id: u8) -> Option<Intent> {
        let intent = self.take(kind, node_id)?;
        self.stats.cancelled += 1;
        debug!(?kind, node = node_id, "Intent cancelled, query dropped");
        Some(intent)
    }

    fn take(&mut self, kind: IntentKind, node_id: u8) -> Option<Intent> {
        let index = self
            .intents
            .iter()
            .position(|i| i.kind == kind && i.node_id == node_id)?;
        self.intents.remove(index)
    }

    /// Drop armed intents whose deadline has passed
    ///
    /// Returns intents that still have reissues left; the caller issues the
    /// query again and hands each back through [`IntentTracker::reissue`].
    /// Intents without reissues left are dropped without notification.
    pub fn expire(&mut self, now: Instant) -> Vec<Intent> {
        let mut retry = Vec::new();
        let max_retries = self.max_retries;
        let mut expired = 0u64;

        self.intents.retain(|intent| {
            match intent.deadline {
                Some(deadline) if deadline <= now => {}
                _ => return true,
            }
            if intent.retries < max_retries {
                retry.push(intent.clone());
            } else {
                let err = DriverError::IntentExpired {
                    node_id: intent.node_id,
                };
                debug!(kind = ?intent.kind, error = %err, "Intent abandoned");
                expired += 1;
            }
            false
        });

        self.stats.expired += expired;
        retry
    }

    /// Put an expired intent back, unarmed until its query goes out again
    pub fn reissue(&mut self, mut intent: Intent) {
        intent.retries = intent.retries.saturating_add(1);
        intent.deadline = None;
        self.stats.reissued += 1;
        self.intents.push_back(intent);
    }

    /// Cancel every waiting intent
    pub fn clear(&mut self) -> usize {
        let n = self.intents.len();
        self.intents.clear();
        self.stats.cancelled += n as u64;
        n
    }

    /// Intents of `kind` still waiting
    pub fn pending(&self, kind: IntentKind) -> usize {
        self.intents.iter().filter(|i| i.kind == kind).count()
    }

    /// All intents still waiting
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Counters
    pub fn stats(&self) -> &IntentStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfigBuilder;

    fn tracker(retries: u8) -> IntentTracker {
        let config = DriverConfigBuilder::new()
            .intent_timeout(Duration::from_secs(5))
            .intent_retries(retries)
            .build();
        IntentTracker::new(&config.protocol)
    }

    #[test]
    fn test_fifo_within_kind() {
        let mut tracker = tracker(0);
        tracker.register(IntentKind::RoutingInfo, 4);
        tracker.register(IntentKind::NodeProtocolInfo, 9);
        tracker.register(IntentKind::RoutingInfo, 7);

        assert_eq!(tracker.resolve(IntentKind::RoutingInfo).unwrap().node_id, 4);
        assert_eq!(tracker.resolve(IntentKind::RoutingInfo).unwrap().node_id, 7);
        assert!(tracker.resolve(IntentKind::RoutingInfo).is_none());
        assert_eq!(tracker.pending(IntentKind::NodeProtocolInfo), 1);
    }

    #[test]
    fn test_resolve_node_targets_specific_entry() {
        let mut tracker = tracker(0);
        tracker.register(IntentKind::NodeInfo, 3);
        tracker.register(IntentKind::NodeInfo, 8);

        assert_eq!(tracker.resolve_node(IntentKind::NodeInfo, 8).unwrap().node_id, 8);
        assert_eq!(tracker.resolve(IntentKind::NodeInfo).unwrap().node_id, 3);
    }

    #[test]
    fn test_unarmed_intent_never_expires() {
        let mut tracker = tracker(0);
        let now = Instant::now();
        tracker.register(IntentKind::NodeProtocolInfo, 2);

        assert!(tracker.expire(now + Duration::from_secs(60)).is_empty());
        assert_eq!(tracker.len(), 1);

        // Transmitted late; the window starts now
        let sent = now + Duration::from_secs(60);
        assert!(tracker.arm(IntentKind::NodeProtocolInfo, 2, sent));
        tracker.expire(sent + Duration::from_secs(4));
        assert_eq!(tracker.len(), 1);
        tracker.expire(sent + Duration::from_secs(5));
        assert!(tracker.is_empty());
        assert_eq!(tracker.stats().expired, 1);
    }

    #[test]
    fn test_silent_expiry() {
        let mut tracker = tracker(0);
        let now = Instant::now();
        tracker.register(IntentKind::NodeProtocolInfo, 2);
        tracker.register(IntentKind::NodeProtocolInfo, 3);
        tracker.arm(IntentKind::NodeProtocolInfo, 2, now);
        tracker.arm(IntentKind::NodeProtocolInfo, 3, now + Duration::from_secs(3));

        let retry = tracker.expire(now + Duration::from_secs(5));
        assert!(retry.is_empty());
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.stats().expired, 1);
        assert_eq!(tracker.resolve(IntentKind::NodeProtocolInfo).unwrap().node_id, 3);
    }

    #[test]
    fn test_cancel_retires_dropped_query() {
        let mut tracker = tracker(0);
        tracker.register(IntentKind::NodeProtocolInfo, 3);
        tracker.register(IntentKind::NodeProtocolInfo, 4);

        assert!(tracker.cancel(IntentKind::NodeProtocolInfo, 3).is_some());
        assert!(tracker.cancel(IntentKind::NodeProtocolInfo, 3).is_none());
        assert_eq!(tracker.resolve(IntentKind::NodeProtocolInfo).unwrap().node_id, 4);
        assert_eq!(tracker.stats().cancelled, 1);
        assert!(!tracker.arm(IntentKind::RoutingInfo, 4, Instant::now()));
    }

    #[test]
    fn test_expiry_with_reissue() {
        let mut tracker = tracker(1);
        let now = Instant::now();
        tracker.register(IntentKind::RoutingInfo, 6);
        tracker.arm(IntentKind::RoutingInfo, 6, now);

        let later = now + Duration::from_secs(6);
        let retry = tracker.expire(later);
        assert_eq!(retry.len(), 1);
        assert!(tracker.is_empty());

        tracker.reissue(retry[0].clone());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.expire(later + Duration::from_secs(30)).is_empty());
        assert_eq!(tracker.len(), 1);

        // Second expiry exhausts the single reissue
        tracker.arm(IntentKind::RoutingInfo, 6, later);
        let retry = tracker.expire(later + Duration::from_secs(5));
        assert!(retry.is_empty());
        assert_eq!(tracker.stats().reissued, 1);
        assert_eq!(tracker.stats().expired, 1);
    }
}
