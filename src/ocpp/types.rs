//! Identifiers and routing primitives shared by every envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token correlating one request with its response or error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Id used in CALLERROR frames answering a message whose id could not be read.
    pub const UNREADABLE: &'static str = "-1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn unreadable() -> Self {
        Self(Self::UNREADABLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a charging station, networking node or CSMS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkingNodeId(String);

impl NetworkingNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkingNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkingNodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ordered list of the nodes a message has traversed, origin first.
///
/// Paths are append-only: a hop is never removed or reordered, which is what
/// lets a reply retrace the request's route backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NetworkingNodeId>);

impl NetworkPath {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_source(source: NetworkingNodeId) -> Self {
        Self(vec![source])
    }

    pub fn from_hops(hops: Vec<NetworkingNodeId>) -> Self {
        Self(hops)
    }

    /// The originating node, if the path has any hop at all.
    pub fn source(&self) -> Option<&NetworkingNodeId> {
        self.0.first()
    }

    /// The node that handed the message to the current holder.
    pub fn last(&self) -> Option<&NetworkingNodeId> {
        self.0.last()
    }

    /// Path as seen after `node` has relayed the message.
    #[must_use]
    pub fn with_hop(&self, node: NetworkingNodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(node);
        Self(hops)
    }

    pub fn contains(&self, node: &NetworkingNodeId) -> bool {
        self.0.contains(node)
    }

    pub fn hops(&self) -> &[NetworkingNodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(NetworkingNodeId::as_str).collect();
        write!(f, "{}", hops.join(" -> "))
    }
}
