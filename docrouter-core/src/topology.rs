use crate::error::RouterError;
use crate::ids::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        };
        write!(f, "{}", s)
    }
}

/// One addressable replica inside a published topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub id: EndpointId,
    /// Base URL of the node, e.g. `http://10.0.0.4:8080`
    pub url: String,
    pub role: Role,
    /// Position within the topology, used for deterministic ordering
    pub position: usize,
}

impl Endpoint {
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.url, self.role)
    }
}

/// Wire form of one endpoint inside a topology fetch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: EndpointId,
    pub url: String,
    pub role: Role,
}

/// Wire form of a topology fetch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    /// Version/etag; only strictly greater versions replace a cached topology
    pub version: u64,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Immutable snapshot of the known replicas for one database.
///
/// A snapshot is never mutated after construction; the topology store swaps
/// whole snapshots, so a reader holding one always sees a consistent set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    version: u64,
    endpoints: Vec<Endpoint>,
}

impl Topology {
    /// Build a snapshot from a fetch response.
    ///
    /// Positions follow descriptor order. Duplicate ids and multiple primaries
    /// are rejected.
    pub fn from_descriptor(descriptor: TopologyDescriptor) -> Result<Self, RouterError> {
        let mut seen = HashSet::new();
        let mut primaries = 0;
        let mut endpoints = Vec::with_capacity(descriptor.endpoints.len());

        for (position, desc) in descriptor.endpoints.into_iter().enumerate() {
            if !seen.insert(desc.id.clone()) {
                return Err(RouterError::InvalidResponse(format!(
                    "duplicate endpoint id '{}' in topology version {}",
                    desc.id, descriptor.version
                )));
            }
            if desc.role == Role::Primary {
                primaries += 1;
            }
            endpoints.push(Endpoint {
                id: desc.id,
                url: desc.url,
                role: desc.role,
                position,
            });
        }

        if primaries > 1 {
            return Err(RouterError::InvalidResponse(format!(
                "topology version {} lists {} primaries",
                descriptor.version, primaries
            )));
        }

        Ok(Topology {
            version: descriptor.version,
            endpoints,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// All endpoints in topology order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn primary(&self) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.is_primary())
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|e| !e.is_primary())
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn to_descriptor(&self) -> TopologyDescriptor {
        TopologyDescriptor {
            version: self.version,
            endpoints: self
                .endpoints
                .iter()
                .map(|e| EndpointDescriptor {
                    id: e.id.clone(),
                    url: e.url.clone(),
                    role: e.role,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(version: u64, nodes: &[(&str, Role)]) -> TopologyDescriptor {
        TopologyDescriptor {
            version,
            endpoints: nodes
                .iter()
                .map(|(id, role)| EndpointDescriptor {
                    id: EndpointId::new(*id),
                    url: format!("http://{}:8080", id),
                    role: *role,
                })
                .collect(),
        }
    }

    #[test]
    fn test_positions_follow_descriptor_order() {
        let topology = Topology::from_descriptor(descriptor(
            3,
            &[("a", Role::Primary), ("b", Role::Secondary), ("c", Role::Secondary)],
        ))
        .unwrap();

        assert_eq!(topology.version(), 3);
        assert_eq!(topology.len(), 3);
        let positions: Vec<usize> = topology.endpoints().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(topology.primary().unwrap().id, EndpointId::new("a"));
        assert_eq!(topology.secondaries().count(), 2);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = Topology::from_descriptor(descriptor(
            1,
            &[("a", Role::Primary), ("a", Role::Secondary)],
        ));
        assert!(matches!(result, Err(RouterError::InvalidResponse(_))));
    }

    #[test]
    fn test_multiple_primaries_rejected() {
        let result = Topology::from_descriptor(descriptor(
            1,
            &[("a", Role::Primary), ("b", Role::Primary)],
        ));
        assert!(matches!(result, Err(RouterError::InvalidResponse(_))));
    }

    #[test]
    fn test_topology_without_primary_is_allowed() {
        let topology =
            Topology::from_descriptor(descriptor(1, &[("b", Role::Secondary)])).unwrap();
        assert!(topology.primary().is_none());
        assert_eq!(topology.get(&EndpointId::new("b")).unwrap().position, 0);
    }

    #[test]
    fn test_descriptor_json_shape() {
        let json = serde_json::json!({
            "version": 7,
            "endpoints": [
                {"id": "a", "url": "http://a:8080", "role": "primary"},
                {"id": "b", "url": "http://b:8080", "role": "secondary"}
            ]
        });
        let desc: TopologyDescriptor = serde_json::from_value(json).unwrap();
        let topology = Topology::from_descriptor(desc.clone()).unwrap();
        assert_eq!(topology.to_descriptor(), desc);
    }
}
