//! Server endpoints and the routable topology
//!
//! Endpoints live in an arena indexed by `ServerId`: configured servers first,
//! fail-over servers after them. Ids never change, so pools and health state
//! can be indexed by them for the life of the client. Which servers are on the
//! ring is tracked separately and every change produces a fresh `HashRing`
//! snapshot that replaces the old one in a single pointer swap.

use crate::hashring::{HashAlgorithm, HashRing, RingNode};
use crate::{MemringError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Stable index of a server in the endpoint arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub usize);

/// A memcached server address with its ring weight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// `host:port` as configured
    pub address: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    /// True for servers that only join the ring as substitutes
    pub failover: bool,
}

impl ServerEndpoint {
    /// Parse a `host:port` address
    pub fn parse(address: &str, weight: u32) -> Result<Self> {
        let address = address.trim();
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            MemringError::Config(format!("server address must be host:port: {address}"))
        })?;
        if host.is_empty() {
            return Err(MemringError::Config(format!(
                "server address has no host: {address}"
            )));
        }
        let port = port
            .parse()
            .map_err(|_| MemringError::Config(format!("invalid port in address: {address}")))?;

        Ok(Self {
            address: address.to_string(),
            host: host.to_string(),
            port,
            weight: weight.max(1),
            failover: false,
        })
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Default)]
struct TopologyState {
    /// Configured servers currently out of the ring
    excluded: BTreeSet<ServerId>,
    /// Excluded server -> fail-over server holding its ring position
    substitutes: BTreeMap<ServerId, ServerId>,
    /// Fail-over servers that are themselves unusable
    unavailable: BTreeSet<ServerId>,
}

/// Endpoint arena plus the current ring snapshot
pub struct Topology {
    endpoints: Vec<ServerEndpoint>,
    primaries: usize,
    algorithm: HashAlgorithm,
    state: Mutex<TopologyState>,
    ring: RwLock<Arc<HashRing>>,
}

impl Topology {
    /// Register servers and fail-over servers and build the initial ring
    pub fn new(
        servers: &[(String, u32)],
        failovers: &[String],
        algorithm: HashAlgorithm,
    ) -> Result<Self> {
        if servers.is_empty() {
            return Err(MemringError::Config("no servers configured".to_string()));
        }

        let mut endpoints = Vec::with_capacity(servers.len() + failovers.len());
        for (address, weight) in servers {
            endpoints.push(ServerEndpoint::parse(address, *weight)?);
        }
        for address in failovers {
            let mut endpoint = ServerEndpoint::parse(address, 1)?;
            endpoint.failover = true;
            endpoints.push(endpoint);
        }

        let mut seen = BTreeSet::new();
        for endpoint in &endpoints {
            if !seen.insert(endpoint.address.as_str()) {
                return Err(MemringError::Config(format!(
                    "server listed twice: {}",
                    endpoint.address
                )));
            }
        }

        let topology = Self {
            primaries: servers.len(),
            endpoints,
            algorithm,
            state: Mutex::new(TopologyState::default()),
            ring: RwLock::new(Arc::new(HashRing::default())),
        };
        topology.rebuild(&topology.state.lock());
        Ok(topology)
    }

    pub fn endpoint(&self, id: ServerId) -> &ServerEndpoint {
        &self.endpoints[id.0]
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }

    /// Look a server up by its configured address
    pub fn find(&self, address: &str) -> Option<ServerId> {
        self.endpoints
            .iter()
            .position(|e| e.address == address)
            .map(ServerId)
    }

    /// Current ring snapshot; stays valid even if the ring is rebuilt meanwhile
    pub fn snapshot(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read())
    }

    pub fn resolve(&self, key: &str) -> Option<ServerId> {
        self.snapshot().resolve(key)
    }

    /// Servers currently holding ring points
    pub fn routable(&self) -> Vec<ServerId> {
        self.snapshot().servers()
    }

    /// Fail-over server currently standing in for `id`
    pub fn substitute_for(&self, id: ServerId) -> Option<ServerId> {
        self.state.lock().substitutes.get(&id).copied()
    }

    /// Take a server out of the ring. Returns the fail-over server that took
    /// its position, if one was free.
    pub fn exclude(&self, id: ServerId) -> Option<ServerId> {
        let mut state = self.state.lock();

        let slot = if self.is_failover(id) {
            state.unavailable.insert(id);
            // A dead substitute frees the slot it was holding
            let slot = state
                .substitutes
                .iter()
                .find(|(_, sub)| **sub == id)
                .map(|(slot, _)| *slot);
            if let Some(slot) = slot {
                state.substitutes.remove(&slot);
            }
            slot
        } else {
            state.excluded.insert(id);
            Some(id)
        };

        let substitute = slot.and_then(|slot| self.assign_free(&mut state, slot));
        if let (Some(slot), Some(sub)) = (slot, substitute) {
            info!(
                server = %self.endpoint(slot),
                failover = %self.endpoint(sub),
                "Fail-over server substituted"
            );
        }

        self.rebuild(&state);
        substitute
    }

    /// Put a server back into the ring, releasing any substitute it had
    pub fn include(&self, id: ServerId) {
        let mut state = self.state.lock();

        if self.is_failover(id) {
            state.unavailable.remove(&id);
        } else {
            state.excluded.remove(&id);
            state.substitutes.remove(&id);
        }

        // Freed fail-overs can cover slots that are still uncovered
        let uncovered: Vec<ServerId> = state
            .excluded
            .iter()
            .filter(|slot| !state.substitutes.contains_key(slot))
            .copied()
            .collect();
        for slot in uncovered {
            self.assign_free(&mut state, slot);
        }

        self.rebuild(&state);
    }

    fn is_failover(&self, id: ServerId) -> bool {
        id.0 >= self.primaries
    }

    fn assign_free(&self, state: &mut TopologyState, slot: ServerId) -> Option<ServerId> {
        let free = (self.primaries..self.endpoints.len())
            .map(ServerId)
            .find(|f| !state.unavailable.contains(f) && !state.substitutes.values().any(|s| s == f))?;
        state.substitutes.insert(slot, free);
        Some(free)
    }

    /// Swap in a ring built from the given state. Called with the state lock
    /// held, so rebuilds are serialized.
    fn rebuild(&self, state: &TopologyState) {
        let nodes = self.endpoints[..self.primaries]
            .iter()
            .enumerate()
            .filter_map(|(i, endpoint)| {
                let id = ServerId(i);
                let server = if state.excluded.contains(&id) {
                    *state.substitutes.get(&id)?
                } else {
                    id
                };
                Some(RingNode {
                    label: &endpoint.address,
                    weight: endpoint.weight,
                    server,
                })
            });

        let ring = HashRing::build(self.algorithm, nodes);
        *self.ring.write() = Arc::new(ring);
    }
}
