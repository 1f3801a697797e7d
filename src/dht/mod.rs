mod commands;
mod engine;
mod handler;
mod kademlia;
mod memory;
mod network;
mod node;
mod protocol;
mod routing;
pub mod get;
pub mod put;

pub use commands::{Command, ErrorCode, GET, PUT};
pub use engine::{
    CommitRequest, EngineError, InboundRequest, IncomingRequest, QueryReply, QueryRequest, Reply,
    RoutingEngine,
};
pub use get::{GetAggregator, GetOptions, Offer, ResolvedRecord};
pub use handler::RecordHandler;
pub use kademlia::{KademliaConfig, KademliaError, KademliaNode, NodeId, NodeInfo};
pub use memory::{MemoryEngine, MemoryNetwork};
pub use node::{RecordError, RecordNode};
pub use put::{PutOptions, PutResult};

/*
 * Mutable records on a Kademlia DHT
 *
 * A record is a signed, versioned list of strings stored at the hash of its
 * owner's public key. This module layers two commands on a routing engine:
 *
 * 1. PUT (100) - store a signed record if it is newer than the local copy
 * 2. GET (101) - return the local copy if it is at least the requested seq
 *
 * Publishing scatters a GET toward the target to collect write tokens, then
 * commits the signed record to every responder. Resolving scatters a GET and
 * keeps the highest-seq record whose signature checks out.
 *
 * Two routing engines ship: an in-process swarm for tests and embedding, and
 * a UDP Kademlia node for real networks.
 */
