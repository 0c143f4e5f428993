//! Core identifier and block types shared by every TealFS component
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A sha-256 digest
pub type Hash = [u8; 32];

pub fn hash(data: &[u8]) -> Hash {
	let mut hasher = Sha256::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	hash
}

/// The globally unique identifier of a node, generated once at first
/// start and persisted in the `node_id` file of the storage directory
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
	pub fn new<S: Into<String>>(s: S) -> Self {
		Self(s.into())
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	/// Short prefix for log lines
	pub fn short(&self) -> &str {
		&self.0[..self.0.len().min(8)]
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

pub fn gen_node_id() -> NodeId {
	NodeId(hex::encode(rand::thread_rng().gen::<[u8; 32]>()))
}

/// Process-local identifier of one adopted socket; never reused
/// within a process lifetime
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "conn#{}", self.0)
	}
}

/// Opaque identifier of a stored block, usable as a local file name
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
	pub fn new<S: Into<String>>(s: S) -> Self {
		Self(s.into())
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// The physical location of one replica of a block
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DiskPointer {
	pub node_id: NodeId,
	pub file_name: String,
}

impl DiskPointer {
	pub fn new(node_id: NodeId, file_name: impl Into<String>) -> Self {
		Self {
			node_id,
			file_name: file_name.into(),
		}
	}
}

/// Replication scheme of a block. XORed is reserved and not
/// implemented by the distributor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
	Mirrored,
	XORed,
}

/// A variable-length opaque byte sequence, the unit of storage
/// and replication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
	pub id: BlockId,
	pub block_type: BlockType,
	pub data: Vec<u8>,
}

impl Block {
	pub fn mirrored(id: BlockId, data: Vec<u8>) -> Self {
		Self {
			id,
			block_type: BlockType::Mirrored,
			data,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_hash_is_stable() {
		assert_eq!(hash(b"hello"), hash(b"hello"));
		assert_ne!(hash(b"hello"), hash(b"world"));
	}

	#[test]
	fn test_gen_node_id_unique() {
		let a = gen_node_id();
		let b = gen_node_id();
		assert_ne!(a, b);
		assert_eq!(a.as_str().len(), 64);
	}
}
