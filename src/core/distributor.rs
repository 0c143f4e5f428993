//! The distributor maps every block id to an ordered list of placement
//! pointers, from a table of 256 slots shared out among the nodes in
//! proportion to their weights. It is a pure value: recomputed whenever
//! a weight changes, never blocking.
use std::collections::HashMap;

use tealfs_util::data::*;
use tealfs_util::error::Error;

const TABLE_SIZE: usize = 256;

pub struct Distributor {
	weights: HashMap<NodeId, u64>,
	// All known nodes in lexicographic order, zero-weight ones included
	sorted: Vec<NodeId>,
	// 256 entries indexed by the first byte of the block id hash;
	// empty while no node has positive weight
	table: Vec<NodeId>,
}

impl Distributor {
	pub fn new() -> Self {
		Self {
			weights: HashMap::new(),
			sorted: vec![],
			table: vec![],
		}
	}

	pub fn set_weight(&mut self, id: NodeId, weight: u64) {
		self.weights.insert(id, weight);
		self.rebuild();
	}

	fn rebuild(&mut self) {
		self.sorted = self.weights.keys().cloned().collect::<Vec<_>>();
		self.sorted.sort();

		let positive = self
			.sorted
			.iter()
			.filter(|n| self.weights[*n] > 0)
			.cloned()
			.collect::<Vec<_>>();
		let total: u64 = positive.iter().map(|n| self.weights[n]).sum();
		if total == 0 {
			self.table = vec![];
			return;
		}

		// Each positive-weight node gets floor(256*w/total) slots; the
		// remainder goes to the last of them, so that a zero-weight
		// node never changes any placement.
		let mut table = Vec::with_capacity(TABLE_SIZE);
		for (i, node) in positive.iter().enumerate() {
			let slots = if i == positive.len() - 1 {
				TABLE_SIZE - table.len()
			} else {
				(TABLE_SIZE as u64 * self.weights[node] / total) as usize
			};
			for _ in 0..slots {
				table.push(node.clone());
			}
		}
		self.table = table;
	}

	/// Placement list for a Mirrored block: the primary given by the
	/// slot table, then the next distinct node in sorted order. Empty
	/// while no node has positive weight.
	pub fn placement(&self, block_id: &BlockId) -> Vec<DiskPointer> {
		if self.table.is_empty() {
			return vec![];
		}

		let byte = hash(block_id.as_str().as_bytes())[0] as usize;
		let primary = self.table[byte].clone();

		let mut ptrs = vec![DiskPointer::new(primary.clone(), block_id.as_str())];
		if let Some(mirror) = self.mirror_of(&primary) {
			ptrs.push(DiskPointer::new(mirror, block_id.as_str()));
		}
		ptrs
	}

	pub fn placement_for_type(
		&self,
		block_type: BlockType,
		block_id: &BlockId,
	) -> Result<Vec<DiskPointer>, Error> {
		match block_type {
			BlockType::Mirrored => Ok(self.placement(block_id)),
			BlockType::XORed => Err(Error::Message(
				"XORed block placement is not implemented".to_string(),
			)),
		}
	}

	// The next node after the primary in sorted order, preferring
	// positive-weight nodes so that a zero-weight newcomer does not
	// shift existing mirrors. Falls back to any distinct node; None on
	// a single-node cluster.
	fn mirror_of(&self, primary: &NodeId) -> Option<NodeId> {
		let start = self.sorted.iter().position(|n| n == primary)?;
		let candidates = (1..self.sorted.len()).map(|i| &self.sorted[(start + i) % self.sorted.len()]);

		let mut fallback = None;
		for node in candidates {
			if node == primary {
				continue;
			}
			if self.weights[node] > 0 {
				return Some(node.clone());
			}
			if fallback.is_none() {
				fallback = Some(node.clone());
			}
		}
		fallback
	}
}

impl Default for Distributor {
	fn default() -> Self {
		Self::new()
	}
}
