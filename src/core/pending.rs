//! Table of in-flight mirrored writes. A block's PUT is complete only
//! when every replica has acked; the first failure cancels the block
//! and later acks for it are dropped.
use std::collections::{HashMap, HashSet};

use tealfs_util::data::*;

#[derive(Debug, PartialEq, Eq)]
pub enum Ack {
	/// Replica acked, others still outstanding
	Pending,
	/// Last outstanding replica acked, the block is done
	Done,
	/// The block is unknown: already done or cancelled
	Unknown,
}

pub struct PendingWrites {
	blocks: HashMap<BlockId, HashSet<DiskPointer>>,
}

impl PendingWrites {
	pub fn new() -> Self {
		Self {
			blocks: HashMap::new(),
		}
	}

	pub fn start(&mut self, id: BlockId, ptrs: impl IntoIterator<Item = DiskPointer>) {
		self.blocks.insert(id, ptrs.into_iter().collect());
	}

	pub fn ack(&mut self, id: &BlockId, ptr: &DiskPointer) -> Ack {
		match self.blocks.get_mut(id) {
			None => Ack::Unknown,
			Some(outstanding) => {
				outstanding.remove(ptr);
				if outstanding.is_empty() {
					self.blocks.remove(id);
					Ack::Done
				} else {
					Ack::Pending
				}
			}
		}
	}

	/// Returns true if the block was still in flight; false means the
	/// failure has already been reported and should not be surfaced
	/// again.
	pub fn cancel(&mut self, id: &BlockId) -> bool {
		self.blocks.remove(id).is_some()
	}
}

impl Default for PendingWrites {
	fn default() -> Self {
		Self::new()
	}
}
