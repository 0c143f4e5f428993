//! The bridge between path-level HTTP handlers and the block-level
//! manager. It owns the two correlation tables (block id → reply
//! queue); concurrent requests for the same block id keep distinct
//! entries and are answered in FIFO order.
use std::collections::{HashMap, VecDeque};

use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};

use tealfs_net::error::LogError;
use tealfs_net::payload::{ReadResult, WriteResult};
use tealfs_util::data::*;

use crate::error::Error;

enum BridgeCmd {
	Get {
		block_id: BlockId,
		reply: oneshot::Sender<ReadResult>,
	},
	Put {
		block: Block,
		reply: oneshot::Sender<WriteResult>,
	},
}

/// Cheaply cloneable handle used by the HTTP handlers
#[derive(Clone)]
pub struct Bridge {
	cmd_tx: mpsc::Sender<BridgeCmd>,
}

impl Bridge {
	pub async fn get(&self, block_id: BlockId) -> Result<Block, Error> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(BridgeCmd::Get { block_id, reply })
			.await
			.map_err(|_| Error::InternalError("bridge is gone".into()))?;
		let res = rx
			.await
			.map_err(|_| Error::InternalError("bridge dropped the request".into()))?;
		if res.ok {
			Ok(Block::mirrored(res.block_id, res.data.data))
		} else if res.message == "not found" {
			Err(Error::NotFound)
		} else if res.message.starts_with("not connected") {
			Err(Error::NotConnected(res.message))
		} else {
			Err(Error::InternalError(res.message.into()))
		}
	}

	pub async fn put(&self, block: Block) -> Result<(), Error> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(BridgeCmd::Put { block, reply })
			.await
			.map_err(|_| Error::InternalError("bridge is gone".into()))?;
		let res = rx
			.await
			.map_err(|_| Error::InternalError("bridge dropped the request".into()))?;
		if res.ok {
			Ok(())
		} else if res.message.starts_with("not connected") {
			Err(Error::NotConnected(res.message))
		} else {
			Err(Error::InternalError(res.message.into()))
		}
	}
}

pub struct BridgeRunner {
	cmd_rx: mpsc::Receiver<BridgeCmd>,

	to_mgr_gets: mpsc::Sender<BlockId>,
	to_mgr_puts: mpsc::Sender<Block>,
	from_mgr_gets: mpsc::Receiver<ReadResult>,
	from_mgr_puts: mpsc::Receiver<WriteResult>,

	pending_reads: HashMap<BlockId, VecDeque<oneshot::Sender<ReadResult>>>,
	pending_puts: HashMap<BlockId, VecDeque<oneshot::Sender<WriteResult>>>,
}

pub fn bridge(
	channel_size: usize,
	to_mgr_gets: mpsc::Sender<BlockId>,
	to_mgr_puts: mpsc::Sender<Block>,
	from_mgr_gets: mpsc::Receiver<ReadResult>,
	from_mgr_puts: mpsc::Receiver<WriteResult>,
) -> (Bridge, BridgeRunner) {
	let (cmd_tx, cmd_rx) = mpsc::channel(channel_size);
	(
		Bridge { cmd_tx },
		BridgeRunner {
			cmd_rx,
			to_mgr_gets,
			to_mgr_puts,
			from_mgr_gets,
			from_mgr_puts,
			pending_reads: HashMap::new(),
			pending_puts: HashMap::new(),
		},
	)
}

impl BridgeRunner {
	pub async fn run(mut self, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow_and_update() {
			select! {
				_ = must_exit.changed() => continue,
				cmd = self.cmd_rx.recv() => match cmd {
					Some(cmd) => self.handle_cmd(cmd).await,
					None => break,
				},
				res = self.from_mgr_gets.recv() => match res {
					Some(res) => self.resolve_read(res),
					None => break,
				},
				res = self.from_mgr_puts.recv() => match res {
					Some(res) => self.resolve_put(res),
					None => break,
				},
			}
		}
		debug!("Bridge exiting");
	}

	async fn handle_cmd(&mut self, cmd: BridgeCmd) {
		match cmd {
			BridgeCmd::Get { block_id, reply } => {
				self.pending_reads
					.entry(block_id.clone())
					.or_default()
					.push_back(reply);
				self.to_mgr_gets
					.send(block_id)
					.await
					.log_err("Forwarding read to manager");
			}
			BridgeCmd::Put { block, reply } => {
				self.pending_puts
					.entry(block.id.clone())
					.or_default()
					.push_back(reply);
				self.to_mgr_puts
					.send(block)
					.await
					.log_err("Forwarding write to manager");
			}
		}
	}

	fn resolve_read(&mut self, res: ReadResult) {
		match self.pending_reads.get_mut(&res.block_id) {
			Some(queue) => {
				if let Some(reply) = queue.pop_front() {
					let _ = reply.send(res.clone());
				}
				if queue.is_empty() {
					self.pending_reads.remove(&res.block_id);
				}
			}
			None => debug!("Dropping read result for unknown block {}", res.block_id),
		}
	}

	fn resolve_put(&mut self, res: WriteResult) {
		let block_id = BlockId::new(res.ptr.file_name.clone());
		match self.pending_puts.get_mut(&block_id) {
			Some(queue) => {
				if let Some(reply) = queue.pop_front() {
					let _ = reply.send(res);
				}
				if queue.is_empty() {
					self.pending_puts.remove(&block_id);
				}
			}
			None => debug!("Dropping write result for unknown block {}", block_id),
		}
	}
}
