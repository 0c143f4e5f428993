//! Module containing the manager: the single-writer event loop that
//! wires together the connection pool, the local disk store, the block
//! distributor and the HTTP bridge.
//!
//! The manager owns the cluster map, the node↔connection bimap, the
//! distributor and the pending-writes table. All interaction goes over
//! channels; at most one message is in flight inside the loop body and
//! every handler runs to completion without blocking on anything but
//! channel sends.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::select;
use tokio::sync::{mpsc, watch};

use tealfs_net::error::LogError;
use tealfs_net::payload::*;
use tealfs_net::pool::*;
use tealfs_util::bimap::Bimap;
use tealfs_util::data::*;
use tealfs_util::error::{Error, OkOrMessage};
use tealfs_util::persister::Persister;

use crate::distributor::Distributor;
use crate::pending::{Ack, PendingWrites};

const CLUSTER_FILE: &str = "cluster.json";
const NODE_ID_FILE: &str = "node_id";

// TODO: replace the fixed delay with exponential back-off once a
// connection has failed several times in a row
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Read this node's persisted identifier, generating and persisting a
/// fresh one on first start.
pub fn read_or_gen_node_id(storage_dir: &Path) -> Result<NodeId, Error> {
	let path = storage_dir.join(NODE_ID_FILE);
	if path.exists() {
		let data = std::fs::read(&path)?;
		let s = String::from_utf8(data).ok_or_message("Corrupt node_id file")?;
		let s = s.trim();
		if s.is_empty() {
			return Err(Error::Message("Corrupt node_id file".to_string()));
		}
		Ok(NodeId::new(s))
	} else {
		if !storage_dir.exists() {
			info!("Storage directory does not exist, creating it.");
			std::fs::create_dir_all(storage_dir)?;
		}
		let id = gen_node_id();
		info!("Generated new node id: {}", id.short());
		std::fs::write(&path, id.as_str().as_bytes())?;
		Ok(id)
	}
}

/// Connection state of one peer, as shown on the status surface
#[derive(Clone, Debug, Serialize)]
pub struct UiStatus {
	pub node_id: NodeId,
	pub address: String,
	pub connected: bool,
}

/// Sender halves of every channel the manager writes
pub struct ManagerTx {
	pub connect_tos: mpsc::Sender<ConnectToReq>,
	pub sends: mpsc::Sender<SendReq>,
	pub disk_writes: mpsc::Sender<WriteRequest>,
	pub disk_reads: mpsc::Sender<ReadRequest>,
	pub ui_statuses: mpsc::Sender<UiStatus>,
	pub webdav_gets: mpsc::Sender<ReadResult>,
	pub webdav_puts: mpsc::Sender<WriteResult>,
}

/// Receiver halves of every channel the manager reads
pub struct ManagerRx {
	pub ui_connect_tos: mpsc::Receiver<ConnectToReq>,
	pub conn_statuses: mpsc::Receiver<ConnectionStatus>,
	pub receives: mpsc::Receiver<PayloadFromConn>,
	pub disk_read_results: mpsc::Receiver<ReadResult>,
	pub disk_write_results: mpsc::Receiver<WriteResult>,
	pub webdav_gets: mpsc::Receiver<BlockId>,
	pub webdav_puts: mpsc::Receiver<Block>,
}

pub struct Manager {
	node_id: NodeId,
	node_address: String,
	free_bytes: u32,

	cluster: HashMap<NodeId, String>,
	conn_address: HashMap<ConnId, String>,
	node_conn: Bimap<NodeId, ConnId>,
	distributor: Distributor,
	pending: PendingWrites,
	persist_cluster: Persister<HashMap<NodeId, String>>,

	tx: ManagerTx,
}

impl Manager {
	/// Create the manager, loading the persisted cluster map if one
	/// exists. A cluster map that exists but cannot be parsed is a
	/// startup failure.
	pub fn new(
		node_id: NodeId,
		node_address: String,
		free_bytes: u32,
		storage_dir: &Path,
		tx: ManagerTx,
	) -> Result<Self, Error> {
		let persist_cluster = Persister::new(storage_dir, CLUSTER_FILE);
		let cluster = match persist_cluster.load() {
			Ok(map) => map,
			Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
			Err(e) => return Err(e),
		};

		let mut distributor = Distributor::new();
		distributor.set_weight(node_id.clone(), free_bytes as u64);

		Ok(Self {
			node_id,
			node_address,
			free_bytes,
			cluster,
			conn_address: HashMap::new(),
			node_conn: Bimap::new(),
			distributor,
			pending: PendingWrites::new(),
			persist_cluster,
			tx,
		})
	}

	pub async fn run(mut self, mut rx: ManagerRx, mut must_exit: watch::Receiver<bool>) {
		// Reconnect to every peer remembered from previous runs
		for (node, address) in self.cluster.clone() {
			info!(
				"{}: dialing known peer {} at {}",
				self.node_id.short(),
				node.short(),
				address
			);
			self.tx
				.connect_tos
				.send(ConnectToReq { address })
				.await
				.log_err("Dialing known peer");
		}

		while !*must_exit.borrow_and_update() {
			select! {
				_ = must_exit.changed() => continue,
				msg = rx.ui_connect_tos.recv() => match msg {
					Some(req) => self.handle_connect_to(req).await,
					None => break,
				},
				msg = rx.conn_statuses.recv() => match msg {
					Some(cs) => self.handle_conn_status(cs).await,
					None => break,
				},
				msg = rx.receives.recv() => match msg {
					Some(recv) => self.handle_receive(recv).await,
					None => break,
				},
				msg = rx.disk_read_results.recv() => match msg {
					Some(rres) => self.handle_read_result(rres).await,
					None => break,
				},
				msg = rx.disk_write_results.recv() => match msg {
					Some(wres) => self.handle_write_result(wres).await,
					None => break,
				},
				msg = rx.webdav_gets.recv() => match msg {
					Some(block_id) => self.handle_webdav_get(block_id).await,
					None => break,
				},
				msg = rx.webdav_puts.recv() => match msg {
					Some(block) => self.handle_webdav_put(block).await,
					None => break,
				},
			}
		}
		debug!("Manager {} exiting", self.node_id.short());
	}

	async fn handle_connect_to(&mut self, req: ConnectToReq) {
		debug!("{}: connect requested to {}", self.node_id.short(), req.address);
		self.tx
			.connect_tos
			.send(req)
			.await
			.log_err("Forwarding connect request to pool");
	}

	async fn handle_conn_status(&mut self, cs: ConnectionStatus) {
		match cs.kind {
			ConnectionStatusKind::Connected => {
				// Introduce ourselves; the peer does the same on its side
				let iam = Payload::IAm(IAm {
					node_id: self.node_id.clone(),
					address: self.node_address.clone(),
					free_bytes: self.free_bytes,
				});
				self.tx
					.sends
					.send(SendReq {
						conn_id: cs.conn_id,
						payload: iam,
					})
					.await
					.log_err("Sending IAm payload");
			}
			ConnectionStatusKind::NotConnected => {
				// Prefer the address learned in the handshake; fall back
				// to the dialed address so failed dials are retried too
				let address = self.conn_address.remove(&cs.conn_id).or(cs.peer_address);
				if let Some(node) = self.node_conn.remove_by_right(&cs.conn_id) {
					info!(
						"{}: lost connection to {} ({})",
						self.node_id.short(),
						node.short(),
						cs.msg
					);
					self.tx
						.ui_statuses
						.send(UiStatus {
							node_id: node,
							address: address.clone().unwrap_or_default(),
							connected: false,
						})
						.await
						.log_err("Sending UI status");
				}
				if let Some(address) = address {
					let connect_tos = self.tx.connect_tos.clone();
					tokio::spawn(async move {
						tokio::time::sleep(RECONNECT_DELAY).await;
						connect_tos
							.send(ConnectToReq { address })
							.await
							.log_err("Scheduling reconnect");
					});
				}
			}
		}
	}

	async fn handle_receive(&mut self, recv: PayloadFromConn) {
		trace!(
			"{}: received {} on {}",
			self.node_id.short(),
			recv.payload.kind(),
			recv.conn_id
		);
		match recv.payload {
			Payload::IAm(iam) => self.handle_iam(recv.conn_id, iam).await,
			Payload::SyncNodes(sn) => self.handle_sync_nodes(sn).await,
			// Forwarded requests go straight to the local disk: the
			// sender already consulted its own distributor
			Payload::WriteRequest(wr) => {
				self.tx
					.disk_writes
					.send(wr)
					.await
					.log_err("Forwarding write request to disk");
			}
			Payload::ReadRequest(rr) => {
				self.tx
					.disk_reads
					.send(rr)
					.await
					.log_err("Forwarding read request to disk");
			}
			Payload::ReadResult(rres) => self.handle_read_result(rres).await,
			Payload::WriteResult(wres) => self.handle_write_result(wres).await,
			Payload::NoOp => (),
		}
	}

	async fn handle_iam(&mut self, conn_id: ConnId, iam: IAm) {
		if iam.node_id == self.node_id {
			// Someone dialed our own address; we never peer with ourself
			debug!("{}: ignoring handshake from ourself", self.node_id.short());
			return;
		}
		info!(
			"{}: peer {} at {} is {}",
			self.node_id.short(),
			iam.node_id.short(),
			iam.address,
			conn_id
		);
		self.conn_address.insert(conn_id, iam.address.clone());
		self.tx
			.ui_statuses
			.send(UiStatus {
				node_id: iam.node_id.clone(),
				address: iam.address.clone(),
				connected: true,
			})
			.await
			.log_err("Sending UI status");

		self.cluster.insert(iam.node_id.clone(), iam.address.clone());
		if let Err(e) = self.persist_cluster.save(&self.cluster) {
			warn!("Could not persist cluster map: {}", e);
		}
		self.node_conn.insert(iam.node_id.clone(), conn_id);
		self.distributor
			.set_weight(iam.node_id, iam.free_bytes as u64);

		// Tell everyone who is connected about everyone else
		let sync = Payload::SyncNodes(self.sync_nodes_payload());
		for conn_id in self.connected_conn_ids() {
			self.tx
				.sends
				.send(SendReq {
					conn_id,
					payload: sync.clone(),
				})
				.await
				.log_err("Broadcasting SyncNodes");
		}
	}

	fn sync_nodes_payload(&self) -> SyncNodes {
		let mut nodes = vec![];
		for node in self.cluster.keys() {
			if let Some(conn_id) = self.node_conn.get_by_left(node) {
				if let Some(address) = self.conn_address.get(conn_id) {
					nodes.push((node.clone(), address.clone()));
				}
			}
		}
		SyncNodes { nodes }
	}

	fn connected_conn_ids(&self) -> Vec<ConnId> {
		self.cluster
			.keys()
			.filter_map(|node| self.node_conn.get_by_left(node).copied())
			.collect()
	}

	async fn handle_sync_nodes(&mut self, sn: SyncNodes) {
		for (node, address) in sn.nodes {
			if node != self.node_id && !self.cluster.contains_key(&node) {
				info!(
					"{}: learned of {} at {}, connecting",
					self.node_id.short(),
					node.short(),
					address
				);
				self.tx
					.connect_tos
					.send(ConnectToReq { address })
					.await
					.log_err("Dialing missing cluster member");
			}
		}
	}

	async fn handle_webdav_get(&mut self, block_id: BlockId) {
		let ptrs = self.distributor.placement(&block_id);
		if ptrs.is_empty() {
			self.tx
				.webdav_gets
				.send(ReadResult::error(
					self.node_id.clone(),
					vec![],
					block_id,
					"not found",
				))
				.await
				.log_err("Reporting read result");
		} else {
			self.issue_read(ptrs, block_id).await;
		}
	}

	/// Try the head of the placement list: local disk, or the peer's
	/// connection. The full remaining list rides along so failures can
	/// fall through to the next replica.
	async fn issue_read(&mut self, ptrs: Vec<DiskPointer>, block_id: BlockId) {
		let head = match ptrs.first() {
			Some(h) => h.clone(),
			None => {
				self.tx
					.webdav_gets
					.send(ReadResult::error(
						self.node_id.clone(),
						vec![],
						block_id,
						"read failed",
					))
					.await
					.log_err("Reporting read result");
				return;
			}
		};
		let request = ReadRequest {
			caller: self.node_id.clone(),
			ptrs,
			block_id,
		};
		if head.node_id == self.node_id {
			self.tx
				.disk_reads
				.send(request)
				.await
				.log_err("Sending read request to disk");
		} else if let Some(conn_id) = self.node_conn.get_by_left(&head.node_id).copied() {
			self.tx
				.sends
				.send(SendReq {
					conn_id,
					payload: Payload::ReadRequest(request),
				})
				.await
				.log_err("Sending read request to peer");
		} else {
			self.tx
				.webdav_gets
				.send(ReadResult::error(
					self.node_id.clone(),
					vec![],
					request.block_id,
					"not connected",
				))
				.await
				.log_err("Reporting read result");
		}
	}

	async fn handle_read_result(&mut self, rres: ReadResult) {
		if rres.caller == self.node_id {
			if rres.ok || rres.ptrs.is_empty() {
				self.tx
					.webdav_gets
					.send(rres)
					.await
					.log_err("Reporting read result");
			} else {
				// Fall through to the next replica
				let ReadResult { ptrs, block_id, .. } = rres;
				self.issue_read(ptrs, block_id).await;
			}
		} else if let Some(conn_id) = self.node_conn.get_by_left(&rres.caller).copied() {
			self.tx
				.sends
				.send(SendReq {
					conn_id,
					payload: Payload::ReadResult(rres),
				})
				.await
				.log_err("Routing read result to caller");
		} else {
			warn!(
				"{}: no connection to route read result for {} back to {}",
				self.node_id.short(),
				rres.block_id,
				rres.caller.short()
			);
		}
	}

	async fn handle_webdav_put(&mut self, block: Block) {
		let ptrs = match self
			.distributor
			.placement_for_type(block.block_type, &block.id)
		{
			Ok(ptrs) => ptrs,
			Err(e) => {
				self.reject_put(&block.id, format!("{}", e)).await;
				return;
			}
		};
		if ptrs.is_empty() {
			self.reject_put(&block.id, "no nodes available".to_string())
				.await;
			return;
		}

		self.pending.start(block.id.clone(), ptrs.iter().cloned());
		for ptr in ptrs {
			let request = WriteRequest {
				caller: self.node_id.clone(),
				ptr,
				data: block.data.clone(),
			};
			if request.ptr.node_id == self.node_id {
				self.tx
					.disk_writes
					.send(request)
					.await
					.log_err("Sending write request to disk");
			} else if let Some(conn_id) =
				self.node_conn.get_by_left(&request.ptr.node_id).copied()
			{
				self.tx
					.sends
					.send(SendReq {
						conn_id,
						payload: Payload::WriteRequest(request),
					})
					.await
					.log_err("Sending write request to peer");
			} else {
				// A required peer is unreachable: cancel the block and
				// report. Acks from replicas already issued are dropped.
				let peer = request.ptr.node_id.short().to_string();
				self.pending.cancel(&block.id);
				self.reject_put(&block.id, format!("not connected to {}", peer))
					.await;
				return;
			}
		}
	}

	async fn reject_put(&mut self, block_id: &BlockId, message: String) {
		self.tx
			.webdav_puts
			.send(WriteResult {
				ok: false,
				message,
				caller: self.node_id.clone(),
				ptr: DiskPointer::new(self.node_id.clone(), block_id.as_str()),
			})
			.await
			.log_err("Reporting write result");
	}

	async fn handle_write_result(&mut self, wres: WriteResult) {
		if wres.caller == self.node_id {
			let block_id = BlockId::new(wres.ptr.file_name.clone());
			if wres.ok {
				match self.pending.ack(&block_id, &wres.ptr) {
					Ack::Done => {
						self.tx
							.webdav_puts
							.send(wres)
							.await
							.log_err("Reporting write result");
					}
					Ack::Pending => (),
					Ack::Unknown => {
						debug!("Dropping write result for terminated block {}", block_id)
					}
				}
			} else if self.pending.cancel(&block_id) {
				self.tx
					.webdav_puts
					.send(wres)
					.await
					.log_err("Reporting write result");
			} else {
				debug!("Dropping write failure for terminated block {}", block_id);
			}
		} else if let Some(conn_id) = self.node_conn.get_by_left(&wres.caller).copied() {
			self.tx
				.sends
				.send(SendReq {
					conn_id,
					payload: Payload::WriteResult(wres),
				})
				.await
				.log_err("Routing write result to caller");
		} else {
			warn!(
				"{}: no connection to route write result for {} back to {}",
				self.node_id.short(),
				wres.ptr.file_name,
				wres.caller.short()
			);
		}
	}
}
