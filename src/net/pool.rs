//! The connection pool: accepts inbound TCP, dials outbound TCP,
//! assigns ConnIds, frames payloads and multiplexes many peers.
//!
//! One listener task feeds accepted sockets to the coordinator; each
//! adopted socket gets its own reader task; the coordinator task is the
//! only writer to the connection map and performs all payload sends.
use std::collections::HashMap;

use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};

use tealfs_util::data::*;

use crate::error::{Error, LogError};
use crate::payload::*;

/// Upper bound on a single frame; anything larger is a protocol violation
const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// Capacity of the pool's internal event channel
const EVENT_CHANNEL_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatusKind {
	Connected,
	NotConnected,
}

/// Status change of one connection, reported to the manager. For dial
/// attempts `peer_address` carries the dialed address, so failed dials
/// can be retried even before any handshake has recorded the peer.
#[derive(Clone, Debug)]
pub struct ConnectionStatus {
	pub kind: ConnectionStatusKind,
	pub msg: String,
	pub conn_id: ConnId,
	pub peer_address: Option<String>,
}

/// A decoded inbound frame, keyed by the connection it arrived on
#[derive(Clone, Debug)]
pub struct PayloadFromConn {
	pub conn_id: ConnId,
	pub payload: Payload,
}

/// Request to dial a peer, from the manager or the admin surface
#[derive(Clone, Debug)]
pub struct ConnectToReq {
	pub address: String,
}

/// Request to send one payload over one connection
#[derive(Clone, Debug)]
pub struct SendReq {
	pub conn_id: ConnId,
	pub payload: Payload,
}

enum ConnEvent {
	Dialed(ConnId, String, std::io::Result<TcpStream>),
	ReaderClosed(ConnId, String),
}

pub struct ConnectionPool {
	listener: TcpListener,
	next_id: u64,
	conns: HashMap<ConnId, OwnedWriteHalf>,

	out_statuses: mpsc::Sender<ConnectionStatus>,
	out_receives: mpsc::Sender<PayloadFromConn>,
	in_connect_to: mpsc::Receiver<ConnectToReq>,
	in_sends: mpsc::Receiver<SendReq>,
}

impl ConnectionPool {
	/// Bind the cluster listener. A port that is already bound is a
	/// startup failure and aborts the process at the caller.
	pub async fn bind(
		listen_addr: std::net::SocketAddr,
		out_statuses: mpsc::Sender<ConnectionStatus>,
		out_receives: mpsc::Sender<PayloadFromConn>,
		in_connect_to: mpsc::Receiver<ConnectToReq>,
		in_sends: mpsc::Receiver<SendReq>,
	) -> Result<Self, Error> {
		let listener = TcpListener::bind(listen_addr).await?;
		info!("Cluster listener bound on {}", listen_addr);
		Ok(Self {
			listener,
			next_id: 0,
			conns: HashMap::new(),
			out_statuses,
			out_receives,
			in_connect_to,
			in_sends,
		})
	}

	pub async fn run(mut self, mut must_exit: watch::Receiver<bool>) {
		let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

		while !*must_exit.borrow_and_update() {
			select! {
				_ = must_exit.changed() => continue,
				sockres = self.listener.accept() => match sockres {
					Ok((socket, peer_addr)) => {
						debug!("Incoming connection from {}", peer_addr);
						let id = self.adopt(socket, &event_tx, &must_exit);
						self.emit_status(ConnectionStatusKind::Connected, "Success", id, None)
							.await;
					}
					Err(e) => {
						warn!("Error in listener.accept: {}", e);
					}
				},
				ev = event_rx.recv() => match ev {
					Some(ev) => self.handle_event(ev, &event_tx, &must_exit).await,
					None => break,
				},
				req = self.in_connect_to.recv() => match req {
					Some(req) => self.handle_connect_to(req, &event_tx).await,
					None => break,
				},
				req = self.in_sends.recv() => match req {
					Some(req) => self.handle_send(req).await,
					None => break,
				},
			}
		}
		debug!("Connection pool exiting, dropping {} connections", self.conns.len());
	}

	async fn handle_event(
		&mut self,
		ev: ConnEvent,
		event_tx: &mpsc::Sender<ConnEvent>,
		must_exit: &watch::Receiver<bool>,
	) {
		match ev {
			ConnEvent::Dialed(id, address, Ok(socket)) => {
				info!("Connected to {} as {}", address, id);
				self.adopt_as(id, socket, event_tx, must_exit);
				self.emit_status(ConnectionStatusKind::Connected, "Success", id, Some(address))
					.await;
			}
			ConnEvent::Dialed(id, address, Err(e)) => {
				info!("Failed connecting to {}: {}", address, e);
				self.emit_status(
					ConnectionStatusKind::NotConnected,
					"Failure connecting",
					id,
					Some(address),
				)
				.await;
			}
			ConnEvent::ReaderClosed(id, msg) => {
				if self.conns.remove(&id).is_some() {
					self.emit_status(ConnectionStatusKind::NotConnected, &msg, id, None)
						.await;
				}
			}
		}
	}

	async fn handle_connect_to(&mut self, req: ConnectToReq, event_tx: &mpsc::Sender<ConnEvent>) {
		let id = self.alloc_id();
		let event_tx = event_tx.clone();
		tokio::spawn(async move {
			let res = TcpStream::connect(req.address.as_str()).await;
			event_tx
				.send(ConnEvent::Dialed(id, req.address, res))
				.await
				.log_err("Reporting dial result");
		});
	}

	async fn handle_send(&mut self, req: SendReq) {
		match self.conns.get_mut(&req.conn_id) {
			None => {
				self.degraded_path(req).await;
			}
			Some(write) => {
				let frame = frame(&req.payload);
				if let Err(e) = write.write_all(&frame[..]).await {
					warn!("Write failure on {}: {}", req.conn_id, e);
					self.conns.remove(&req.conn_id);
					self.emit_status(
						ConnectionStatusKind::NotConnected,
						"Connection closed",
						req.conn_id,
						None,
					)
					.await;
					self.degraded_path(req).await;
				}
			}
		}
	}

	/// Best-effort degraded path on send failure: a ReadRequest comes
	/// back as a not-Ok ReadResult with the head of its pointer list
	/// stripped, so the manager retries the next replica naturally; a
	/// WriteRequest comes back as a not-Ok WriteResult so the pending
	/// write is cancelled.
	async fn degraded_path(&mut self, req: SendReq) {
		let payload = match req.payload {
			Payload::ReadRequest(rr) => {
				let (ptrs, message) = if rr.ptrs.is_empty() {
					(vec![], "no pointers in read request")
				} else {
					(rr.ptrs[1..].to_vec(), "connection lost")
				};
				Payload::ReadResult(ReadResult::error(rr.caller, ptrs, rr.block_id, message))
			}
			Payload::WriteRequest(wr) => Payload::WriteResult(WriteResult {
				ok: false,
				message: "connection lost".into(),
				caller: wr.caller,
				ptr: wr.ptr,
			}),
			_ => return,
		};
		self.out_receives
			.send(PayloadFromConn {
				conn_id: req.conn_id,
				payload,
			})
			.await
			.log_err("Reporting degraded result");
	}

	fn alloc_id(&mut self) -> ConnId {
		let id = ConnId(self.next_id);
		self.next_id += 1;
		id
	}

	fn adopt(
		&mut self,
		socket: TcpStream,
		event_tx: &mpsc::Sender<ConnEvent>,
		must_exit: &watch::Receiver<bool>,
	) -> ConnId {
		let id = self.alloc_id();
		self.adopt_as(id, socket, event_tx, must_exit);
		id
	}

	fn adopt_as(
		&mut self,
		id: ConnId,
		socket: TcpStream,
		event_tx: &mpsc::Sender<ConnEvent>,
		must_exit: &watch::Receiver<bool>,
	) {
		let (read, write) = socket.into_split();
		self.conns.insert(id, write);
		tokio::spawn(read_loop(
			id,
			read,
			self.out_receives.clone(),
			event_tx.clone(),
			must_exit.clone(),
		));
	}

	async fn emit_status(
		&self,
		kind: ConnectionStatusKind,
		msg: &str,
		conn_id: ConnId,
		peer_address: Option<String>,
	) {
		self.out_statuses
			.send(ConnectionStatus {
				kind,
				msg: msg.to_string(),
				conn_id,
				peer_address,
			})
			.await
			.log_err("Reporting connection status");
	}
}

/// Per-connection reader: assembles full frames, decodes them and
/// forwards them upward. Any read or decode error is fatal to the
/// connection; the coordinator then reports NotConnected.
async fn read_loop(
	conn_id: ConnId,
	mut read: OwnedReadHalf,
	out_receives: mpsc::Sender<PayloadFromConn>,
	event_tx: mpsc::Sender<ConnEvent>,
	mut must_exit: watch::Receiver<bool>,
) {
	while !*must_exit.borrow_and_update() {
		select! {
			_ = must_exit.changed() => continue,
			frame = read_frame(&mut read) => match frame {
				Ok(payload) => {
					trace!("{}: received {}", conn_id, payload.kind());
					if out_receives
						.send(PayloadFromConn { conn_id, payload })
						.await
						.is_err()
					{
						return;
					}
				}
				Err(e) => {
					event_tx
						.send(ConnEvent::ReaderClosed(conn_id, format!("{}", e)))
						.await
						.log_err("Reporting closed connection");
					return;
				}
			},
		}
	}
}

async fn read_frame<R: AsyncReadExt + Unpin>(read: &mut R) -> Result<Payload, Error> {
	let mut header = [0u8; 4];
	match read.read_exact(&mut header[..]).await {
		Ok(_) => (),
		// EOF between frames is a clean close by the peer
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
			return Err(Error::ConnectionClosed)
		}
		Err(e) => return Err(e.into()),
	};
	let len = u32::from_be_bytes(header);
	if len == 0 || len > MAX_FRAME_LENGTH {
		return Err(Error::Framing);
	}
	let mut body = vec![0u8; len as usize];
	read.read_exact(&mut body[..]).await?;
	Payload::decode(&body[..])
}

fn frame(payload: &Payload) -> Vec<u8> {
	let body = payload.encode();
	let mut buf = Vec::with_capacity(4 + body.len());
	buf.put_u32(body.len() as u32);
	buf.put_slice(&body[..]);
	buf
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::*;

	struct TestPool {
		statuses: mpsc::Receiver<ConnectionStatus>,
		receives: mpsc::Receiver<PayloadFromConn>,
		connect_to: mpsc::Sender<ConnectToReq>,
		sends: mpsc::Sender<SendReq>,
	}

	async fn spawn_pool(port: u16, must_exit: watch::Receiver<bool>) -> TestPool {
		let (status_tx, status_rx) = mpsc::channel(16);
		let (recv_tx, recv_rx) = mpsc::channel(16);
		let (connect_tx, connect_rx) = mpsc::channel(16);
		let (send_tx, send_rx) = mpsc::channel(16);
		let pool = ConnectionPool::bind(
			format!("127.0.0.1:{}", port).parse().unwrap(),
			status_tx,
			recv_tx,
			connect_rx,
			send_rx,
		)
		.await
		.unwrap();
		tokio::spawn(pool.run(must_exit));
		TestPool {
			statuses: status_rx,
			receives: recv_rx,
			connect_to: connect_tx,
			sends: send_tx,
		}
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_dial_and_exchange() {
		select! {
			_ = run_dial_and_exchange(21910) => (),
			_ = tokio::time::sleep(Duration::from_secs(20)) => panic!("timeout"),
		}
	}

	async fn run_dial_and_exchange(port_base: u16) {
		let (stop_tx, stop_rx) = watch::channel(false);
		let mut a = spawn_pool(port_base, stop_rx.clone()).await;
		let mut b = spawn_pool(port_base + 1, stop_rx.clone()).await;

		a.connect_to
			.send(ConnectToReq {
				address: format!("127.0.0.1:{}", port_base + 1),
			})
			.await
			.unwrap();

		let st = a.statuses.recv().await.unwrap();
		assert_eq!(st.kind, ConnectionStatusKind::Connected);
		let st_b = b.statuses.recv().await.unwrap();
		assert_eq!(st_b.kind, ConnectionStatusKind::Connected);

		let iam = Payload::IAm(IAm {
			node_id: NodeId::new("node-a"),
			address: format!("127.0.0.1:{}", port_base),
			free_bytes: 99,
		});
		a.sends
			.send(SendReq {
				conn_id: st.conn_id,
				payload: iam.clone(),
			})
			.await
			.unwrap();

		let received = b.receives.recv().await.unwrap();
		assert_eq!(received.conn_id, st_b.conn_id);
		assert_eq!(received.payload, iam);

		stop_tx.send(true).unwrap();
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_failed_dial_reports_not_connected() {
		let (_stop_tx, stop_rx) = watch::channel(false);
		let mut a = spawn_pool(21920, stop_rx).await;

		// Nothing listens on this port
		a.connect_to
			.send(ConnectToReq {
				address: "127.0.0.1:21929".to_string(),
			})
			.await
			.unwrap();

		let st = a.statuses.recv().await.unwrap();
		assert_eq!(st.kind, ConnectionStatusKind::NotConnected);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_send_on_unknown_conn_degrades_read_request() {
		let (_stop_tx, stop_rx) = watch::channel(false);
		let mut a = spawn_pool(21930, stop_rx).await;

		let ptrs = vec![
			DiskPointer::new(NodeId::new("node-b"), "blk"),
			DiskPointer::new(NodeId::new("node-c"), "blk"),
		];
		a.sends
			.send(SendReq {
				conn_id: ConnId(77),
				payload: Payload::ReadRequest(ReadRequest {
					caller: NodeId::new("node-a"),
					ptrs: ptrs.clone(),
					block_id: BlockId::new("blk"),
				}),
			})
			.await
			.unwrap();

		let received = a.receives.recv().await.unwrap();
		assert_eq!(received.conn_id, ConnId(77));
		match received.payload {
			Payload::ReadResult(rr) => {
				assert!(!rr.ok);
				assert_eq!(rr.ptrs, ptrs[1..].to_vec());
			}
			other => panic!("expected ReadResult, got {}", other.kind()),
		}
	}
}
