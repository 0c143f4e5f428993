//! The block-oriented wire protocol.
//!
//! Every payload travels as a 4-byte big-endian length L, a 1-byte type
//! tag, then L-1 bytes of body. An lp-string is a 4-byte BE length
//! followed by UTF-8 bytes. Unknown tags are fatal to the connection.
use bytes::{Buf, BufMut};

use tealfs_util::data::*;

use crate::error::Error;

pub const NOOP_TYPE: u8 = 0;
pub const IAM_TYPE: u8 = 1;
pub const SYNC_NODES_TYPE: u8 = 2;
pub const WRITE_REQUEST_TYPE: u8 = 3;
pub const READ_REQUEST_TYPE: u8 = 4;
pub const READ_RESULT_TYPE: u8 = 5;
pub const WRITE_RESULT_TYPE: u8 = 6;

/// Identity handshake, sent by both sides as soon as a connection is up
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IAm {
	pub node_id: NodeId,
	pub address: String,
	pub free_bytes: u32,
}

/// Gossip broadcast of all currently connected cluster members
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncNodes {
	pub nodes: Vec<(NodeId, String)>,
}

impl SyncNodes {
	pub fn address_for(&self, node: &NodeId) -> Option<&str> {
		self.nodes
			.iter()
			.find(|(n, _)| n == node)
			.map(|(_, a)| a.as_str())
	}
}

/// Ask a node to store one replica of a block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
	pub caller: NodeId,
	pub ptr: DiskPointer,
	pub data: Vec<u8>,
}

/// Ask a node for a block. `ptrs` is the placement list still to be
/// tried, head first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
	pub caller: NodeId,
	pub ptrs: Vec<DiskPointer>,
	pub block_id: BlockId,
}

/// One replica's worth of block bytes together with where it was read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawData {
	pub ptr: DiskPointer,
	pub data: Vec<u8>,
}

impl RawData {
	pub fn empty(block_id: &BlockId) -> Self {
		Self {
			ptr: DiskPointer::new(NodeId::new(""), block_id.as_str()),
			data: vec![],
		}
	}
}

/// Outcome of a read attempt. On failure `ptrs` holds the remaining
/// tail of the placement list, so the receiver retries naturally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResult {
	pub ok: bool,
	pub message: String,
	pub caller: NodeId,
	pub ptrs: Vec<DiskPointer>,
	pub data: RawData,
	pub block_id: BlockId,
}

impl ReadResult {
	pub fn error(
		caller: NodeId,
		ptrs: Vec<DiskPointer>,
		block_id: BlockId,
		message: impl Into<String>,
	) -> Self {
		Self {
			ok: false,
			message: message.into(),
			caller,
			ptrs,
			data: RawData::empty(&block_id),
			block_id,
		}
	}
}

/// Outcome of a write attempt for one replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
	pub ok: bool,
	pub message: String,
	pub caller: NodeId,
	pub ptr: DiskPointer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
	NoOp,
	IAm(IAm),
	SyncNodes(SyncNodes),
	WriteRequest(WriteRequest),
	ReadRequest(ReadRequest),
	ReadResult(ReadResult),
	WriteResult(WriteResult),
}

impl Payload {
	pub fn kind(&self) -> &'static str {
		match self {
			Payload::NoOp => "NoOp",
			Payload::IAm(_) => "IAm",
			Payload::SyncNodes(_) => "SyncNodes",
			Payload::WriteRequest(_) => "WriteRequest",
			Payload::ReadRequest(_) => "ReadRequest",
			Payload::ReadResult(_) => "ReadResult",
			Payload::WriteResult(_) => "WriteResult",
		}
	}

	/// Serialize to tag + body (everything after the length prefix)
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(128);
		match self {
			Payload::NoOp => {
				buf.put_u8(NOOP_TYPE);
			}
			Payload::IAm(p) => {
				buf.put_u8(IAM_TYPE);
				put_lp_str(&mut buf, p.node_id.as_str());
				put_lp_str(&mut buf, &p.address);
				buf.put_u32(p.free_bytes);
			}
			Payload::SyncNodes(p) => {
				buf.put_u8(SYNC_NODES_TYPE);
				buf.put_u32(p.nodes.len() as u32);
				for (node, address) in p.nodes.iter() {
					put_lp_str(&mut buf, node.as_str());
					put_lp_str(&mut buf, address);
				}
			}
			Payload::WriteRequest(p) => {
				buf.put_u8(WRITE_REQUEST_TYPE);
				put_lp_str(&mut buf, p.caller.as_str());
				put_ptr(&mut buf, &p.ptr);
				buf.put_u32(p.data.len() as u32);
				buf.put_slice(&p.data);
			}
			Payload::ReadRequest(p) => {
				buf.put_u8(READ_REQUEST_TYPE);
				put_lp_str(&mut buf, p.caller.as_str());
				buf.put_u32(p.ptrs.len() as u32);
				for ptr in p.ptrs.iter() {
					put_ptr(&mut buf, ptr);
				}
				put_lp_str(&mut buf, p.block_id.as_str());
			}
			Payload::ReadResult(p) => {
				buf.put_u8(READ_RESULT_TYPE);
				buf.put_u8(p.ok as u8);
				put_lp_str(&mut buf, &p.message);
				put_lp_str(&mut buf, p.caller.as_str());
				buf.put_u32(p.ptrs.len() as u32);
				for ptr in p.ptrs.iter() {
					put_ptr(&mut buf, ptr);
				}
				put_ptr(&mut buf, &p.data.ptr);
				buf.put_u32(p.data.data.len() as u32);
				buf.put_slice(&p.data.data);
				put_lp_str(&mut buf, p.block_id.as_str());
			}
			Payload::WriteResult(p) => {
				buf.put_u8(WRITE_RESULT_TYPE);
				buf.put_u8(p.ok as u8);
				put_lp_str(&mut buf, &p.message);
				put_lp_str(&mut buf, p.caller.as_str());
				put_ptr(&mut buf, &p.ptr);
			}
		}
		buf
	}

	/// Deserialize from tag + body. An unknown tag is a protocol
	/// violation, fatal to the connection that produced it.
	pub fn decode(data: &[u8]) -> Result<Payload, Error> {
		let mut buf = data;
		let tag = get_u8(&mut buf)?;
		match tag {
			NOOP_TYPE => Ok(Payload::NoOp),
			IAM_TYPE => {
				let node_id = NodeId::new(get_lp_str(&mut buf)?);
				let address = get_lp_str(&mut buf)?;
				let free_bytes = get_u32(&mut buf)?;
				Ok(Payload::IAm(IAm {
					node_id,
					address,
					free_bytes,
				}))
			}
			SYNC_NODES_TYPE => {
				let count = get_u32(&mut buf)? as usize;
				let mut nodes = Vec::with_capacity(count.min(1024));
				for _ in 0..count {
					let node = NodeId::new(get_lp_str(&mut buf)?);
					let address = get_lp_str(&mut buf)?;
					nodes.push((node, address));
				}
				Ok(Payload::SyncNodes(SyncNodes { nodes }))
			}
			WRITE_REQUEST_TYPE => {
				let caller = NodeId::new(get_lp_str(&mut buf)?);
				let ptr = get_ptr(&mut buf)?;
				let data = get_lp_bytes(&mut buf)?;
				Ok(Payload::WriteRequest(WriteRequest { caller, ptr, data }))
			}
			READ_REQUEST_TYPE => {
				let caller = NodeId::new(get_lp_str(&mut buf)?);
				let ptrs = get_ptrs(&mut buf)?;
				let block_id = BlockId::new(get_lp_str(&mut buf)?);
				Ok(Payload::ReadRequest(ReadRequest {
					caller,
					ptrs,
					block_id,
				}))
			}
			READ_RESULT_TYPE => {
				let ok = get_u8(&mut buf)? != 0;
				let message = get_lp_str(&mut buf)?;
				let caller = NodeId::new(get_lp_str(&mut buf)?);
				let ptrs = get_ptrs(&mut buf)?;
				let data_ptr = get_ptr(&mut buf)?;
				let data = get_lp_bytes(&mut buf)?;
				let block_id = BlockId::new(get_lp_str(&mut buf)?);
				Ok(Payload::ReadResult(ReadResult {
					ok,
					message,
					caller,
					ptrs,
					data: RawData {
						ptr: data_ptr,
						data,
					},
					block_id,
				}))
			}
			WRITE_RESULT_TYPE => {
				let ok = get_u8(&mut buf)? != 0;
				let message = get_lp_str(&mut buf)?;
				let caller = NodeId::new(get_lp_str(&mut buf)?);
				let ptr = get_ptr(&mut buf)?;
				Ok(Payload::WriteResult(WriteResult {
					ok,
					message,
					caller,
					ptr,
				}))
			}
			other => Err(Error::UnknownTag(other)),
		}
	}
}

// ---- codec helpers ----

fn put_lp_str(buf: &mut Vec<u8>, s: &str) {
	buf.put_u32(s.len() as u32);
	buf.put_slice(s.as_bytes());
}

fn put_ptr(buf: &mut Vec<u8>, ptr: &DiskPointer) {
	put_lp_str(buf, ptr.node_id.as_str());
	put_lp_str(buf, &ptr.file_name);
}

fn need(buf: &[u8], n: usize) -> Result<(), Error> {
	if buf.remaining() < n {
		Err(Error::Framing)
	} else {
		Ok(())
	}
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, Error> {
	need(*buf, 1)?;
	Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
	need(*buf, 4)?;
	Ok(buf.get_u32())
}

fn get_lp_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, Error> {
	let len = get_u32(buf)? as usize;
	need(*buf, len)?;
	let mut data = vec![0u8; len];
	buf.copy_to_slice(&mut data);
	Ok(data)
}

fn get_lp_str(buf: &mut &[u8]) -> Result<String, Error> {
	Ok(String::from_utf8(get_lp_bytes(buf)?)?)
}

fn get_ptr(buf: &mut &[u8]) -> Result<DiskPointer, Error> {
	let node_id = NodeId::new(get_lp_str(buf)?);
	let file_name = get_lp_str(buf)?;
	Ok(DiskPointer { node_id, file_name })
}

fn get_ptrs(buf: &mut &[u8]) -> Result<Vec<DiskPointer>, Error> {
	let count = get_u32(buf)? as usize;
	let mut ptrs = Vec::with_capacity(count.min(1024));
	for _ in 0..count {
		ptrs.push(get_ptr(buf)?);
	}
	Ok(ptrs)
}
