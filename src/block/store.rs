//! The disk store owns one directory and stores one file per block,
//! file name = block id. Writes are full-file overwrites; reads return
//! the whole file. The store never hashes or verifies content.
use std::path::PathBuf;

use tokio::select;
use tokio::sync::{mpsc, watch};

use tealfs_net::error::LogError;
use tealfs_net::payload::*;
use tealfs_util::data::*;
use tealfs_util::error::Error;

pub struct DiskStore {
	node_id: NodeId,
	dir: PathBuf,

	in_writes: mpsc::Receiver<WriteRequest>,
	in_reads: mpsc::Receiver<ReadRequest>,
	out_write_results: mpsc::Sender<WriteResult>,
	out_read_results: mpsc::Sender<ReadResult>,
}

impl DiskStore {
	pub fn new(
		node_id: NodeId,
		dir: PathBuf,
		in_writes: mpsc::Receiver<WriteRequest>,
		in_reads: mpsc::Receiver<ReadRequest>,
		out_write_results: mpsc::Sender<WriteResult>,
		out_read_results: mpsc::Sender<ReadResult>,
	) -> Result<Self, Error> {
		std::fs::create_dir_all(&dir)?;
		Ok(Self {
			node_id,
			dir,
			in_writes,
			in_reads,
			out_write_results,
			out_read_results,
		})
	}

	pub async fn run(mut self, mut must_exit: watch::Receiver<bool>) {
		while !*must_exit.borrow_and_update() {
			select! {
				_ = must_exit.changed() => continue,
				req = self.in_writes.recv() => match req {
					Some(req) => self.handle_write(req).await,
					None => break,
				},
				req = self.in_reads.recv() => match req {
					Some(req) => self.handle_read(req).await,
					None => break,
				},
			}
		}
		debug!("Disk store for {} exiting", self.node_id.short());
	}

	async fn handle_write(&mut self, req: WriteRequest) {
		let path = self.dir.join(&req.ptr.file_name);
		let (ok, message) = match tokio::fs::write(&path, &req.data[..]).await {
			Ok(()) => (true, String::new()),
			Err(e) => {
				warn!("Error writing block {}: {}", req.ptr.file_name, e);
				(false, format!("{}", e))
			}
		};
		self.out_write_results
			.send(WriteResult {
				ok,
				message,
				caller: req.caller,
				ptr: req.ptr,
			})
			.await
			.log_err("Reporting write result");
	}

	async fn handle_read(&mut self, req: ReadRequest) {
		let result = match req.ptrs.split_first() {
			None => ReadResult::error(req.caller, vec![], req.block_id, "no pointers in read request"),
			Some((head, tail)) => {
				let path = self.dir.join(&head.file_name);
				match tokio::fs::read(&path).await {
					Ok(data) => ReadResult {
						ok: true,
						message: String::new(),
						caller: req.caller,
						ptrs: tail.to_vec(),
						data: RawData {
							ptr: head.clone(),
							data,
						},
						block_id: req.block_id,
					},
					Err(e) => {
						let message = if e.kind() == std::io::ErrorKind::NotFound {
							"not found".to_string()
						} else {
							format!("{}", e)
						};
						ReadResult::error(req.caller, tail.to_vec(), req.block_id, message)
					}
				}
			}
		};
		self.out_read_results
			.send(result)
			.await
			.log_err("Reporting read result");
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct TestStore {
		writes: mpsc::Sender<WriteRequest>,
		reads: mpsc::Sender<ReadRequest>,
		write_results: mpsc::Receiver<WriteResult>,
		read_results: mpsc::Receiver<ReadResult>,
		_stop: watch::Sender<bool>,
	}

	fn spawn_store(dir: &std::path::Path) -> TestStore {
		let (write_tx, write_rx) = mpsc::channel(16);
		let (read_tx, read_rx) = mpsc::channel(16);
		let (wres_tx, wres_rx) = mpsc::channel(16);
		let (rres_tx, rres_rx) = mpsc::channel(16);
		let store = DiskStore::new(
			NodeId::new("node-a"),
			dir.to_path_buf(),
			write_rx,
			read_rx,
			wres_tx,
			rres_tx,
		)
		.unwrap();
		let (stop_tx, stop_rx) = watch::channel(false);
		tokio::spawn(store.run(stop_rx));
		TestStore {
			writes: write_tx,
			reads: read_tx,
			write_results: wres_rx,
			read_results: rres_rx,
			_stop: stop_tx,
		}
	}

	fn ptr(node: &str, file: &str) -> DiskPointer {
		DiskPointer::new(NodeId::new(node), file)
	}

	#[tokio::test]
	async fn test_write_then_read() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut store = spawn_store(dir.as_path());

		store
			.writes
			.send(WriteRequest {
				caller: NodeId::new("node-a"),
				ptr: ptr("node-a", "blk1"),
				data: b"hello".to_vec(),
			})
			.await
			.unwrap();
		let wres = store.write_results.recv().await.unwrap();
		assert!(wres.ok);
		assert_eq!(wres.ptr, ptr("node-a", "blk1"));

		store
			.reads
			.send(ReadRequest {
				caller: NodeId::new("node-a"),
				ptrs: vec![ptr("node-a", "blk1")],
				block_id: BlockId::new("blk1"),
			})
			.await
			.unwrap();
		let rres = store.read_results.recv().await.unwrap();
		assert!(rres.ok);
		assert_eq!(rres.data.data, b"hello".to_vec());
		assert!(rres.ptrs.is_empty());
	}

	#[tokio::test]
	async fn test_missing_file_returns_tail() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut store = spawn_store(dir.as_path());

		store
			.reads
			.send(ReadRequest {
				caller: NodeId::new("node-a"),
				ptrs: vec![ptr("node-a", "nope"), ptr("node-b", "nope")],
				block_id: BlockId::new("nope"),
			})
			.await
			.unwrap();
		let rres = store.read_results.recv().await.unwrap();
		assert!(!rres.ok);
		assert_eq!(rres.message, "not found");
		assert_eq!(rres.ptrs, vec![ptr("node-b", "nope")]);
	}

	#[tokio::test]
	async fn test_write_overwrites_fully() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut store = spawn_store(dir.as_path());

		for body in [&b"first version, quite long"[..], &b"second"[..]] {
			store
				.writes
				.send(WriteRequest {
					caller: NodeId::new("node-a"),
					ptr: ptr("node-a", "blk1"),
					data: body.to_vec(),
				})
				.await
				.unwrap();
			assert!(store.write_results.recv().await.unwrap().ok);
		}

		store
			.reads
			.send(ReadRequest {
				caller: NodeId::new("node-a"),
				ptrs: vec![ptr("node-a", "blk1")],
				block_id: BlockId::new("blk1"),
			})
			.await
			.unwrap();
		let rres = store.read_results.recv().await.unwrap();
		assert_eq!(rres.data.data, b"second".to_vec());
	}

	#[tokio::test]
	async fn test_empty_pointer_list() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut store = spawn_store(dir.as_path());

		store
			.reads
			.send(ReadRequest {
				caller: NodeId::new("node-a"),
				ptrs: vec![],
				block_id: BlockId::new("blk1"),
			})
			.await
			.unwrap();
		let rres = store.read_results.recv().await.unwrap();
		assert!(!rres.ok);
		assert!(rres.ptrs.is_empty());
	}
}
