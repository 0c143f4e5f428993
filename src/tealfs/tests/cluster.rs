//! Whole-cluster scenarios: every test spawns full in-process nodes
//! (pool, disk, manager, bridge, HTTP front) on loopback ports and
//! drives them over HTTP, the way a client would.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::{Body, Client, Method, Request, StatusCode};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tealfs::server::run_node;
use tealfs_util::config::Config;
use tealfs_util::error::Error;
use tealfs_webdav::web_server::block_id_for_path;

const SETTLE: Duration = Duration::from_secs(2);

struct TestNode {
	webdav_port: u16,
	cluster_port: u16,
	storage_dir: PathBuf,
	stop: watch::Sender<bool>,
	handle: JoinHandle<Result<(), Error>>,
}

async fn spawn_node(
	base_dir: &Path,
	name: &str,
	cluster_port: u16,
	webdav_port: u16,
	free_mib: u32,
) -> TestNode {
	let storage_dir = base_dir.join(name);
	let config = Config {
		storage_dir: storage_dir.clone(),
		listen_addr: addr(cluster_port),
		public_addr: Some(format!("127.0.0.1:{}", cluster_port)),
		webdav_bind_addr: addr(webdav_port),
		bootstrap_peers: vec![],
		advertise_free_bytes: Some(free_mib),
		channel_size: 128,
	};
	let (stop, stop_rx) = watch::channel(false);
	let handle = tokio::spawn(run_node(config, stop_rx));
	tokio::time::sleep(Duration::from_millis(500)).await;
	TestNode {
		webdav_port,
		cluster_port,
		storage_dir,
		stop,
		handle,
	}
}

impl TestNode {
	async fn shutdown(self) {
		self.stop.send(true).unwrap();
		self.handle.await.unwrap().unwrap();
	}

	fn block_file(&self, path: &str) -> PathBuf {
		self.storage_dir.join(block_id_for_path(path).as_str())
	}
}

fn addr(port: u16) -> SocketAddr {
	format!("127.0.0.1:{}", port).parse().unwrap()
}

async fn http_put(node: &TestNode, path: &str, body: &str) -> StatusCode {
	let req = Request::builder()
		.method(Method::PUT)
		.uri(format!("http://127.0.0.1:{}{}", node.webdav_port, path))
		.body(Body::from(body.to_string()))
		.unwrap();
	Client::new().request(req).await.unwrap().status()
}

async fn http_get(node: &TestNode, path: &str) -> (StatusCode, String) {
	let uri = format!("http://127.0.0.1:{}{}", node.webdav_port, path)
		.parse()
		.unwrap();
	let resp = Client::new().get(uri).await.unwrap();
	let status = resp.status();
	let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
	(status, String::from_utf8(body.to_vec()).unwrap())
}

async fn http_connect_to(node: &TestNode, target: &TestNode) {
	let req = Request::builder()
		.method(Method::POST)
		.uri(format!("http://127.0.0.1:{}/connect-to", node.webdav_port))
		.body(Body::from(format!(
			"hostAndPort=127.0.0.1:{}",
			target.cluster_port
		)))
		.unwrap();
	let status = Client::new().request(req).await.unwrap().status();
	assert_eq!(status, StatusCode::OK);
}

async fn with_timeout(fut: impl std::future::Future<Output = ()>) {
	select! {
		_ = fut => (),
		_ = tokio::time::sleep(Duration::from_secs(60)) => panic!("test timeout"),
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_node_cluster_one_file() {
	with_timeout(async {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let a = spawn_node(tmp.as_path(), "a", 22081, 22080, 1).await;

		assert_eq!(http_put(&a, "/test.txt", "hello").await, StatusCode::OK);
		let (status, body) = http_get(&a, "/test.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "hello");

		// A block never written reads as missing
		let (status, _) = http_get(&a, "/absent.txt").await;
		assert_eq!(status, StatusCode::NOT_FOUND);

		a.shutdown().await;
	})
	.await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_cluster_mirrors_and_survives_restart() {
	with_timeout(async {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let a = spawn_node(tmp.as_path(), "a", 23081, 23080, 1).await;
		let b = spawn_node(tmp.as_path(), "b", 23091, 23090, 1).await;

		http_connect_to(&a, &b).await;
		tokio::time::sleep(SETTLE).await;

		assert_eq!(http_put(&a, "/test1.txt", "content1").await, StatusCode::OK);
		assert_eq!(http_put(&b, "/test2.txt", "content2").await, StatusCode::OK);

		// Each file is readable from the other node
		let (status, body) = http_get(&b, "/test1.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "content1");
		let (status, body) = http_get(&a, "/test2.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "content2");

		// Mirrored blocks land on both nodes
		assert!(a.block_file("/test1.txt").exists());
		assert!(b.block_file("/test1.txt").exists());

		// Restart both nodes with the same storage; cluster.json must
		// drive reconnection without any new connect-to
		a.shutdown().await;
		b.shutdown().await;
		let a = spawn_node(tmp.as_path(), "a", 23081, 23080, 1).await;
		let b = spawn_node(tmp.as_path(), "b", 23091, 23090, 1).await;
		tokio::time::sleep(SETTLE + SETTLE).await;

		let (status, body) = http_get(&b, "/test1.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "content1");
		let (status, body) = http_get(&a, "/test2.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "content2");

		a.shutdown().await;
		b.shutdown().await;
	})
	.await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_asymmetric_weights_place_primary_on_heavy_node() {
	with_timeout(async {
		let tmp = mktemp::Temp::new_dir().unwrap();
		// A advertises no capacity at all, B does
		let a = spawn_node(tmp.as_path(), "a", 24081, 24080, 0).await;
		let b = spawn_node(tmp.as_path(), "b", 24091, 24090, 1).await;

		http_connect_to(&a, &b).await;
		tokio::time::sleep(SETTLE).await;

		assert_eq!(http_put(&a, "/f.txt", "payload").await, StatusCode::OK);
		tokio::time::sleep(SETTLE).await;

		// Primary replica on B, mirror on A (the only other node)
		assert!(b.block_file("/f.txt").exists());
		assert!(a.block_file("/f.txt").exists());

		let (status, body) = http_get(&a, "/f.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "payload");

		a.shutdown().await;
		b.shutdown().await;
	})
	.await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_degraded_read_falls_through_to_mirror() {
	with_timeout(async {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let a = spawn_node(tmp.as_path(), "a", 25081, 25080, 1).await;
		let b = spawn_node(tmp.as_path(), "b", 25091, 25090, 1).await;

		http_connect_to(&a, &b).await;
		tokio::time::sleep(SETTLE).await;

		assert_eq!(http_put(&a, "/f.txt", "replicated").await, StatusCode::OK);
		tokio::time::sleep(SETTLE).await;
		assert!(a.block_file("/f.txt").exists());
		assert!(b.block_file("/f.txt").exists());

		// Lose A's replica; the read on A must fall through to B
		std::fs::remove_file(a.block_file("/f.txt")).unwrap();
		let (status, body) = http_get(&a, "/f.txt").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, "replicated");

		a.shutdown().await;
		b.shutdown().await;
	})
	.await
}
