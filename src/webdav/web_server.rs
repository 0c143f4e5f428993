//! HTTP front-end: GET/PUT of paths against the block bridge, plus the
//! small admin surface (`POST /connect-to`, `GET /status`).
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::select;
use tokio::sync::{mpsc, watch};

use tealfs_core::UiStatus;
use tealfs_net::pool::ConnectToReq;
use tealfs_util::data::*;

use crate::bridge::Bridge;
use crate::error::{Error, OkOrBadRequest};

/// Last known state of every peer, fed by the manager's status stream
pub type StatusTable = Arc<RwLock<HashMap<NodeId, UiStatus>>>;

pub struct WebState {
	pub bridge: Bridge,
	pub connect_tos: mpsc::Sender<ConnectToReq>,
	pub statuses: StatusTable,
}

/// The block id of a path is the hex sha-256 of the path itself, which
/// doubles as the replica file name on every node.
pub fn block_id_for_path(path: &str) -> BlockId {
	BlockId::new(hex::encode(hash(path.as_bytes())))
}

pub async fn run_status_collector(
	mut rx: mpsc::Receiver<UiStatus>,
	statuses: StatusTable,
	mut must_exit: watch::Receiver<bool>,
) {
	while !*must_exit.borrow_and_update() {
		select! {
			_ = must_exit.changed() => continue,
			status = rx.recv() => match status {
				Some(status) => {
					statuses
						.write()
						.unwrap()
						.insert(status.node_id.clone(), status);
				}
				None => break,
			},
		}
	}
}

pub async fn run_web_server(
	bind_addr: SocketAddr,
	state: Arc<WebState>,
	shutdown_signal: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
	let service = make_service_fn(|conn: &AddrStream| {
		let state = state.clone();
		let client_addr = conn.remote_addr();
		async move {
			Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
				let state = state.clone();
				handler(state, req, client_addr)
			}))
		}
	});

	let server = Server::bind(&bind_addr).serve(service);
	let graceful = server.with_graceful_shutdown(shutdown_signal);
	info!("File server listening on http://{}", bind_addr);

	graceful.await
}

async fn handler(
	state: Arc<WebState>,
	req: Request<Body>,
	addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
	debug!("{} {} {}", addr, req.method(), req.uri());
	match handler_inner(state, req).await {
		Ok(resp) => Ok(resp),
		Err(e) => {
			let mut resp = Response::new(Body::from(format!("{}\n", e)));
			*resp.status_mut() = e.http_status_code();
			Ok(resp)
		}
	}
}

async fn handler_inner(state: Arc<WebState>, req: Request<Body>) -> Result<Response<Body>, Error> {
	let path = percent_decode_str(req.uri().path())
		.decode_utf8()
		.map_err(|_| Error::BadRequest("invalid percent-encoding in path".to_string()))?
		.to_string();

	match (req.method(), path.as_str()) {
		(&Method::POST, "/connect-to") => handle_connect_to(state, req).await,
		(&Method::GET, "/status") => handle_status(state),
		(&Method::GET, _) => handle_get(state, &path).await,
		(&Method::PUT, _) => handle_put(state, &path, req).await,
		_ => Err(Error::BadRequest("invalid method".to_string())),
	}
}

async fn handle_connect_to(
	state: Arc<WebState>,
	req: Request<Body>,
) -> Result<Response<Body>, Error> {
	let query = req.uri().query().map(str::to_string);
	let body = hyper::body::to_bytes(req.into_body()).await?;
	let body = String::from_utf8(body.to_vec())
		.map_err(|_| Error::BadRequest("invalid UTF-8 in request body".to_string()))?;

	let address = find_param(query.as_deref(), &body, "hostAndPort")
		.ok_or_bad_request("missing hostAndPort parameter")?;
	info!("Admin request: connect to {}", address);
	state
		.connect_tos
		.send(ConnectToReq { address })
		.await
		.map_err(|_| Error::InternalError("manager is gone".into()))?;

	Ok(Response::new(Body::from("connecting\n")))
}

fn handle_status(state: Arc<WebState>) -> Result<Response<Body>, Error> {
	let statuses = state.statuses.read().unwrap();
	let list = statuses.values().collect::<Vec<_>>();
	let json = serde_json::to_string(&list).map_err(|e| Error::InternalError(e.into()))?;
	Ok(Response::builder()
		.header("Content-Type", "application/json")
		.body(Body::from(json))?)
}

async fn handle_get(state: Arc<WebState>, path: &str) -> Result<Response<Body>, Error> {
	let block = state.bridge.get(block_id_for_path(path)).await?;
	Ok(Response::new(Body::from(block.data)))
}

async fn handle_put(
	state: Arc<WebState>,
	path: &str,
	req: Request<Body>,
) -> Result<Response<Body>, Error> {
	let body = hyper::body::to_bytes(req.into_body()).await?;
	let block = Block::mirrored(block_id_for_path(path), body.to_vec());
	state.bridge.put(block).await?;
	Ok(Response::builder()
		.status(StatusCode::OK)
		.body(Body::from("stored\n"))?)
}

fn find_param(query: Option<&str>, body: &str, name: &str) -> Option<String> {
	for source in query.into_iter().chain(std::iter::once(body)) {
		for pair in source.split('&') {
			let mut kv = pair.splitn(2, '=');
			if kv.next() == Some(name) {
				if let Some(value) = kv.next() {
					if let Ok(decoded) = percent_decode_str(value).decode_utf8() {
						return Some(decoded.to_string());
					}
				}
			}
		}
	}
	None
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_block_id_is_stable_per_path() {
		assert_eq!(block_id_for_path("/a.txt"), block_id_for_path("/a.txt"));
		assert_ne!(block_id_for_path("/a.txt"), block_id_for_path("/b.txt"));
	}

	#[test]
	fn test_find_param() {
		assert_eq!(
			find_param(None, "hostAndPort=127.0.0.1%3A9000", "hostAndPort"),
			Some("127.0.0.1:9000".to_string())
		);
		assert_eq!(
			find_param(Some("hostAndPort=localhost:9000"), "", "hostAndPort"),
			Some("localhost:9000".to_string())
		);
		assert_eq!(find_param(None, "other=x", "hostAndPort"), None);
	}
}
