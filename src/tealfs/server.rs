//! Server bootstrap: builds the channel mesh between the five
//! components and runs them as independent tasks until the shutdown
//! signal fires.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};

use tealfs_block::DiskStore;
use tealfs_core::manager::{read_or_gen_node_id, Manager, ManagerRx, ManagerTx};
use tealfs_net::error::LogError;
use tealfs_net::pool::{ConnectToReq, ConnectionPool};
use tealfs_util::config::{read_config, Config};
use tealfs_util::error::{Error, OkOrMessage};
use tealfs_webdav::bridge::bridge;
use tealfs_webdav::web_server::{run_status_collector, run_web_server, WebState};

async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}

pub async fn run_server(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	let watch_cancel = watch_shutdown_signal();
	run_node(config, watch_cancel).await
}

/// Run one node until the cancellation token fires. Split from
/// `run_server` so the integration suite can drive whole clusters
/// in-process.
pub async fn run_node(config: Config, watch_cancel: watch::Receiver<bool>) -> Result<(), Error> {
	std::fs::create_dir_all(&config.storage_dir)?;
	let node_id = read_or_gen_node_id(&config.storage_dir)?;
	info!("Node ID of this node: {}", node_id.short());

	let free_bytes = advertised_free_bytes(&config);
	info!("Advertising {} MiB of free space", free_bytes);

	let cs = config.channel_size;

	// Inbound manager streams
	let (ui_connect_tx, ui_connect_rx) = mpsc::channel(cs);
	let (conn_status_tx, conn_status_rx) = mpsc::channel(cs);
	let (receives_tx, receives_rx) = mpsc::channel(cs);
	let (disk_rres_tx, disk_rres_rx) = mpsc::channel(cs);
	let (disk_wres_tx, disk_wres_rx) = mpsc::channel(cs);
	let (webdav_get_tx, webdav_get_rx) = mpsc::channel(cs);
	let (webdav_put_tx, webdav_put_rx) = mpsc::channel(cs);

	// Outbound manager streams
	let (connect_tos_tx, connect_tos_rx) = mpsc::channel(cs);
	let (sends_tx, sends_rx) = mpsc::channel(cs);
	let (disk_write_tx, disk_write_rx) = mpsc::channel(cs);
	let (disk_read_tx, disk_read_rx) = mpsc::channel(cs);
	let (ui_status_tx, ui_status_rx) = mpsc::channel(cs);
	let (mgr_get_tx, mgr_get_rx) = mpsc::channel(cs);
	let (mgr_put_tx, mgr_put_rx) = mpsc::channel(cs);

	info!("Initializing connection pool...");
	let pool = ConnectionPool::bind(
		config.listen_addr,
		conn_status_tx,
		receives_tx,
		connect_tos_rx,
		sends_rx,
	)
	.await
	.ok_or_message(format!("Cannot bind {}", config.listen_addr))?;

	info!("Initializing disk store...");
	let store = DiskStore::new(
		node_id.clone(),
		config.storage_dir.clone(),
		disk_write_rx,
		disk_read_rx,
		disk_wres_tx,
		disk_rres_tx,
	)?;

	info!("Initializing manager...");
	let manager = Manager::new(
		node_id,
		config.advertised_addr(),
		free_bytes,
		&config.storage_dir,
		ManagerTx {
			connect_tos: connect_tos_tx,
			sends: sends_tx,
			disk_writes: disk_write_tx,
			disk_reads: disk_read_tx,
			ui_statuses: ui_status_tx,
			webdav_gets: mgr_get_tx,
			webdav_puts: mgr_put_tx,
		},
	)?;
	let manager_rx = ManagerRx {
		ui_connect_tos: ui_connect_rx,
		conn_statuses: conn_status_rx,
		receives: receives_rx,
		disk_read_results: disk_rres_rx,
		disk_write_results: disk_wres_rx,
		webdav_gets: webdav_get_rx,
		webdav_puts: webdav_put_rx,
	};

	let (bridge, bridge_runner) = bridge(cs, webdav_get_tx, webdav_put_tx, mgr_get_rx, mgr_put_rx);
	let statuses = Arc::new(RwLock::new(HashMap::new()));
	let web_state = Arc::new(WebState {
		bridge,
		connect_tos: ui_connect_tx.clone(),
		statuses: statuses.clone(),
	});

	info!("Spawning tasks...");
	let mut tasks = vec![
		(
			"Connection pool",
			tokio::spawn(pool.run(watch_cancel.clone())),
		),
		("Disk store", tokio::spawn(store.run(watch_cancel.clone()))),
		(
			"Manager",
			tokio::spawn(manager.run(manager_rx, watch_cancel.clone())),
		),
		(
			"Bridge",
			tokio::spawn(bridge_runner.run(watch_cancel.clone())),
		),
		(
			"Status collector",
			tokio::spawn(run_status_collector(
				ui_status_rx,
				statuses,
				watch_cancel.clone(),
			)),
		),
	];

	let web_server = tokio::spawn(run_web_server(
		config.webdav_bind_addr,
		web_state,
		wait_from(watch_cancel.clone()),
	));

	for peer in config.bootstrap_peers.iter() {
		info!("Dialing bootstrap peer {}", peer);
		ui_connect_tx
			.send(ConnectToReq {
				address: peer.clone(),
			})
			.await
			.log_err("Dialing bootstrap peer");
	}
	drop(ui_connect_tx);

	if let Err(e) = web_server.await? {
		error!("Web server exited with error: {}", e);
	} else {
		info!("Web server exited without error.");
	}

	while let Some((desc, handle)) = tasks.pop() {
		if let Err(e) = handle.await {
			warn!("Error awaiting {}: {}", desc, e);
		} else {
			info!("{} exited without error.", desc);
		}
	}

	info!("Cleaning up...");
	Ok(())
}

fn advertised_free_bytes(config: &Config) -> u32 {
	if let Some(mib) = config.advertise_free_bytes {
		return mib;
	}
	match fs2::available_space(&config.storage_dir) {
		Ok(bytes) => (bytes / (1024 * 1024)).min(u32::MAX as u64) as u32,
		Err(e) => {
			warn!(
				"Could not determine free space of {}: {}",
				config.storage_dir.display(),
				e
			);
			1
		}
	}
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(windows)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::windows::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = ctrl_c().expect("Failed to install Ctrl-C handler");
		let mut sigclose = ctrl_close().expect("Failed to install Ctrl-Close handler");
		let mut sigsdown = ctrl_shutdown().expect("Failed to install Ctrl-Shutdown handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received Ctrl-C, shutting down."),
			_ = sigclose.recv() => info!("Received Ctrl-Close, shutting down."),
			_ = sigsdown.recv() => info!("Received Ctrl-Shutdown, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
