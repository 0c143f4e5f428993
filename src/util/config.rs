use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Directory holding the node_id file, cluster.json and one file
	/// per stored block
	pub storage_dir: PathBuf,

	/// Address the cluster listener binds to
	pub listen_addr: SocketAddr,

	/// host:port advertised to peers in the IAm handshake; defaults to
	/// the textual form of listen_addr
	pub public_addr: Option<String>,

	/// Address the HTTP file front-end binds to
	pub webdav_bind_addr: SocketAddr,

	/// Peers dialed at startup, in addition to every address remembered
	/// in cluster.json
	#[serde(default)]
	pub bootstrap_peers: Vec<String>,

	/// Free-bytes figure advertised to peers (in MiB), overriding the
	/// measured available space of storage_dir
	pub advertise_free_bytes: Option<u32>,

	/// Capacity of every inter-component channel. A full channel blocks
	/// the producer; messages are never dropped.
	#[serde(default = "default_channel_size")]
	pub channel_size: usize,
}

impl Config {
	pub fn advertised_addr(&self) -> String {
		self.public_addr
			.clone()
			.unwrap_or_else(|| self.listen_addr.to_string())
	}
}

fn default_channel_size() -> usize {
	128
}

pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}
