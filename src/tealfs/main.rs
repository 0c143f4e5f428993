//! TealFS CLI, used to launch a TealFS node

#[macro_use]
extern crate log;

use std::path::PathBuf;

use structopt::StructOpt;

use tealfs::server::run_server;

#[derive(StructOpt, Debug)]
#[structopt(name = "tealfs")]
struct Opt {
	#[structopt(subcommand)]
	cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run the TealFS node
	#[structopt(name = "server")]
	Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "/etc/tealfs.toml")]
	config_file: PathBuf,
}

#[tokio::main]
async fn main() {
	pretty_env_logger::init();

	let opt = Opt::from_args();

	let res = match opt.cmd {
		Command::Server(server_opt) => {
			// Abort on panic (same behavior as in Go)
			std::panic::set_hook(Box::new(|panic_info| {
				error!("{}", panic_info.to_string());
				std::process::abort();
			}));

			run_server(server_opt.config_file).await
		}
	};

	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}
