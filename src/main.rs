//! tapnet - TAP networking for unikernel sandboxes
//!
//! Operator front-end for the library: sets up and tears down sandbox
//! networks and inspects host interfaces.

mod cli;

use cli::{Cli, Commands};
use std::sync::Arc;
use tapnet::error::Result;
use tapnet::network::{self, HostKernel, Interface, NetKernel, NetworkKind, UnikernelNetworkInfo};
use tapnet::{config, logging};
use tracing::warn;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let config = config::load_or_default(cli.config.as_deref())?;
    logging::init(&config.logging.level, cli.verbose);

    let kernel: Arc<dyn NetKernel> = Arc::new(HostKernel::new());

    match cli.command {
        Commands::Setup {
            mode,
            uid,
            gid,
            json,
        } => {
            let kind: NetworkKind = match mode {
                Some(mode) => mode.parse()?,
                None => config.network.kind()?,
            };
            let uid = uid.unwrap_or_else(|| nix::unistd::getuid().as_raw());
            let gid = gid.unwrap_or_else(|| nix::unistd::getgid().as_raw());

            let manager = kind.build(kernel, config.network.tap_queues);
            let info = manager.network_setup(uid, gid)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_network_info(&info);
            }
        }

        Commands::Cleanup {
            tap,
            ignore_missing,
        } => match network::cleanup_with(kernel.as_ref(), &tap) {
            Ok(()) => println!("Removed '{}'", tap),
            Err(e) if ignore_missing && e.is_not_found() => {
                warn!(tap = %tap, error = %e, "Nothing to clean up");
                println!("'{}' already absent", tap);
            }
            Err(e) => return Err(e),
        },

        Commands::Info { iface, json } => {
            let info = network::get_interface_info(kernel.as_ref(), &iface)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_interface(&info);
            }
        }

        Commands::Index => {
            println!("{}", network::get_tap_index(kernel.as_ref())?);
        }

        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
        }
    }

    Ok(())
}

fn print_network_info(info: &UnikernelNetworkInfo) {
    println!("TAP device: {}", info.tap_device);
    print_interface(&info.eth_device);
}

fn print_interface(iface: &Interface) {
    println!("  Interface: {}", iface.interface);
    println!("  IP:        {}", iface.ip);
    println!("  Mask:      {}", iface.mask);
    println!("  Gateway:   {}", iface.default_gateway);
    println!("  MAC:       {}", iface.mac);
}
