//! tapnet - host-side networking for unikernel sandboxes
//!
//! Creates a TAP device owned by the sandbox, mirrors it with the
//! physical interface through tc, optionally NATs its subnet, and reports
//! the addressing the sandbox should boot with.
//!
//! ```no_run
//! let manager = tapnet::network::new_network_manager("static")?;
//! let info = manager.network_setup(1000, 1000)?;
//! println!("{} -> {}", info.tap_device, info.eth_device.ip);
//!
//! tapnet::network::cleanup(&info.tap_device)?;
//! # Ok::<(), tapnet::error::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod network;
