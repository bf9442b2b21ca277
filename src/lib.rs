//! Devgate - An HTTP front door for a frontend dev server
//!
//! This library starts a package-manager script (for example `npm run start`)
//! on a free local port and forwards HTTP traffic to it:
//! - Reserves a port and passes it to the script as `-- --port <N>`
//! - Streams the script's stdout/stderr into the application log
//! - Waits for a build success line, then probes the port until it answers
//! - Holds incoming requests until the dev server is ready, with a per-request timeout
//! - Replays a failed startup to every request instead of retrying it
//! - Stops the dev server when the application shuts down

pub mod config;
pub mod error;
pub mod lines;
pub mod pool;
pub mod port;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod supervisor;
pub mod target;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
