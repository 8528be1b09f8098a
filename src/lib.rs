//! An [NDT v3.7](https://github.com/ndt-project/ndt/wiki/NDTProtocol) speed
//! test client library.
//!
//! NDT (Network Diagnostic Tool) is a client/server protocol for measuring
//! TCP throughput. This crate implements the client side of the v3.7
//! control protocol: it discovers a server through mlab-ns (or uses a
//! configured one), negotiates a control session, runs the download and
//! upload subtests the server grants, and reports the server's final
//! web100 / tcp_info / summary variables. The control and measurement
//! connections optionally run over TLS, WebSocket framing, and a local
//! SOCKS5h proxy.
//!
//! # Quick start
//!
//! ```no_run
//! use ndt_client::client::Client;
//! use ndt_client::settings::{NettestFlags, Settings};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut settings = Settings::default();
//! settings.nettest_flags = NettestFlags::DOWNLOAD | NettestFlags::UPLOAD;
//! let client = Client::new(settings);
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
mod download;
pub mod emitter;
pub mod error;
pub mod locate;
pub mod msg;
pub mod net;
pub mod params;
pub mod settings;
mod socks5;
mod tls;
mod upload;
pub mod ws;
