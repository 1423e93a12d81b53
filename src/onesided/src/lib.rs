//! A client and a server that set up one reliable RDMA connection through the connection
//! manager, swap buffer descriptors over SEND/RECV, and then let the client WRITE its payload
//! into the server's buffer and READ it back without the server taking part.

pub mod client;
pub mod cm;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod memory;
pub mod net;
pub mod ops;
pub mod poller;
pub mod resources;
pub mod server;
pub mod work;

pub use error::{Error, Result};
