//! RESP2/RESP3 client with cluster-aware request routing.
//!
//! [`NodeClient`] speaks the wire protocol to a single server;
//! [`ClusterClient`] layers hash-slot routing, redirect handling and
//! topology refresh on top of a set of them. Both advance only while the
//! caller awaits their `update` methods.

pub mod client;
pub mod cluster;
pub mod error;
pub mod harness;
pub mod protocol;
pub mod reducer;
pub mod stream;

pub use client::NodeClient;
pub use cluster::ClusterClient;
pub use error::{ClientError, Result};
pub use protocol::{RespParser, RespValue};
