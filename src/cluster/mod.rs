//! Cluster-aware routing: hash slots, topology, redirects, migration.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              ClusterClient                  │
//! │   send / send_transaction / send_to / call  │
//! └─────────────────────────────────────────────┘
//!                      │ queues
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │        ReducerList<ClusterTask>             │
//! │  ConfigTask: slot map refresh cycle         │
//! │  RequestTask: route, dispatch, redirects    │
//! │  MigrationTask: client-driven resharding    │
//! └─────────────────────────────────────────────┘
//!                      │ one NodeClient per master
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │   ClusterTopology (CLUSTER SLOTS ranges)    │
//! │   key_slot: CRC16 over the hash tag         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Everything advances inside [`ClusterClient::update`]: connections are
//! pumped first, then each task steps once. A request queued while the
//! slot map is dirty or incomplete simply waits; redirects and refreshes
//! happen between ticks without the caller seeing them.

mod client;
mod migration;
mod slots;
mod topology;

pub use client::{parse_redirect, ClusterClient, ConfigState, Redirect};
pub use migration::{MigrationHandler, MigrationPlan};
pub use slots::{key_slot, SLOT_COUNT};
pub use topology::{ClusterTopology, NodeEntry, SlotRange};
