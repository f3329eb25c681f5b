//! Snowflake-style 64-bit ID generation with coordinated node-ID leases.
//!
//! `easyflake` generates locally, without a central allocator on the hot
//! path, IDs that pack a scaled timestamp, a node identifier and an
//! intra-tick sequence counter:
//!
//! ```text
//! [ timestamp : T bits ][ node_id : N bits ][ sequence : S bits ]
//! ```
//!
//! IDs from one generator are strictly increasing; IDs from generators
//! with distinct node IDs never collide. The default layout spends 8 bits
//! on each of the node-ID and sequence sections, with millisecond
//! timestamps counted from 2023-02-08T12:24:00Z.
//!
//! # Quick start
//!
//! ```
//! use easyflake::EasyFlake;
//!
//! fn main() -> easyflake::Result<()> {
//!     let flake = EasyFlake::new(3u64)?;
//!     let id = flake.next_id()?;
//!     println!("generated {id}");
//!     Ok(())
//! }
//! ```
//!
//! # Node-ID coordination
//!
//! Fixed node IDs work while you can assign them by hand. Past that, a
//! [`NodeIdPool`] keeps a node ID leased for you in the background:
//!
//! * [`NodeIdPool::file`] coordinates processes on one host through a
//!   lock-protected file of expiring leases;
//! * [`NodeIdPool::rpc`] holds a lease against the gRPC lease server
//!   (`easyflake grpc` starts one).
//!
//! ```no_run
//! use easyflake::{EasyFlake, NodeIdPool};
//!
//! fn main() -> easyflake::Result<()> {
//!     let pool = NodeIdPool::rpc("localhost:50051", 8);
//!     let flake = EasyFlake::new(pool)?;
//!     println!("generated {}", flake.next_id()?);
//!     Ok(())
//! }
//! ```
//!
//! # Custom layouts
//!
//! ```
//! use easyflake::{EasyFlake, TimeScale};
//!
//! fn main() -> easyflake::Result<()> {
//!     let flake = EasyFlake::builder()
//!         .node_id_bits(10)
//!         .sequence_bits(12)
//!         .time_scale(TimeScale::Milli)
//!         .build(456u64)?;
//!     let (_timestamp, node_id, _sequence) = flake.decompose(flake.next_id()?);
//!     assert_eq!(node_id, 456);
//!     Ok(())
//! }
//! ```
//!
//! Construction validates the layout: widths must be at least one bit
//! each, a fixed node ID must fit its section, and the timestamp section
//! must cover at least a year of headroom within 64 bits.

#![warn(missing_docs)]

mod clock;
mod error;
mod flake;
mod node;
mod sequence;

pub mod cli;
pub mod proto;
pub mod server;

pub use clock::{ScaledClock, SystemTimeSource, TimeScale, TimeSource, MAX_SCALE};
pub use error::{Error, Result};
pub use flake::{EasyFlake, EasyFlakeBuilder, NodeIdSource, DEFAULT_EPOCH};
pub use node::{
    LeaseEvent, LeaseListener, LeaseSource, NodeIdPool, DEFAULT_TIMEOUT, INVALID_NODE_ID, LIFESPAN,
};
pub use sequence::{SequencePool, TimeSequence, TimeSequenceProvider};
