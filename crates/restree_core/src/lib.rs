//! # restree core
//!
//! Persistent, typed resource-tree engine.
//!
//! This crate provides:
//! - A schema-checked tree of resources with typed leaf values, decorators,
//!   resource lists and references
//! - A virtual overlay: every schema-declared path can be navigated before it
//!   exists, and deleted resources stay navigable with their last value
//! - Generation-based persistence (structure snapshots plus an append-only
//!   value log) with crash recovery and compaction
//! - A re-entrant resource lock, nested transactions and rollbackable
//!   composite actions
//! - Change notification through channels and listeners
//!
//! ```rust
//! use restree_core::schema::{builtin, SchemaRegistry, TypeDef};
//! use restree_core::ResourceDb;
//!
//! let mut schema = SchemaRegistry::new();
//! schema
//!     .register(TypeDef::new("Room").slot("temperature", builtin::FLOAT))
//!     .unwrap();
//! let db = ResourceDb::open_in_memory(schema).unwrap();
//! let app = db.session("climate");
//!
//! let room = app.add_resource("kitchen", "Room").unwrap();
//! let temperature = room.child("temperature").unwrap().unwrap();
//! assert!(!temperature.exists());
//!
//! temperature.create().unwrap();
//! temperature.set_float(21.5).unwrap();
//! assert_eq!(temperature.float().unwrap(), 21.5);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod change_feed;
mod codec;
pub mod config;
mod database;
#[cfg(feature = "std")]
mod dir;
pub mod element;
pub mod error;
pub mod index;
pub mod lock;
pub mod overlay;
pub mod persistence;
mod resource;
pub mod schema;
mod stats;
pub mod transaction;
pub mod types;
pub mod value;

pub use change_feed::{
    ChangeFeed, Dispatched, EventKind, ListenerError, ListenerId, ResourceEvent, ResourceListener,
};
pub use config::Config;
pub use database::{NodeInfo, ResourceDb};
#[cfg(feature = "std")]
pub use dir::DatabaseDir;
pub use error::{CoreError, CoreResult};
pub use persistence::{FlushOutcome, GenerationInfo, RecoveryReport};
pub use resource::{AccessPolicy, AllowAll, Operation, Resource, Session};
pub use schema::{SchemaRegistry, TypeDef};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use transaction::{AtomicAction, ResourceTransaction, WritePolicy};
pub use types::{AccessMode, FlushSequence, Generation, ResourceId, TypeKey, NO_TIMESTAMP};
pub use value::Value;
