//! Lock coordination service: shared and exclusive locks on named resources,
//! served over TCP.
//!
//! - [`lock`] holds the fair readers/writer lock table and the lock manager.
//! - [`session`] binds each client to a dedicated worker task; that worker is
//!   the only place a request ever waits for a lock.
//! - [`broker`] accepts connections and routes request and reply lines
//!   between clients and their workers without blocking.
//! - [`protocol`] parses and formats the line-based wire protocol.
//! - [`store`] persists critical-section payloads per resource.
//! - [`client`] is a small request/reply client plus the CLI client flow.
//! - [`cli`], [`config`] and [`error`] cover process startup and errors.
//!
//! Integration tests drive the broker over real sockets.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod protocol;
pub mod session;
pub mod store;
