//! Zenoh bridge for Siemens S7 data blocks.
//!
//! Clients subscribe to typed addresses inside the PLC's data blocks and
//! receive a JSON snapshot of all their values whenever one of them changes.
//! They can also write values back.
//!
//! # Key Expressions
//!
//! ```text
//! s7bridge/commands   inbound requests (subscribe, unsubscribe, write)
//! s7bridge/response   snapshots and error replies
//! s7bridge/status     bridge lifecycle
//! ```
//!
//! The `s7bridge` prefix is configurable.
//!
//! # Wire Format
//!
//! ```text
//! {"command":"subscribe","dbs":[{"id":"A","address":{"db":1,"byte":0,"bit":0},"valueType":"bool"}]}
//! {"dbs":[{"id":"A","address":{"db":1,"byte":0,"bit":0},"valueType":"bool","value":true}]}
//! invalid request: <original text>
//! ```
//!
//! Value types are `bool` (one bit), `byte` (unsigned 8-bit) and `int`
//! (signed 16-bit, big-endian).

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod registry;

pub use bridge::Bridge;
pub use error::{BridgeError, Result};
