//! # glomer-node
//!
//! A broadcast node driven over stdin/stdout by a cluster test harness.
//!
//! ## Protocol
//!
//! One JSON envelope per line (newline-delimited JSON), in both directions:
//!
//! ```json
//! {"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 1, "message": 5}}
//! ```
//!
//! The harness first sends `init` to assign the node identity and the
//! cluster membership. Logs go to stderr so stdout stays a clean protocol
//! channel.

pub mod config;
pub mod error;
pub mod stdio;

pub use config::{ConfigOverrides, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use stdio::{StdioTransport, serve};
