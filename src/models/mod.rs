//! Records exchanged between peers, and their wire representations.
//!
//! Every payload is a newline-free JSON object whose field names are fixed by the
//! protocol; the Rust names differ where the wire names are unclear, and are
//! mapped with `serde` renames.

mod group;
pub use group::*;

mod message;
pub use message::*;

mod peer;
pub use peer::*;
