//! Group messaging over multicast.
//!
//! Each group talks on its own multicast address, drawn from a fixed pool; all
//! groups share one port. Invites travel on the discovery channel instead, since
//! invitees are not listening to the group's address yet.

mod allocator;
pub use allocator::*;

mod broadcast;
pub use broadcast::*;

mod service;
pub use service::*;
