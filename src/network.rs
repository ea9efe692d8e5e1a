//! Container network fabric
//!
//! Provides:
//! - Bridge lifecycle
//! - Veth pairs connecting containers to the bridge
//! - Namespace handles for container network stacks
//! - Link state tracking for veth pairs
//! - Attach/detach of container addresses
//! - NAT masquerading for fabric traffic

pub mod attach;
pub mod bridge;
pub mod ip;
pub mod link;
pub mod masquerade;
pub mod netns;
pub mod veth;

pub use attach::Attacher;
pub use bridge::Bridge;
pub use masquerade::Masquerade;
