//! Miscellaneous common structs used throughout the library.

mod closest_nodes;
mod contact;
mod id;
pub mod messages;
mod prefix;

pub use closest_nodes::*;
pub use contact::*;
pub use id::*;
pub use messages::*;
pub use prefix::*;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 8;
