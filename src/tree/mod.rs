//! The tree: page model, cache-backed locking, descents, cursors and the
//! deferred balancer.

mod balancer;
mod cursor;
mod descent;
mod locker;
mod options;
mod order;
mod page;
mod sheaf;
mod stats;
mod strata;

#[cfg(test)]
mod tests;

pub use cursor::Cursor;
pub use descent::{Descent, Direction, Stop};
pub use locker::Locker;
pub use options::StrataOptions;
pub use order::{Bytewise, Comparator, Delimited, Extractor, Order, Whole};
pub use page::{Address, Item, Page, Payload};
pub use stats::{StrataStats, StrataStatsSnapshot};
pub use strata::{Shape, Strata};
