#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

#[macro_use]
pub mod helpers;
pub mod entry;
pub(crate) mod segment;
pub mod store;
pub mod wal;

pub use entry::Entry;
pub use store::Store;
pub use wal::{Config, Wal, WalStats};
