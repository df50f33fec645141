//! Persistence layer - JSON documents for the three tables

mod store;

pub use store::{CreditChange, Store};
