pub mod differ;

pub use differ::{diff_features, DiffEntry, DiffRecord};
