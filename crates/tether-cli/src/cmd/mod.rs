pub mod baseline;
pub mod dedup;
pub mod sync;
