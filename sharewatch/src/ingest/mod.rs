// sharewatch/src/ingest/mod.rs
//
// Access-log intake: line parsing and the accumulated buffer.

pub mod accumulator;
pub mod record;
