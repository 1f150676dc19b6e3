//! Formats the broker's own operational events as GELF records and
//! head-inserts them into the queue, so they overtake any
//! buffered producer traffic once upstream recovers.

use crate::gelf::RecordBuilder;
use crate::queue::Queue;

pub const FACILITY: &str = "gelf-broker";

/// Emit a self-log record at the given level and insert it at the head of
/// `queue`.
pub fn emit(queue: &mut Queue, level_name: &str, message: impl Into<String>) {
    let record = RecordBuilder::new()
        .facility(FACILITY)
        .level_name(level_name)
        .field("pid", std::process::id())
        .message(message)
        .build();
    let bytes = serde_json::to_vec(&record).expect("GELF self-log record is always valid JSON");
    queue.push_head(bytes);
}
