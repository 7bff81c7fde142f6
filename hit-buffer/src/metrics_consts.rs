pub const HITS_BUFFERED: &str = "hit_buffer_hits_buffered";
pub const HITS_DRAINED: &str = "hit_buffer_hits_drained";
pub const HITS_PERSISTED: &str = "hit_buffer_hits_persisted";
pub const HITS_SKIPPED: &str = "hit_buffer_hits_skipped";
pub const HITS_DROPPED: &str = "hit_buffer_hits_dropped";
pub const BUFFER_SIZE: &str = "hit_buffer_size";
pub const FLUSH_TIME: &str = "hit_buffer_flush_time_ms";
pub const FLUSH_BATCH_SIZE: &str = "hit_buffer_flush_batch_size";
pub const FLUSH_FAILED: &str = "hit_buffer_flush_failed";
pub const BULK_STATEMENTS: &str = "hit_buffer_bulk_statements";
pub const IMPORT_LINES_INVALID: &str = "hit_buffer_import_lines_invalid";
pub const SESSIONS_PRUNED: &str = "hit_buffer_sessions_pruned";
