//! Trace-chunk record parsing and the multi-threaded reader-ahead (C9) used
//! by the trace-driven replay driver (C7).

pub mod reader_ahead;
pub mod record;

pub use reader_ahead::{chunk_count, chunk_path, TraceReaderAhead};
pub use record::{parse_reformatted_line, parse_trace_line, RecordParseError};
