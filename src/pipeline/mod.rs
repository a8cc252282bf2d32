mod bulk;
mod single;
mod table;

pub use bulk::{
    bulk_file_name, sanitize_file_name, BulkOptions, BulkOutput, BulkReport, BulkStatus,
    RowOutcome, RowStatus, DEFAULT_ARCHIVE_NAME,
};
pub use single::{find_placeholders, log_placeholders, Rendered, SynthesizedDocument, Synthesizer};
pub use table::{decode_table, Table};
