//! Document rewriting passes. Each pass edits a loaded [`DocumentTree`]
//! in place and reports what it did.
//!
//! [`DocumentTree`]: crate::docx::document::DocumentTree

pub mod fields;
pub mod segments;
pub mod substitute;
pub mod textbox;
pub mod zones;

pub use fields::refresh_fields;
pub use segments::{prune_empty, substitute_segments, Pruned};
pub use substitute::{substitute, Substitution};
pub use textbox::{blank_raw_matches, substitute_raw, RawOutcome, RawReplacements};
pub use zones::{find_zones, remove_absent_zones, strip_markers, UnmatchedStart, Zone};
