//! CLI command implementations.

pub mod backoff;
pub mod dump_journal;
pub mod inspect;
pub mod simulate;
