//! gpusched-store: Job output storage
//!
//! Every job gets its own directory under the output root holding
//! `stdout.txt` and `stderr.txt`. Directories are created at launch
//! and never deleted by the scheduler.

pub mod output;

pub use output::{tail_lines, JobOutput, OutputStore};
