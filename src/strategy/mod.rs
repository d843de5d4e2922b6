//! Entry strategy
//!
//! - `scanner` - candidate sources and the scoring seam
//! - `admission` - capital split and entry submission per scan cycle

pub mod admission;
pub mod scanner;

pub use admission::{allocate, in_blackout, rank, AdmissionController, Allocation, CycleOutcome, ScanBackoff};
pub use scanner::{Candidate, CandidateSource, RandomScorer, ScoreCandidate, UniverseScanner, Verdict};
