//! Fingerprint-keyed cache of verified fixes.
//!
//! - `PatternMatcher`: exact then fuzzy lookup against a confidence threshold
//! - `PatternExtractor`: records a new pattern after a verified fix
//! - `PatternLearner`: EMA success-rate updates and retirement
//!
//! Extraction and learning are no-ops unless learning mode is enabled.

mod extractor;
mod learner;
mod library;
mod matcher;

pub use extractor::{ExtractInput, PatternExtractor};
pub use learner::{LearnOutcome, LearningEvent, PatternLearner};
pub use library::{LIBRARY_VERSION, LibraryMetadata, Pattern, PatternLibrary, PatternLibraryStore};
pub use matcher::{MatchStrategy, PatternMatch, PatternMatcher};
