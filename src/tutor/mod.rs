pub mod grade;
pub mod memory;
pub mod phrases;
pub mod rewrite;

use std::sync::LazyLock;

use regex::Regex;

pub use grade::{band, GradeBand};
pub use memory::{InMemorySessionStore, SessionKey, SessionRecord, SessionStore};
pub use rewrite::{Rewriter, TurnContext};

static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\s*[-−]?\d+(?:[.,]\d+)?(?:\s*/\s*\d+)?\s*$"));

/// True when the learner's turn is nothing but a candidate answer like `14`, `-2.5` or `3/4`.
pub fn is_bare_number(message: &str) -> bool {
    BARE_NUMBER.is_match(message)
}

/// Compiles a pattern known at build time. A bad pattern degrades to one that only
/// matches the empty string, so enforcement passes text through instead of failing.
pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|_| Regex::new("^$").unwrap())
}
