//! Fixed phrase banks and the deterministic picker that chooses between them.
//!
//! Selection is a stable hash of a seed string, so the same focus always yields the
//! same wording across restarts while different topics or turns get variety.

use sha2::{Digest, Sha256};

pub const SCAFFOLD_EARLY: &[&str] = &[
    "Let's go slow. First, say what the story is about.",
    "We can do this together. First, point to the numbers you see.",
    "Let's start small. First, tell me what the problem wants.",
    "Take a breath. Begin by saying the problem in your own words.",
];

pub const SCAFFOLD_STANDARD: &[&str] = &[
    "Let's take this one step at a time. First, identify what the problem is asking for.",
    "Start by restating the problem in your own words. Then list the quantities you are given.",
    "Begin with what you know. First, name the information the problem gives you.",
    "Let's build a plan before working. First, decide what the question wants you to find.",
];

pub const FORWARD_QUESTIONS: &[&str] = &[
    "What would you try next?",
    "What is the next small step you could take?",
    "Which part of the problem do you want to look at next?",
    "What do you notice about the numbers in the problem?",
];

pub const REFLECTIVE_QUESTIONS: &[&str] = &[
    "How could you check that this step makes sense?",
    "What part of the problem tells you that?",
    "How would you explain this step to a friend?",
    "What makes you confident about this step?",
];

pub const REFLECTIVE_OPTION_QUESTIONS: &[&str] = &[
    "Which option fits this step, and why?",
    "Which choice matches the story in the problem?",
    "Which of these would you pick first?",
];

pub const REVIEW_PREFIXES: &[&str] = &[
    "🔍 Let's look at that again.",
    "🔍 Let's double-check that together.",
    "🔍 Take another look at your work.",
    "🔍 Let's review how you got there.",
];

pub const AFFIRMATION_PREFIX: &str = "✅ Try it.";

/// Picks a phrase from `bank` by hashing `seed`. Empty banks yield an empty string.
pub fn pick<'a>(bank: &[&'a str], seed: &str) -> &'a str {
    if bank.is_empty() {
        return "";
    }

    bank[index_for(seed, bank.len())]
}

/// Like [`pick`], but steps past `avoid` (case-insensitive) when the hashed choice equals it.
pub fn pick_distinct<'a>(bank: &[&'a str], seed: &str, avoid: &str) -> &'a str {
    if bank.is_empty() {
        return "";
    }

    let start = index_for(seed, bank.len());
    let avoid = avoid.trim();
    (0..bank.len())
        .map(|offset| bank[(start + offset) % bank.len()])
        .find(|candidate| !candidate.eq_ignore_ascii_case(avoid))
        .unwrap_or(bank[start])
}

pub fn stable_hash(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn index_for(seed: &str, len: usize) -> usize {
    (stable_hash(seed) % len as u64) as usize
}
