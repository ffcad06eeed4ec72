//! Output enforcement: turns one raw completion into a compliant tutoring reply.
//!
//! The rewrite is a fixed list of named stages run in order. Order matters:
//! operation phrasing is softened before symbols are masked, the lesson/question split
//! feeds repetition suppression, and the exact-repeat check hashes the final text.
//! Every stage is total; a pattern that does not match leaves the text as it was.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};

use super::compile;
use super::grade::GradeBand;
use super::memory::{signature, InMemorySessionStore, SessionKey, SessionStore};
use super::phrases::{
    pick, pick_distinct, AFFIRMATION_PREFIX, FORWARD_QUESTIONS, REFLECTIVE_OPTION_QUESTIONS,
    REFLECTIVE_QUESTIONS, REVIEW_PREFIXES, SCAFFOLD_EARLY, SCAFFOLD_STANDARD,
};
use crate::models::{Judgment, Level};

const REVEAL_LEAD_IN: &str = "What makes you confident in that step?";
const MASK: &str = "…";

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?s)^```[a-zA-Z]*\n(.*)\n```$"));
static JUDGMENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?i)\[\[\s*(plausible|check)\s*\]\]"));

static CONFIRMATION_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:(?:that's|that is|you're|you are|it's|it is|you got it|you got that)\s+(?:exactly\s+|absolutely\s+|totally\s+|completely\s+)?(?:right|correct)|well done|great job|good job|nice work|nailed it|spot on|you got it)\b[!.]?",
    )
});
static CONFIRMATION_WORD: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:correct|correctly|incorrect|incorrectly|right|wrong|exactly|perfect|perfectly)\b(\s+(?:angles?|triangles?|sides?|prisms?))?",
    )
});
static ANSWER_REVEAL: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:the (?:final |correct )?answer (?:is|would be)|the solution is|so the answer|therefore|thus|hence|equals)\b",
    )
});

static OPERATION_CLAUSES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            compile(r"(?i)\bsubtract(?:ing)?\s+(\S+(?:\s+\S+)?)\s+from\s+([^\s.,;!?]+)"),
            "find the difference between $2 and $1",
        ),
        (
            compile(r"(?i)\btake\s+(\S+)\s+away\s+from\s+([^\s.,;!?]+)"),
            "find the difference between $2 and $1",
        ),
        (
            compile(r"(?i)\badd(?:ing)?\s+(\S+)\s+(?:and|to)\s+([^\s.,;!?]+)"),
            "combine $1 and $2",
        ),
        (
            compile(r"(?i)\bmultiply(?:ing)?\s+(\S+)\s+(?:by|and|times)\s+([^\s.,;!?]+)"),
            "scale $1 by $2",
        ),
        (
            compile(r"(?i)\bdivid(?:e|ing)\s+(\S+)\s+(?:by|into)\s+([^\s.,;!?]+)"),
            "compare $1 to $2 as a rate",
        ),
        (
            compile(r"(?i)\b(\d+(?:\.\d+)?)\s+minus\s+(\d+(?:\.\d+)?)\b"),
            "the difference between $1 and $2",
        ),
        (
            compile(r"(?i)\b(\d+(?:\.\d+)?)\s+plus\s+(\d+(?:\.\d+)?)\b"),
            "$1 combined with $2",
        ),
        (
            compile(r"(?i)\b(\d+(?:\.\d+)?)\s+times\s+(\d+(?:\.\d+)?)\b"),
            "$1 scaled by $2",
        ),
        (
            compile(r"(?i)\b(\d+(?:\.\d+)?)\s+divided\s+by\s+(\d+(?:\.\d+)?)\b"),
            "$1 compared to $2 as a rate",
        ),
    ]
});

static OPERATION_WORDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    word_table(&[
        ("adding", "combining"),
        ("added", "combined"),
        ("add", "combine"),
        ("subtracting", "taking away"),
        ("subtracted", "taken away"),
        ("subtract", "take away"),
        ("multiplying", "scaling"),
        ("multiplied", "scaled"),
        ("multiply", "scale"),
        ("dividing", "comparing as a rate"),
        ("divided", "compared as a rate"),
        ("divide", "compare as a rate"),
        ("plus", "combined with"),
        ("minus", "take away"),
    ])
});

static EARLY_VOCABULARY: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    word_table(&[
        ("determine", "find"),
        ("quantities", "amounts"),
        ("quantity", "amount"),
        ("calculate", "figure out"),
        ("approximately", "about"),
        ("represents", "shows"),
        ("represent", "show"),
        ("identify", "find"),
        ("equivalent", "the same"),
        ("additional", "more"),
        ("remaining", "left"),
        ("evaluate", "check"),
        ("estimate", "guess"),
    ])
});

static MARKDOWN_BOLD: LazyLock<Regex> = LazyLock::new(|| compile(r"\*\*([^*]+)\*\*"));
static MARKDOWN_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(^|[^\w*])\*([A-Za-z][^*\n]*[A-Za-z]|[A-Za-z])\*"));
static STAR_BULLET: LazyLock<Regex> = LazyLock::new(|| compile(r"(?m)^(\s*)\*\s+"));
static LATEX_FRACTION: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\\d?frac\{[^}]*\}\{[^}]*\}"));
static LATEX_DELIMITER: LazyLock<Regex> = LazyLock::new(|| compile(r"\\[()\[\]]"));
static COORDINATE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"\(\s*[-−]?\d+(?:\.\d+)?\s*,\s*[-−]?\d+(?:\.\d+)?\s*\)")
});
static FRACTION: LazyLock<Regex> = LazyLock::new(|| compile(r"\b\d+\s*/\s*\d+\b"));
static DIGIT_MINUS: LazyLock<Regex> = LazyLock::new(|| compile(r"(\d)\s*[-−–]\s*(\d)"));
static OPERATOR: LazyLock<Regex> = LazyLock::new(|| compile(r"\s*[+=^×÷*·≠≤≥]+\s*"));
static MASK_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"…(?:\s*…)+"));

static SCAFFOLD_CUES: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?i)\b(?:first|then|start|starting|begin|step|steps)\b"));

static OPERATION_VOCAB: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:add|adding|added|addition|subtract\w*|minus|plus|combin\w*|take away|difference|sum|multipl\w*|times|product|divid\w*|division|quotient|rate|scal(?:e|ed|ing))\b",
    )
});
static ADDITIVE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)\b(?:fewer|less|difference|left|more than|altogether|in all|remain\w*|take away|gives? away|gave away|giving away)\b",
    )
});
static MULTIPLICATIVE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"(?i)\b(?:per|each|rate|every|groups? of|times as|shares?|shared|split|equally)\b")
});

static OPTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\s*(?:[A-Da-d][).:]|[-•])\s+\S"));
static INLINE_OPTIONS: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?:^|\s)A\)\s*\S[^\n]*\sB\)\s*\S"));
static INLINE_OPTION_MARK: LazyLock<Regex> = LazyLock::new(|| compile(r"[ \t][B-D]\)"));
static OPTION_TRAILER: LazyLock<Regex> = LazyLock::new(|| compile(r"[.!?]\s+\S"));

static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| compile(r"[ \t]+"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> = LazyLock::new(|| compile(r"[ \t]+([.,!?;:])"));
static PUNCT_AFTER_TERMINATOR: LazyLock<Regex> =
    LazyLock::new(|| compile(r"([.!?])[ \t]*[,;:]+"));
static COMMA_BEFORE_TERMINATOR: LazyLock<Regex> = LazyLock::new(|| compile(r",\s*([.!?])"));
static LEADING_PUNCT: LazyLock<Regex> = LazyLock::new(|| compile(r"^[\s,;:.!]+"));

/// Everything a rewrite needs to know about the turn besides the raw text.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub key: SessionKey,
    pub band: GradeBand,
    /// The learner's message was only a number, i.e. a candidate answer.
    pub bare_number: bool,
    /// Judgment delivered on a structured channel; wins over any in-text tag.
    pub structured_judgment: Option<Judgment>,
}

impl TurnContext {
    pub fn new(level: &str, focus: &str, grade: &str, identity: &str, bare_number: bool) -> Self {
        Self {
            key: SessionKey::new(level, focus, grade, identity),
            band: GradeBand::classify(grade),
            bare_number,
            structured_judgment: None,
        }
    }

    pub fn with_judgment(mut self, judgment: Option<Judgment>) -> Self {
        self.structured_judgment = judgment;
        self
    }

    fn level(&self) -> Level {
        self.key.level
    }

    fn focus(&self) -> &str {
        &self.key.focus
    }
}

#[derive(Clone)]
pub struct Rewriter {
    store: Arc<dyn SessionStore>,
}

impl Rewriter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn rewrite(
        &self,
        raw_text: &str,
        level: &str,
        focus: &str,
        grade: &str,
        identity: &str,
        user_submitted_bare_number: bool,
    ) -> String {
        let turn = TurnContext::new(level, focus, grade, identity, user_submitted_bare_number);
        self.rewrite_turn(raw_text, &turn)
    }

    pub fn rewrite_turn(&self, raw_text: &str, turn: &TurnContext) -> String {
        let env = StageEnv {
            turn,
            store: self.store.as_ref(),
        };
        let mut draft = Draft::new(raw_text);

        for (name, stage) in PIPELINE {
            stage(&mut draft, &env);
            tracing::debug!(stage = name, chars = draft.text.chars().count(), "rewrite stage");
        }

        draft.text
    }
}

struct Draft {
    text: String,
    /// Completion text before any rewriting, tags removed.
    original: String,
    judgment: Judgment,
    lesson: String,
    question: String,
    tail: String,
}

impl Draft {
    fn new(raw: &str) -> Self {
        let text = strip_code_fence(raw);
        Self {
            original: text.clone(),
            text,
            judgment: Judgment::Uncertain,
            lesson: String::new(),
            question: String::new(),
            tail: String::new(),
        }
    }
}

struct StageEnv<'a> {
    turn: &'a TurnContext,
    store: &'a dyn SessionStore,
}

type Stage = fn(&mut Draft, &StageEnv<'_>);

const PIPELINE: [(&str, Stage); 13] = [
    ("extract_judgment_tag", extract_judgment_tag),
    ("strip_confirmation_language", strip_confirmation_language),
    ("soften_operation_phrasing", soften_operation_phrasing),
    ("mask_symbols", mask_symbols),
    ("split_lesson_and_question", split_lesson_and_question),
    ("suppress_repeated_lesson", suppress_repeated_lesson),
    ("inject_scaffold", inject_scaffold),
    ("simplify_vocabulary", simplify_vocabulary),
    ("enforce_operation_choice", enforce_operation_choice),
    ("limit_sentences", limit_sentences),
    ("frame_answer_judgment", frame_answer_judgment),
    ("ensure_question", ensure_question),
    ("avoid_exact_repeat", avoid_exact_repeat),
];

fn extract_judgment_tag(draft: &mut Draft, env: &StageEnv<'_>) {
    let tagged = JUDGMENT_TAG
        .captures_iter(&draft.text)
        .filter_map(|caps| caps.get(1).and_then(|m| Judgment::parse(m.as_str())))
        .last();

    draft.judgment = env
        .turn
        .structured_judgment
        .or(tagged)
        .unwrap_or(Judgment::Uncertain);
    draft.text = tidy(&JUDGMENT_TAG.replace_all(&draft.text, " "));
    draft.original = draft.text.clone();
}

fn strip_confirmation_language(draft: &mut Draft, _env: &StageEnv<'_>) {
    draft.text = map_lines(&draft.text, |line| {
        split_sentences(line)
            .into_iter()
            .filter_map(|sentence| {
                if ANSWER_REVEAL.is_match(&sentence) {
                    return Some(REVEAL_LEAD_IN.to_string());
                }

                let stripped = strip_confirmations(&sentence);
                // "Is that right?" loses its point once "right" is gone.
                if stripped != sentence && word_count(&stripped) < 3 && ends_sentence(&sentence)
                {
                    return None;
                }
                Some(stripped)
            })
            .filter(|sentence| !sentence.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    });
}

fn soften_operation_phrasing(draft: &mut Draft, _env: &StageEnv<'_>) {
    let mut text = draft.text.clone();
    for (pattern, replacement) in OPERATION_CLAUSES.iter() {
        text = pattern
            .replace_all(&text, |caps: &Captures<'_>| {
                let mut expanded = String::new();
                caps.expand(replacement, &mut expanded);
                match_case(&caps[0], &expanded)
            })
            .into_owned();
    }
    draft.text = apply_word_table(&text, &OPERATION_WORDS);
}

fn mask_symbols(draft: &mut Draft, _env: &StageEnv<'_>) {
    let mut text = MARKDOWN_BOLD.replace_all(&draft.text, "$1").into_owned();
    text = MARKDOWN_ITALIC.replace_all(&text, "$1$2").into_owned();
    text = STAR_BULLET.replace_all(&text, "$1- ").into_owned();
    text = LATEX_FRACTION.replace_all(&text, MASK).into_owned();
    text = LATEX_DELIMITER.replace_all(&text, " ").into_owned();
    text = COORDINATE.replace_all(&text, "that point").into_owned();
    text = FRACTION.replace_all(&text, MASK).into_owned();

    // Chains like 9-4-1 need more than one pass since each match consumes a digit.
    for _ in 0..4 {
        if !DIGIT_MINUS.is_match(&text) {
            break;
        }
        text = DIGIT_MINUS.replace_all(&text, "$1 … $2").into_owned();
    }

    text = OPERATOR.replace_all(&text, " … ").into_owned();
    text = MASK_RUN.replace_all(&text, MASK).into_owned();
    draft.text = tidy(&text);
}

fn split_lesson_and_question(draft: &mut Draft, _env: &StageEnv<'_>) {
    let parts = ReplyParts::split_reply(&draft.text);
    draft.lesson = parts.lesson;
    draft.question = parts.question;
    draft.tail = parts.tail;
}

fn suppress_repeated_lesson(draft: &mut Draft, env: &StageEnv<'_>) {
    let current = normalize_for_compare(&draft.lesson);
    if current.is_empty() {
        return;
    }

    let previous = normalize_for_compare(&env.store.last_micro_lesson(&env.turn.key));
    if current != previous {
        env.store.remember_micro_lesson(&env.turn.key, &draft.lesson);
        return;
    }

    tracing::debug!(session = %env.turn.key.fingerprint(), "dropping repeated micro-lesson");
    // An options block already asks for a choice; it stands in for the question.
    let question = if draft.question.is_empty() && !has_options_block(&draft.tail) {
        pick(FORWARD_QUESTIONS, env.turn.focus()).to_string()
    } else {
        draft.question.clone()
    };
    draft.lesson.clear();
    draft.question = question;
    draft.text = ReplyParts {
        lesson: String::new(),
        question: draft.question.clone(),
        tail: draft.tail.clone(),
    }
    .join();
}

fn inject_scaffold(draft: &mut Draft, env: &StageEnv<'_>) {
    if env.turn.level() != Level::Apprentice || SCAFFOLD_CUES.is_match(&draft.text) {
        return;
    }

    let bank = if env.turn.band.is_early() {
        SCAFFOLD_EARLY
    } else {
        SCAFFOLD_STANDARD
    };
    let scaffold = pick(bank, env.turn.focus());
    draft.text = format!("{scaffold} {}", draft.text).trim().to_string();
}

fn simplify_vocabulary(draft: &mut Draft, env: &StageEnv<'_>) {
    if env.turn.band.is_early() {
        draft.text = apply_word_table(&draft.text, &EARLY_VOCABULARY);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationChoice {
    AddOrSubtract,
    MultiplyOrDivide,
    AnyOperation,
}

impl OperationChoice {
    fn infer(focus: &str, text: &str) -> Self {
        for probe in [focus, text] {
            if ADDITIVE_HINT.is_match(probe) {
                return OperationChoice::AddOrSubtract;
            }
            if MULTIPLICATIVE_HINT.is_match(probe) {
                return OperationChoice::MultiplyOrDivide;
            }
        }
        OperationChoice::AnyOperation
    }

    fn questions(self) -> &'static [&'static str] {
        match self {
            OperationChoice::AddOrSubtract => &[
                "Should we combine the amounts or find the difference?",
                "Does this step call for combining or for finding what is left?",
            ],
            OperationChoice::MultiplyOrDivide => &[
                "Should we scale by the number of groups or compare as a rate?",
                "Does this step call for scaling up or for splitting into equal groups?",
            ],
            OperationChoice::AnyOperation => &[
                "Which move fits this step best?",
                "Which move would push this problem forward?",
            ],
        }
    }

    fn options(self) -> &'static str {
        match self {
            OperationChoice::AddOrSubtract => "A) Combine the amounts\nB) Find the difference",
            OperationChoice::MultiplyOrDivide => {
                "A) Scale by the number of groups\nB) Compare as a rate"
            }
            OperationChoice::AnyOperation => {
                "A) Combine the amounts\nB) Find the difference\nC) Scale by the number of groups\nD) Compare as a rate"
            }
        }
    }
}

fn enforce_operation_choice(draft: &mut Draft, env: &StageEnv<'_>) {
    if !OPERATION_VOCAB.is_match(&draft.original) && !OPERATION_VOCAB.is_match(&draft.text) {
        return;
    }

    let choice = OperationChoice::infer(env.turn.focus(), &draft.original);
    let question = pick(choice.questions(), env.turn.focus());
    let (prose, existing) = split_options(&draft.text);
    let parts = ReplyParts::split(&prose);

    let lesson = format!("{} {}", parts.lesson, parts.tail).trim().to_string();
    let options = if existing.is_empty() {
        choice.options().to_string()
    } else {
        existing.join("\n")
    };

    draft.text = ReplyParts {
        lesson,
        question: question.to_string(),
        tail: options,
    }
    .join();
}

fn limit_sentences(draft: &mut Draft, env: &StageEnv<'_>) {
    let reserved = usize::from(env.turn.bare_number);
    let cap = env
        .turn
        .band
        .max_sentences()
        .saturating_sub(reserved)
        .max(1);

    let (prose, options) = split_options(&draft.text);
    let sentences = split_sentences(&prose);
    let last_question = sentences.iter().rposition(|s| s.contains('?'));

    let mut kept: Vec<String> = sentences.iter().take(cap).cloned().collect();
    // The closing question is the one that matters; never cut it for an earlier one.
    if let Some(index) = last_question.filter(|index| *index >= cap) {
        kept.truncate(cap - 1);
        kept.push(sentences[index].clone());
    }

    if !kept.iter().any(|s| s.contains('?')) && options.is_empty() {
        kept.truncate(cap - 1);
        kept.push(pick(FORWARD_QUESTIONS, env.turn.focus()).to_string());
    }

    if let Some(keep_at) = kept.iter().rposition(|s| s.contains('?')) {
        for (index, sentence) in kept.iter_mut().enumerate() {
            *sentence = if index == keep_at {
                keep_last_question_mark(sentence)
            } else {
                sentence.replace('?', ".")
            };
        }
    }

    let mut text = kept.join(" ");
    if !options.is_empty() {
        let options: Vec<String> = options.iter().map(|line| line.replace('?', "")).collect();
        text = format!("{text}\n{}", options.join("\n")).trim().to_string();
    }
    draft.text = text;
}

fn frame_answer_judgment(draft: &mut Draft, env: &StageEnv<'_>) {
    if !env.turn.bare_number {
        return;
    }

    let body = strip_judgment_prefix(&draft.text);
    let prefix = match draft.judgment {
        Judgment::Plausible => AFFIRMATION_PREFIX,
        Judgment::Uncertain => pick(REVIEW_PREFIXES, &format!("review-{}", env.turn.focus())),
    };

    draft.text = if body.is_empty() {
        prefix.to_string()
    } else if OPTION_LINE.is_match(&body) {
        format!("{prefix}\n{body}")
    } else {
        format!("{prefix} {body}")
    };
}

fn ensure_question(draft: &mut Draft, env: &StageEnv<'_>) {
    if draft.text.contains('?') || has_options_block(&draft.text) {
        return;
    }

    let fallback = pick(FORWARD_QUESTIONS, env.turn.focus());
    draft.text = format!("{} {fallback}", draft.text).trim().to_string();
}

fn avoid_exact_repeat(draft: &mut Draft, env: &StageEnv<'_>) {
    let current = signature(&draft.text);
    let previous = env.store.last_reply_signature(&env.turn.key);

    if previous.as_deref() == Some(current.as_str()) {
        let parts = ReplyParts::split_reply(&draft.text);
        let bank = if has_options_block(&parts.tail) {
            REFLECTIVE_OPTION_QUESTIONS
        } else {
            REFLECTIVE_QUESTIONS
        };
        let seed = format!("repeat-{}-{current}", env.turn.focus());
        let alternate = pick_distinct(bank, &seed, &parts.question).to_string();

        tracing::debug!(session = %env.turn.key.fingerprint(), "replacing question of repeated reply");
        draft.text = ReplyParts {
            question: alternate,
            ..parts
        }
        .join();
    }

    env.store.remember_reply_signature(&env.turn.key, &draft.text);
}

/// A reply cut at its final question mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ReplyParts {
    /// Sentences before the one holding the final `?`.
    lesson: String,
    /// The sentence holding the final `?`, empty when there is none.
    question: String,
    /// Whatever follows the final `?`, usually an options block.
    tail: String,
}

impl ReplyParts {
    fn split(text: &str) -> Self {
        let Some(mark) = text.rfind('?') else {
            return Self {
                lesson: text.trim().to_string(),
                ..Self::default()
            };
        };

        let start = question_start(&text[..mark]);
        Self {
            lesson: text[..start].trim().to_string(),
            question: text[start..=mark].trim().to_string(),
            tail: text[mark + 1..].trim().to_string(),
        }
    }

    /// Like [`ReplyParts::split`], but an options block found anywhere in the reply is
    /// moved into `tail` so it never counts as lesson or question text.
    fn split_reply(text: &str) -> Self {
        let (prose, options) = split_options(text);
        let mut parts = Self::split(&prose);
        if !options.is_empty() {
            let options = options.join("\n");
            parts.tail = if parts.tail.is_empty() {
                options
            } else {
                format!("{}\n{options}", parts.tail)
            };
        }
        parts
    }

    fn join(&self) -> String {
        let mut text = [self.lesson.as_str(), self.question.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        if !self.tail.is_empty() {
            let separator = if has_options_block(&self.tail) {
                "\n"
            } else {
                " "
            };
            if text.is_empty() {
                text = self.tail.clone();
            } else {
                text = format!("{text}{separator}{}", self.tail);
            }
        }

        text
    }
}

/// Byte offset where the sentence ending at the end of `before` begins.
fn question_start(before: &str) -> usize {
    let mut next_is_space = false;
    for (index, c) in before.char_indices().rev() {
        if c == '\n' || (matches!(c, '.' | '!' | '?') && next_is_space) {
            return index + c.len_utf8();
        }
        next_is_space = c.is_whitespace();
    }
    0
}

/// Splits one run of prose into sentences. A terminator only ends a sentence when it is
/// followed by whitespace or the end of text, so decimals like `3.5` stay intact.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(if c == '\n' { ' ' } else { c });
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }

        while let Some(&next) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | '”' | '’') {
                current.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if chars.peek().map_or(true, |next| next.is_whitespace()) {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Number of prose sentences, not counting a trailing options block.
pub fn sentence_count(text: &str) -> usize {
    split_sentences(&split_options(text).0).len()
}

/// True when the text carries a run of at least two lettered or bulleted option lines,
/// or an inline `A) ... B) ...` run.
pub fn has_options_block(text: &str) -> bool {
    !split_options(text).1.is_empty()
}

/// Pulls the options block out of a reply, wherever it sits. The last run of two or
/// more option lines wins; failing that, an inline `A) ... B) ...` run is broken onto
/// one line per option. The remaining prose keeps its order.
fn split_options(text: &str) -> (String, Vec<String>) {
    let lines: Vec<&str> = text.lines().collect();

    let mut end = lines.len();
    while end > 0 {
        if !OPTION_LINE.is_match(lines[end - 1]) {
            end -= 1;
            continue;
        }

        let mut start = end - 1;
        while start > 0 && OPTION_LINE.is_match(lines[start - 1]) {
            start -= 1;
        }
        if end - start >= 2 {
            let prose = lines[..start]
                .iter()
                .chain(&lines[end..])
                .copied()
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            let options = lines[start..end]
                .iter()
                .map(|line| line.trim().to_string())
                .collect();
            return (prose, options);
        }
        end = start;
    }

    split_inline_options(text).unwrap_or_else(|| (text.trim().to_string(), Vec::new()))
}

fn split_inline_options(text: &str) -> Option<(String, Vec<String>)> {
    let found = INLINE_OPTIONS.find(text)?;
    let start = found.start() + (found.as_str().len() - found.as_str().trim_start().len());
    let line_end = text[start..].find('\n').map_or(text.len(), |offset| start + offset);
    let run = &text[start..line_end];

    let mut bounds = vec![0];
    bounds.extend(INLINE_OPTION_MARK.find_iter(run).map(|m| m.start() + 1));
    bounds.push(run.len());

    let mut options: Vec<String> = bounds
        .windows(2)
        .map(|pair| run[pair[0]..pair[1]].trim().to_string())
        .filter(|option| !option.is_empty())
        .collect();

    // "B) Draw it. Which feels easier?" keeps the sentence after the last option as prose.
    let mut trailing = String::new();
    if let Some(last) = options.last_mut() {
        if let Some(cut) = OPTION_TRAILER.find(last.as_str()).map(|m| m.start() + 1) {
            trailing = last[cut..].trim().to_string();
            last.truncate(cut);
        }
    }

    let prose = [text[..start].trim(), trailing.as_str(), text[line_end..].trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    Some((prose, options))
}

fn strip_code_fence(raw: &str) -> String {
    let text = raw.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }

    match CODE_FENCE.captures(text).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => text.replace("```", "").trim().to_string(),
    }
}

fn strip_confirmations(sentence: &str) -> String {
    let text = CONFIRMATION_PHRASE.replace_all(sentence, " ");
    let text = CONFIRMATION_WORD.replace_all(&text, |caps: &Captures<'_>| {
        // "right angle" and friends are geometry, not praise.
        if caps.get(1).is_some() {
            caps[0].to_string()
        } else {
            " ".to_string()
        }
    });
    if text == sentence {
        return sentence.to_string();
    }
    capitalize_first(&tidy(&text))
}

fn strip_judgment_prefix(text: &str) -> String {
    let mut body = text.trim_start();
    loop {
        let before = body;
        if let Some(rest) = body.strip_prefix(AFFIRMATION_PREFIX) {
            body = rest.trim_start();
        }
        for prefix in REVIEW_PREFIXES {
            if let Some(rest) = body.strip_prefix(prefix) {
                body = rest.trim_start();
            }
        }
        if before == body {
            return body.to_string();
        }
    }
}

fn keep_last_question_mark(sentence: &str) -> String {
    match sentence.rfind('?') {
        Some(last) => format!(
            "{}{}",
            sentence[..last].replace('?', "."),
            &sentence[last..]
        ),
        None => sentence.to_string(),
    }
}

fn word_table(pairs: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    pairs
        .iter()
        .map(|(word, replacement)| (compile(&format!(r"(?i)\b{word}\b")), *replacement))
        .collect()
}

fn apply_word_table(text: &str, table: &[(Regex, &'static str)]) -> String {
    let mut text = text.to_string();
    for (pattern, replacement) in table {
        text = pattern
            .replace_all(&text, |caps: &Captures<'_>| match_case(&caps[0], replacement))
            .into_owned();
    }
    text
}

/// Carries the capitalization of the first letter of `original` over to `replacement`.
fn match_case(original: &str, replacement: &str) -> String {
    if original.chars().next().is_some_and(char::is_uppercase) {
        capitalize_first(replacement)
    } else {
        replacement.to_string()
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn map_lines(text: &str, f: impl Fn(&str) -> String) -> String {
    text.lines()
        .map(f)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn tidy(text: &str) -> String {
    map_lines(text, |line| {
        let line = SPACE_RUN.replace_all(line, " ");
        let line = SPACE_BEFORE_PUNCT.replace_all(&line, "$1");
        let line = PUNCT_AFTER_TERMINATOR.replace_all(&line, "$1");
        let line = COMMA_BEFORE_TERMINATOR.replace_all(&line, "$1");
        if OPTION_LINE.is_match(&line) {
            line.trim().to_string()
        } else {
            LEADING_PUNCT.replace(&line, "").trim().to_string()
        }
    })
}

fn normalize_for_compare(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn word_count(text: &str) -> usize {
    text.split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .count()
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end().ends_with(['.', '!', '?'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> Rewriter {
        Rewriter::in_memory()
    }

    fn run_stage(stage: Stage, text: &str, turn: &TurnContext) -> String {
        let store = InMemorySessionStore::new();
        let env = StageEnv {
            turn,
            store: &store,
        };
        let mut draft = Draft::new(text);
        stage(&mut draft, &env);
        draft.text
    }

    fn turn(level: &str, grade: &str) -> TurnContext {
        TurnContext::new(level, "", grade, "token", false)
    }

    fn question_marks(text: &str) -> usize {
        text.matches('?').count()
    }

    #[test]
    fn judgment_tag_is_extracted_and_hidden() {
        let store = InMemorySessionStore::new();
        let ctx = turn("master", "6");
        let env = StageEnv {
            turn: &ctx,
            store: &store,
        };

        let mut draft = Draft::new("Nice thinking so far. [[ plausible ]]");
        extract_judgment_tag(&mut draft, &env);
        assert_eq!(draft.judgment, Judgment::Plausible);
        assert_eq!(draft.text, "Nice thinking so far.");

        let mut draft = Draft::new("Look again at the units.");
        extract_judgment_tag(&mut draft, &env);
        assert_eq!(draft.judgment, Judgment::Uncertain);

        let mut draft = Draft::new("[[PLAUSIBLE]] Hmm. [[CHECK]]");
        extract_judgment_tag(&mut draft, &env);
        assert_eq!(draft.judgment, Judgment::Uncertain);
        assert!(!draft.text.contains("[["));
    }

    #[test]
    fn structured_judgment_overrides_tag() {
        let store = InMemorySessionStore::new();
        let ctx = turn("master", "6").with_judgment(Some(Judgment::Plausible));
        let env = StageEnv {
            turn: &ctx,
            store: &store,
        };
        let mut draft = Draft::new("Keep going. [[CHECK]]");
        extract_judgment_tag(&mut draft, &env);
        assert_eq!(draft.judgment, Judgment::Plausible);
    }

    #[test]
    fn confirmation_language_is_removed() {
        let ctx = turn("master", "6");
        let out = run_stage(
            strip_confirmation_language,
            "Correct! Now look at the second row. You're exactly right about the units.",
            &ctx,
        );
        assert!(!out.to_lowercase().contains("correct"));
        assert!(!out.to_lowercase().contains("right"));
        assert!(!out.to_lowercase().contains("exactly"));
        assert!(out.starts_with("Now look at the second row."));
    }

    #[test]
    fn geometry_right_survives() {
        let ctx = turn("master", "6");
        let out = run_stage(
            strip_confirmation_language,
            "A right triangle has one square corner.",
            &ctx,
        );
        assert_eq!(out, "A right triangle has one square corner.");
    }

    #[test]
    fn untouched_sentences_keep_their_case_and_length() {
        let ctx = turn("master", "6");
        let out = run_stage(strip_confirmation_language, "Try the e.g. approach.", &ctx);
        assert_eq!(out, "Try the e.g. approach.");

        let out = run_stage(strip_confirmation_language, "x^2 grows fast. then compare.", &ctx);
        assert_eq!(out, "x^2 grows fast. then compare.");
    }

    #[test]
    fn answer_reveal_becomes_reflective_lead_in() {
        let ctx = turn("master", "6");
        let out = run_stage(
            strip_confirmation_language,
            "You found both groups. Therefore the total is 12.",
            &ctx,
        );
        assert_eq!(out, format!("You found both groups. {REVEAL_LEAD_IN}"));
        assert!(!out.contains("12"));
    }

    #[test]
    fn dangling_confirmation_question_is_dropped() {
        let ctx = turn("master", "6");
        let out = run_stage(strip_confirmation_language, "Look at row two. Is that right?", &ctx);
        assert_eq!(out, "Look at row two.");
    }

    #[test]
    fn clause_patterns_run_before_single_words() {
        let ctx = turn("master", "6");
        let out = run_stage(soften_operation_phrasing, "Subtract 5 from 12 first.", &ctx);
        assert_eq!(out, "Find the difference between 12 and 5 first.");

        let out = run_stage(soften_operation_phrasing, "Then add 3 and 4, or multiply them.", &ctx);
        assert_eq!(out, "Then combine 3 and 4, or scale them.");

        let out = run_stage(soften_operation_phrasing, "What is 9 minus 4?", &ctx);
        assert_eq!(out, "What is the difference between 9 and 4?");
    }

    #[test]
    fn softening_needs_words_that_masking_would_destroy() {
        let ctx = turn("master", "6");
        let store = InMemorySessionStore::new();
        let env = StageEnv {
            turn: &ctx,
            store: &store,
        };
        let mut draft = Draft::new("Think of 7 minus 2 here.");
        soften_operation_phrasing(&mut draft, &env);
        mask_symbols(&mut draft, &env);
        assert_eq!(draft.text, "Think of the difference between 7 and 2 here.");
    }

    #[test]
    fn symbols_fractions_and_points_are_masked() {
        let ctx = turn("master", "6");
        let out = run_stage(
            mask_symbols,
            "Try 3 + 4 = 7, then 2^3 and 3/4 at (3, 4) or 9-4-1.",
            &ctx,
        );
        assert!(!out.contains(['+', '=', '^']));
        assert!(!FRACTION.is_match(&out));
        assert!(!COORDINATE.is_match(&out));
        assert!(out.contains("that point"));
        assert!(!DIGIT_MINUS.is_match(&out));
    }

    #[test]
    fn markdown_is_not_mistaken_for_multiplication() {
        let ctx = turn("master", "6");
        let out = run_stage(mask_symbols, "**Hint:** look at the *units*.", &ctx);
        assert!(out.starts_with("Hint:"));
    }

    #[test]
    fn reply_parts_split_on_final_question() {
        let parts = ReplyParts::split("First, read it. Then compare. What do you notice?");
        assert_eq!(parts.lesson, "First, read it. Then compare.");
        assert_eq!(parts.question, "What do you notice?");
        assert!(parts.tail.is_empty());

        let parts = ReplyParts::split("No question here.");
        assert_eq!(parts.lesson, "No question here.");
        assert!(parts.question.is_empty());

        let parts = ReplyParts::split("Is it 3.5? Which fits?\nA) One\nB) Two");
        assert_eq!(parts.lesson, "Is it 3.5?");
        assert_eq!(parts.question, "Which fits?");
        assert_eq!(parts.tail, "A) One\nB) Two");
        assert_eq!(parts.join(), "Is it 3.5? Which fits?\nA) One\nB) Two");
    }

    #[test]
    fn sentence_split_keeps_decimals() {
        assert_eq!(
            split_sentences("It costs 3.5 dollars. Why? Think!"),
            vec!["It costs 3.5 dollars.", "Why?", "Think!"]
        );
    }

    #[test]
    fn scaffold_only_for_apprentice_without_cues() {
        let apprentice = TurnContext::new("Apprentice", "apples", "1", "t", false);
        let out = run_stage(inject_scaffold, "What do you see?", &apprentice);
        assert!(SCAFFOLD_EARLY.iter().any(|s| out.starts_with(s)));

        let out = run_stage(inject_scaffold, "Start with the apples. What do you see?", &apprentice);
        assert_eq!(out, "Start with the apples. What do you see?");

        let master = TurnContext::new("Master", "apples", "1", "t", false);
        let out = run_stage(inject_scaffold, "What do you see?", &master);
        assert_eq!(out, "What do you see?");

        let older = TurnContext::new("Apprentice", "apples", "9", "t", false);
        let out = run_stage(inject_scaffold, "What do you see?", &older);
        assert!(SCAFFOLD_STANDARD.iter().any(|s| out.starts_with(s)));
    }

    #[test]
    fn early_band_vocabulary_is_simplified() {
        let early = turn("master", "K");
        let out = run_stage(simplify_vocabulary, "Determine the quantity you need.", &early);
        assert_eq!(out, "Find the amount you need.");

        let later = turn("master", "8");
        let out = run_stage(simplify_vocabulary, "Determine the quantity you need.", &later);
        assert_eq!(out, "Determine the quantity you need.");
    }

    #[test]
    fn operation_choice_follows_focus_hints() {
        assert_eq!(
            OperationChoice::infer("How many fewer cats than dogs?", ""),
            OperationChoice::AddOrSubtract
        );
        assert_eq!(
            OperationChoice::infer("Cost per notebook", ""),
            OperationChoice::MultiplyOrDivide
        );
        assert_eq!(
            OperationChoice::infer("", "Seven friends"),
            OperationChoice::AnyOperation
        );
    }

    #[test]
    fn operation_vocabulary_forces_choice_question_and_options() {
        let ctx = TurnContext::new("master", "pencils per box", "6", "t", false);
        let out = run_stage(
            enforce_operation_choice,
            "You could multiply here. What would you try next?",
            &ctx,
        );
        assert!(out.contains("compare as a rate?") || out.contains("splitting into equal groups?"));
        assert!(out.ends_with("A) Scale by the number of groups\nB) Compare as a rate"));
        assert!(!out.contains("What would you try next?"));
    }

    #[test]
    fn existing_options_are_kept() {
        let ctx = TurnContext::new("master", "", "6", "t", false);
        let out = run_stage(
            enforce_operation_choice,
            "Think about the sum. Which one?\nA) 10\nB) 12",
            &ctx,
        );
        assert!(out.ends_with("A) 10\nB) 12"));
        assert_eq!(out.matches("A)").count(), 1);
    }

    #[test]
    fn unpunctuated_options_block_gets_one_question_and_no_second_list() {
        let out = rewriter().rewrite(
            "Pick one.\nA) Add them\nB) Subtract them",
            "master",
            "",
            "7",
            "t",
            false,
        );
        assert_eq!(question_marks(&out), 1, "{out}");
        assert_eq!(out.matches("A)").count(), 1, "{out}");
        assert!(!out.contains("Compare as a rate"), "{out}");
        assert!(out.ends_with("A) Combine them\nB) Take away them"), "{out}");
        assert_eq!(out.lines().count(), 3, "{out}");
        assert!(out.lines().next().is_some_and(|line| line.ends_with('?')), "{out}");
    }

    #[test]
    fn inline_options_are_kept_and_put_on_their_own_lines() {
        let ctx = turn("master", "7");
        let out = run_stage(
            enforce_operation_choice,
            "Let's think. A) combine B) take away",
            &ctx,
        );
        assert!(out.starts_with("Let's think. "), "{out}");
        assert!(out.ends_with("?\nA) combine\nB) take away"), "{out}");
        assert!(!out.contains("C)"), "{out}");
    }

    #[test]
    fn inline_options_keep_the_sentence_after_them() {
        let (prose, options) =
            split_options("Try one: A) count B) draw it. Which feels easier?");
        assert_eq!(prose, "Try one:\nWhich feels easier?");
        assert_eq!(options, vec!["A) count", "B) draw it."]);
    }

    #[test]
    fn repeated_options_only_reply_keeps_the_choice() {
        let rewriter = rewriter();
        let raw = "Pick one.\nA) Count again\nB) Draw it";
        let first = rewriter.rewrite(raw, "master", "counting", "7", "t", false);
        assert_eq!(first, raw);

        let second = rewriter.rewrite(raw, "master", "counting", "7", "t", false);
        assert!(has_options_block(&second), "{second}");
        assert!(second.ends_with("A) Count again\nB) Draw it"), "{second}");
        assert!(!second.contains("Pick one."), "{second}");
        assert!(question_marks(&second) <= 1, "{second}");
    }

    #[test]
    fn options_followed_by_question_stay_on_their_own_lines() {
        let ctx = turn("master", "6");
        let out = run_stage(limit_sentences, "What now?\nA) 1 + 1\nB) 2 … 2\nWhich?", &ctx);
        assert_eq!(out, "What now. Which?\nA) 1 + 1\nB) 2 … 2");
    }

    #[test]
    fn answer_prefix_does_not_swallow_first_option() {
        let rewriter = rewriter();
        let raw = "Pick one.\nA) Count again\nB) Draw it";
        rewriter.rewrite(raw, "master", "beads", "7", "t", true);
        let second = rewriter.rewrite(raw, "master", "beads", "7", "t", true);
        assert!(second.starts_with("🔍 "), "{second}");
        assert!(has_options_block(&second), "{second}");
    }

    #[test]
    fn sentence_limit_keeps_one_question() {
        let ctx = turn("master", "2");
        let out = run_stage(
            limit_sentences,
            "One. Two? Three. Four. Five. What now?",
            &ctx,
        );
        assert_eq!(sentence_count(&out), 3);
        assert_eq!(question_marks(&out), 1);
        assert!(out.ends_with("What now?"));
        assert!(out.starts_with("One. Two."));
    }

    #[test]
    fn sentence_limit_adds_question_when_missing() {
        let ctx = turn("master", "10");
        let out = run_stage(limit_sentences, "A. B. C. D. E.", &ctx);
        assert_eq!(sentence_count(&out), 4);
        assert_eq!(question_marks(&out), 1);
    }

    #[test]
    fn sentence_limit_leaves_room_for_answer_prefix() {
        let ctx = TurnContext::new("master", "", "K", "t", true);
        let out = run_stage(limit_sentences, "One. Two. Three. Four?", &ctx);
        assert_eq!(sentence_count(&out), 2);
        assert!(out.ends_with("Four?"));
    }

    #[test]
    fn options_block_satisfies_question_requirement() {
        let ctx = turn("master", "6");
        let out = run_stage(limit_sentences, "Pick one.\nA) Combine\nB) Compare", &ctx);
        assert_eq!(out, "Pick one.\nA) Combine\nB) Compare");
        assert!(has_options_block(&out));
    }

    #[test]
    fn empty_input_yields_fallback_question() {
        let out = rewriter().rewrite("", "master", "", "6", "t", false);
        assert!(FORWARD_QUESTIONS.contains(&out.as_str()));
    }

    #[test]
    fn masking_holds_end_to_end() {
        let rewriter = rewriter();
        let inputs = [
            "Compute 3 + 4 = 7 and then 2^3. Is 3/4 at (3, 4) bigger?",
            "x = 5 + y. What is x^2?",
            "Plot (-1, 2.5) and (0,0). Does 1/2 = 2/4?",
        ];
        for (index, input) in inputs.iter().enumerate() {
            let out = rewriter.rewrite(input, "master", &format!("f{index}"), "7", "t", false);
            assert!(!out.contains(['+', '=', '^']), "{out}");
            assert!(!FRACTION.is_match(&out), "{out}");
            assert!(!COORDINATE.is_match(&out), "{out}");
        }
    }

    #[test]
    fn single_question_or_options_end_to_end() {
        let rewriter = rewriter();
        let inputs = [
            "What is this? And this? And that?",
            "A statement only.",
            "Add them up. What is the sum? Are you sure?",
            "Why? Why not? How?",
        ];
        for (index, input) in inputs.iter().enumerate() {
            let out = rewriter.rewrite(input, "rising hero", &format!("q{index}"), "5", "t", false);
            assert!(
                question_marks(&out) == 1 || has_options_block(&out),
                "{out}"
            );
            assert!(question_marks(&out) <= 1, "{out}");
        }
    }

    #[test]
    fn sentence_cap_end_to_end() {
        let rewriter = rewriter();
        let long = "You have apples. You have pears. Count the apples. Count the pears. \
                    Write both numbers. Look at them. Which is bigger?";
        let early = rewriter.rewrite(long, "apprentice", "fruit", "1", "t", false);
        assert!(sentence_count(&early) <= 3, "{early}");

        let later = rewriter.rewrite(long, "apprentice", "fruit", "7", "t", false);
        assert!(sentence_count(&later) <= 4, "{later}");

        let answered = rewriter.rewrite(long, "apprentice", "fruit", "K", "t", true);
        assert!(sentence_count(&answered) <= 3, "{answered}");
    }

    #[test]
    fn subtraction_prompt_becomes_operation_choice() {
        let out = rewriter().rewrite(
            "Subtract 5 from 12 to get the result. Is that right?",
            "rising hero",
            "Sam has 12 stickers and gives away 5",
            "4",
            "token",
            false,
        );

        assert!(!out.contains("Subtract"));
        assert!(!out.to_lowercase().contains("right"));
        assert!(!out.contains("12 -") && !out.contains("- 5") && !out.contains("12-5"));
        assert_eq!(question_marks(&out), 1);
        assert!(out.contains("Should we combine the amounts or find the difference?")
            || out.contains("Does this step call for combining or for finding what is left?"));
        assert!(has_options_block(&out));
    }

    #[test]
    fn repeated_micro_lesson_is_suppressed() {
        let rewriter = rewriter();
        let first = rewriter.rewrite(
            "First, find what's being asked. Then compare the numbers. What do you notice?",
            "master",
            "marbles",
            "7",
            "token",
            false,
        );
        assert!(first.contains("Then compare the numbers."));

        let second = rewriter.rewrite(
            "first, find what's being asked.  Then compare the numbers. What's your next step?",
            "master",
            "marbles",
            "7",
            "token",
            false,
        );
        assert!(!second.contains("compare the numbers"), "{second}");
        assert!(!second.to_lowercase().contains("find what's being asked"));
        assert_eq!(second, "What's your next step?");
    }

    #[test]
    fn repeated_lesson_without_question_gets_forward_question() {
        let rewriter = rewriter();
        rewriter.rewrite("Look at the chart closely.", "master", "chart", "7", "t", false);
        let second = rewriter.rewrite("Look at the chart closely.", "master", "chart", "7", "t", false);
        assert!(!second.contains("chart closely"));
        assert_eq!(question_marks(&second), 1);
    }

    #[test]
    fn other_sessions_keep_their_lessons() {
        let rewriter = rewriter();
        let raw = "Read the problem slowly. What do you notice?";
        rewriter.rewrite(raw, "master", "marbles", "7", "alice", false);
        let other = rewriter.rewrite(raw, "master", "marbles", "7", "bob", false);
        assert!(other.contains("Read the problem slowly."));
    }

    #[test]
    fn consecutive_replies_never_identical() {
        let rewriter = rewriter();
        let raw = "What do you notice about the shape?";
        let first = rewriter.rewrite(raw, "master", "shapes", "7", "t", false);
        let second = rewriter.rewrite(raw, "master", "shapes", "7", "t", false);
        let third = rewriter.rewrite(raw, "master", "shapes", "7", "t", false);

        assert_eq!(first, raw);
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(question_marks(&second), 1);
    }

    #[test]
    fn repeated_options_reply_changes_question() {
        let rewriter = rewriter();
        let raw = "Which one fits?\nA) Combine the amounts\nB) Find the difference";
        let first = rewriter.rewrite(raw, "master", "", "7", "t", false);
        let second = rewriter.rewrite(raw, "master", "", "7", "t", false);
        assert_ne!(first, second);
        assert!(has_options_block(&second));
        assert!(REFLECTIVE_OPTION_QUESTIONS.iter().any(|q| second.contains(q)));
    }

    #[test]
    fn uncertain_bare_answer_gets_review_prefix() {
        let out = rewriter().rewrite(
            "✅ Try it. Let's check your counting of the apples. [[CHECK]]",
            "rising hero",
            "apples in baskets",
            "3",
            "token",
            true,
        );
        assert!(REVIEW_PREFIXES.iter().any(|p| out.starts_with(p)), "{out}");
        assert!(!out.contains(AFFIRMATION_PREFIX));
    }

    #[test]
    fn untagged_bare_answer_is_treated_as_uncertain() {
        let out = rewriter().rewrite(
            "How did you count them?",
            "master",
            "apples",
            "3",
            "token",
            true,
        );
        assert!(REVIEW_PREFIXES.iter().any(|p| out.starts_with(p)), "{out}");
    }

    #[test]
    fn plausible_bare_answer_gets_single_affirmation() {
        let out = rewriter().rewrite(
            "✅ Try it. How could you check it another way? [[PLAUSIBLE]]",
            "master",
            "apples",
            "6",
            "token",
            true,
        );
        assert!(out.starts_with(AFFIRMATION_PREFIX));
        assert_eq!(out.matches("✅").count(), 1);
        assert_eq!(question_marks(&out), 1);
    }

    #[test]
    fn judgment_prefix_only_for_bare_numbers() {
        let out = rewriter().rewrite(
            "How could you check it another way? [[PLAUSIBLE]]",
            "master",
            "apples",
            "6",
            "token",
            false,
        );
        assert!(!out.contains(AFFIRMATION_PREFIX));
    }

    #[test]
    fn code_fences_are_removed() {
        assert_eq!(strip_code_fence("```markdown\nHello?\n```"), "Hello?");
    }
}
