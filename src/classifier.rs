//! Query complexity classification.
//!
//! Analyses a request's text and produces a [`Classification`]: a complexity
//! class, a confidence score, and the tier the request should route to.
//!
//! | Class     | Tier        | Typical input                          |
//! |-----------|-------------|----------------------------------------|
//! | `Simple`  | `UltraFast` | greetings, ≤3-word statements          |
//! | `Medium`  | `Fast`      | ordinary questions and chat            |
//! | `Complex` | `Balanced`  | reasoning, analysis, long prompts      |
//! | `Expert`  | `Powerful`  | code, multi-signal technical requests  |
//!
//! Classification is a pure function of the text and the (fixed) pattern
//! tables: same input always produces the same output, with no network or
//! disk access, so it stays off the request's critical latency path.

use crate::registry::Tier;

// ── Pattern tables ───────────────────────────────────────────────────────

/// Exact-match greetings and acknowledgements (case-insensitive).
const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "bye", "ok", "okay", "yes", "no", "sure",
    "good", "great", "cool", "nice", "yep", "nope", "yeah", "nah",
];

/// Simple-fact question prefixes (contains, case-insensitive).
const SIMPLE_FACTS: &[&str] = &[
    "what time",
    "what day",
    "what date",
    "how are you",
    "who are you",
    "what's your name",
];

/// Keywords indicating the prompt is about code.
const CODE_KEYWORDS: &[&str] = &[
    "function", "fn ", "def ", "class ", "impl ", "return", "import ", "const ", "async",
    "await", "struct ", "compile", "debug", "refactor", "unit test",
];

/// General technical vocabulary.
const TECHNICAL_TERMS: &[&str] = &[
    "algorithm", "database", "api", "server", "client", "protocol", "framework", "library",
    "compiler", "runtime", "thread", "memory", "latency", "throughput", "cache", "kernel",
];

/// Keywords requesting analysis or reasoning.
const ANALYSIS_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "evaluate",
    "explain",
    "reason",
    "assess",
    "trade-off",
    "tradeoff",
    "pros and cons",
    "architecture",
    "design",
    "optimize",
    "strategy",
];

/// Phrases signalling a high-complexity request on their own.
const COMPLEXITY_INDICATORS: &[&str] = &[
    "step by step",
    "in depth",
    "comprehensive",
    "end to end",
    "production-grade",
    "prove",
    "formally",
];

/// Phrases that force the reasoning path regardless of other signals.
const REASONING_MARKERS: &[&str] = &["why does", "why is", "how would", "what happens if"];

// ── Data model ───────────────────────────────────────────────────────────

/// Ordered complexity classes. Used for tier mapping and escalation
/// detection (`Simple < Medium < Complex < Expert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComplexityClass {
    /// Greetings and trivially answerable inputs.
    Simple,
    /// Ordinary single-topic requests.
    Medium,
    /// Requests needing reasoning or longer generation.
    Complex,
    /// Code-heavy or multi-signal technical requests.
    Expert,
}

impl ComplexityClass {
    /// Static class → tier map.
    pub fn suggested_tier(self) -> Tier {
        match self {
            ComplexityClass::Simple => Tier::UltraFast,
            ComplexityClass::Medium => Tier::Fast,
            ComplexityClass::Complex => Tier::Balanced,
            ComplexityClass::Expert => Tier::Powerful,
        }
    }

    /// The tier to try when the suggested one is empty: one tier up, except
    /// `Powerful` which falls back down to `Balanced`.
    pub fn fallback_tier(self) -> Tier {
        match self {
            ComplexityClass::Simple => Tier::Fast,
            ComplexityClass::Medium => Tier::Balanced,
            ComplexityClass::Complex => Tier::Powerful,
            ComplexityClass::Expert => Tier::Balanced,
        }
    }
}

impl std::fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ComplexityClass::Simple => "simple",
            ComplexityClass::Medium => "medium",
            ComplexityClass::Complex => "complex",
            ComplexityClass::Expert => "expert",
        };
        write!(f, "{name}")
    }
}

/// Extracted feature counts for one input text.
///
/// Exposed for observability — the router logs these fields alongside the
/// decision, never the text itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureSummary {
    /// Whitespace-delimited word count.
    pub word_count: usize,
    /// Sentence count (terminating punctuation, minimum 1 for non-empty).
    pub sentence_count: usize,
    /// Number of `?` characters.
    pub question_count: usize,
    /// Whether a fenced code block is present.
    pub has_code_fence: bool,
    /// Distinct code-keyword hits.
    pub code_keywords: usize,
    /// Distinct technical-term hits.
    pub technical_terms: usize,
    /// Distinct analysis-keyword hits.
    pub analysis_keywords: usize,
    /// Distinct high-complexity indicator hits.
    pub complexity_indicators: usize,
    /// Whether numbered-list / sequencing markers are present.
    pub multi_step: bool,
    /// Whether the text matches a greeting or simple-fact pattern.
    pub greeting: bool,
    /// Whether a reasoning marker forces the reasoning path.
    pub requires_reasoning: bool,
}

/// The classifier's verdict for one request.
///
/// Immutable, produced fresh per request, never persisted by this core.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// The chosen complexity class.
    pub class: ComplexityClass,
    /// Confidence in `[0.1, 0.95]`.
    pub confidence: f64,
    /// Tier this class maps to.
    pub suggested_tier: Tier,
    /// Tier to try when the suggested one is empty.
    pub fallback_tier: Tier,
    /// Extracted feature counts.
    pub features: FeatureSummary,
    /// Human-readable reason for the chosen class.
    pub reasoning: String,
}

// ── Classifier ───────────────────────────────────────────────────────────

/// Heuristic query classifier.
///
/// Stateless and cheap to construct. Deterministic given the same text and
/// pattern tables.
#[derive(Debug, Clone, Default)]
pub struct QueryClassifier;

impl QueryClassifier {
    /// Create a new classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classify a request text.
    ///
    /// `history` carries the user's recent raw queries (most recent last);
    /// it sharpens confidence for borderline inputs but never changes the
    /// class itself, keeping the class a pure function of the text.
    pub fn classify(&self, text: &str, history: &[&str]) -> Classification {
        let features = extract_features(text);
        let (class, reasoning) = decide(&features);
        let confidence = confidence_for(class, &features, history);

        Classification {
            class,
            confidence,
            suggested_tier: class.suggested_tier(),
            fallback_tier: class.fallback_tier(),
            features,
            reasoning,
        }
    }
}

// ── Feature extraction ───────────────────────────────────────────────────

/// Extract all classifier features from the raw text.
fn extract_features(text: &str) -> FeatureSummary {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return FeatureSummary {
            greeting: true,
            ..FeatureSummary::default()
        };
    }

    let lower = trimmed.to_lowercase();
    let word_count = trimmed.split_whitespace().count();
    let sentence_count = trimmed
        .chars()
        .filter(|c| matches!(c, '.' | '?' | '!'))
        .count()
        .max(1);
    let question_count = trimmed.chars().filter(|c| *c == '?').count();

    let greeting = GREETINGS.iter().any(|g| lower == *g)
        || SIMPLE_FACTS.iter().any(|p| lower.contains(p));

    FeatureSummary {
        word_count,
        sentence_count,
        question_count,
        has_code_fence: trimmed.contains("```"),
        code_keywords: count_hits(&lower, CODE_KEYWORDS),
        technical_terms: count_hits(&lower, TECHNICAL_TERMS),
        analysis_keywords: count_hits(&lower, ANALYSIS_KEYWORDS),
        complexity_indicators: count_hits(&lower, COMPLEXITY_INDICATORS),
        multi_step: has_numbered_list(trimmed) || lower.contains("step by step"),
        greeting,
        requires_reasoning: REASONING_MARKERS.iter().any(|m| lower.contains(m)),
    }
}

/// Count distinct pattern hits in lowercased text.
fn count_hits(lower: &str, patterns: &[&str]) -> usize {
    patterns.iter().filter(|p| lower.contains(*p)).count()
}

/// Detect two or more numbered list items ("1.", "2)", ...) at line starts.
fn has_numbered_list(text: &str) -> bool {
    let mut items = 0_usize;
    for line in text.lines() {
        let trimmed = line.trim_start();
        let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let rest = &trimmed[digits.len()..];
            if rest.starts_with('.') || rest.starts_with(')') {
                items += 1;
            }
        }
    }
    items >= 2
}

// ── Decision policy ──────────────────────────────────────────────────────

/// Apply the priority-ordered decision rules. First match wins.
fn decide(f: &FeatureSummary) -> (ComplexityClass, String) {
    // Rule 1: greetings and very short non-questions.
    if f.greeting || (f.word_count <= 3 && f.question_count == 0) {
        return (
            ComplexityClass::Simple,
            "greeting or very short statement".to_string(),
        );
    }

    // Rule 2: strong code / multi-signal technical indicators.
    if f.has_code_fence
        || f.code_keywords >= 2
        || f.complexity_indicators >= 2
        || (f.technical_terms >= 3 && f.analysis_keywords >= 1)
    {
        return (
            ComplexityClass::Expert,
            format!(
                "code or layered technical signals (fence={}, code={}, technical={})",
                f.has_code_fence, f.code_keywords, f.technical_terms
            ),
        );
    }

    // Rule 3: reasoning demanded, repeated analysis/technical vocabulary,
    // sequencing, or sheer length.
    if f.requires_reasoning
        || f.analysis_keywords >= 2
        || f.technical_terms >= 2
        || f.multi_step
        || f.word_count >= 30
    {
        return (
            ComplexityClass::Complex,
            format!(
                "reasoning or breadth signals (analysis={}, technical={}, words={})",
                f.analysis_keywords, f.technical_terms, f.word_count
            ),
        );
    }

    (ComplexityClass::Medium, "no strong signals".to_string())
}

// ── Confidence ───────────────────────────────────────────────────────────

/// Confidence bounds. Never fully certain, never fully uncertain.
const CONFIDENCE_FLOOR: f64 = 0.1;
const CONFIDENCE_CEILING: f64 = 0.95;

/// Blend pattern strength with word-count appropriateness for the class.
fn confidence_for(class: ComplexityClass, f: &FeatureSummary, history: &[&str]) -> f64 {
    let pattern = pattern_strength(class, f);
    let fit = word_count_fit(class, f.word_count);
    let mut confidence = 0.7 * pattern + 0.3 * fit;

    // A short burst of same-direction history sharpens borderline calls:
    // three technical turns in a row make a Complex verdict more credible.
    if history.len() >= 3 && matches!(class, ComplexityClass::Complex | ComplexityClass::Expert)
    {
        let technical_turns = history
            .iter()
            .rev()
            .take(3)
            .filter(|h| {
                let lower = h.to_lowercase();
                count_hits(&lower, TECHNICAL_TERMS) + count_hits(&lower, ANALYSIS_KEYWORDS) > 0
            })
            .count();
        if technical_turns >= 2 {
            confidence += 0.05;
        }
    }

    confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// How strongly the extracted patterns support the chosen class.
fn pattern_strength(class: ComplexityClass, f: &FeatureSummary) -> f64 {
    match class {
        ComplexityClass::Simple => {
            if f.greeting {
                0.95
            } else {
                0.7
            }
        }
        ComplexityClass::Medium => 0.6,
        ComplexityClass::Complex => {
            let mut s = 0.4;
            s += 0.12 * f.analysis_keywords.min(3) as f64;
            s += 0.1 * f.technical_terms.min(3) as f64;
            if f.multi_step {
                s += 0.15;
            }
            if f.requires_reasoning {
                s += 0.1;
            }
            s.min(1.0)
        }
        ComplexityClass::Expert => {
            let mut s = 0.3;
            if f.has_code_fence {
                s += 0.35;
            }
            s += 0.12 * f.code_keywords.min(3) as f64;
            s += 0.08 * f.technical_terms.min(3) as f64;
            s += 0.1 * f.complexity_indicators.min(2) as f64;
            s.min(1.0)
        }
    }
}

/// How well the word count matches what the class usually looks like.
fn word_count_fit(class: ComplexityClass, words: usize) -> f64 {
    let (lo, hi) = match class {
        ComplexityClass::Simple => (0, 8),
        ComplexityClass::Medium => (4, 30),
        ComplexityClass::Complex => (15, 200),
        ComplexityClass::Expert => (10, usize::MAX),
    };
    if words >= lo && words <= hi {
        1.0
    } else if words < lo {
        // Short for the class: scale by how close it gets.
        words as f64 / lo.max(1) as f64
    } else {
        0.5
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Classification {
        QueryClassifier::new().classify(text, &[])
    }

    // -- determinism ------------------------------------------------------

    #[test]
    fn test_classify_is_deterministic() {
        let c = QueryClassifier::new();
        let a = c.classify("Explain why does the cache invalidate early?", &["turn one"]);
        let b = c.classify("Explain why does the cache invalidate early?", &["turn one"]);
        assert_eq!(a, b);
    }

    // -- scenario fixtures from the decision policy -----------------------

    #[test]
    fn test_classify_hi_is_simple_ultra_fast() {
        let result = classify("Hi");
        assert_eq!(result.class, ComplexityClass::Simple);
        assert_eq!(result.suggested_tier, Tier::UltraFast);
        assert_eq!(result.fallback_tier, Tier::Fast);
    }

    #[test]
    fn test_classify_code_fence_with_function_is_expert_powerful() {
        let result = classify("Fix this function:\n```\nfn main() { panic!() }\n```");
        assert_eq!(result.class, ComplexityClass::Expert);
        assert_eq!(result.suggested_tier, Tier::Powerful);
        assert_eq!(result.fallback_tier, Tier::Balanced);
    }

    #[test]
    fn test_classify_short_statement_is_simple() {
        assert_eq!(classify("sounds good then").class, ComplexityClass::Simple);
    }

    #[test]
    fn test_classify_short_question_is_not_simple() {
        // Three words but a question mark — rule 1 must not fire.
        let result = classify("what is rust?");
        assert_ne!(result.class, ComplexityClass::Simple);
    }

    #[test]
    fn test_classify_simple_fact_pattern() {
        let result = classify("what time is it right now?");
        assert_eq!(result.class, ComplexityClass::Simple);
    }

    #[test]
    fn test_classify_plain_question_is_medium() {
        let result = classify("What's a good restaurant near the station?");
        assert_eq!(result.class, ComplexityClass::Medium);
        assert_eq!(result.suggested_tier, Tier::Fast);
    }

    #[test]
    fn test_classify_analysis_keywords_is_complex() {
        let result = classify("Compare and evaluate these two database designs for me");
        assert_eq!(result.class, ComplexityClass::Complex);
        assert_eq!(result.suggested_tier, Tier::Balanced);
    }

    #[test]
    fn test_classify_reasoning_marker_is_complex() {
        let result = classify("Why does water expand when it freezes?");
        assert_eq!(result.class, ComplexityClass::Complex);
    }

    #[test]
    fn test_classify_numbered_list_is_complex() {
        let result = classify("Plan my trip:\n1. Book flights\n2. Reserve hotel\n3. Pack");
        assert_eq!(result.class, ComplexityClass::Complex);
        assert!(result.features.multi_step);
    }

    #[test]
    fn test_classify_thirty_words_is_complex() {
        let text = (0..30).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        // 30 plain words with no other signal.
        assert_eq!(classify(&text).class, ComplexityClass::Complex);
    }

    #[test]
    fn test_classify_two_code_keywords_is_expert() {
        let result = classify("Refactor this function so the async path stops blocking");
        assert_eq!(result.class, ComplexityClass::Expert);
    }

    #[test]
    fn test_classify_technical_plus_analysis_is_expert() {
        let result =
            classify("Evaluate the api, the database layer and the cache for protocol drift");
        assert!(result.features.technical_terms >= 3);
        assert_eq!(result.class, ComplexityClass::Expert);
    }

    #[test]
    fn test_classify_empty_text_is_simple() {
        assert_eq!(classify("").class, ComplexityClass::Simple);
        assert_eq!(classify("   \n\t").class, ComplexityClass::Simple);
    }

    // -- tier maps --------------------------------------------------------

    #[test]
    fn test_suggested_tier_static_map() {
        assert_eq!(ComplexityClass::Simple.suggested_tier(), Tier::UltraFast);
        assert_eq!(ComplexityClass::Medium.suggested_tier(), Tier::Fast);
        assert_eq!(ComplexityClass::Complex.suggested_tier(), Tier::Balanced);
        assert_eq!(ComplexityClass::Expert.suggested_tier(), Tier::Powerful);
    }

    #[test]
    fn test_fallback_tier_is_next_up_except_powerful() {
        assert_eq!(ComplexityClass::Simple.fallback_tier(), Tier::Fast);
        assert_eq!(ComplexityClass::Medium.fallback_tier(), Tier::Balanced);
        assert_eq!(ComplexityClass::Complex.fallback_tier(), Tier::Powerful);
        assert_eq!(ComplexityClass::Expert.fallback_tier(), Tier::Balanced);
    }

    // -- confidence -------------------------------------------------------

    #[test]
    fn test_confidence_stays_in_bounds() {
        for text in ["Hi", "", "what?", "Explain step by step why does the compiler, the runtime and the cache interact, then compare and evaluate each trade-off in depth"] {
            let c = classify(text);
            assert!(
                (CONFIDENCE_FLOOR..=CONFIDENCE_CEILING).contains(&c.confidence),
                "confidence {} out of bounds for {text:?}",
                c.confidence
            );
        }
    }

    #[test]
    fn test_confidence_greeting_is_high() {
        assert!(classify("hello").confidence >= 0.8);
    }

    #[test]
    fn test_history_sharpens_complex_confidence() {
        let c = QueryClassifier::new();
        let text = "Compare and evaluate the two cache designs";
        let cold = c.classify(text, &[]);
        let warm = c.classify(
            text,
            &[
                "profile the database layer",
                "the api latency looks wrong",
                "analyze the cache throughput",
            ],
        );
        assert!(warm.confidence >= cold.confidence);
        // History never changes the class itself.
        assert_eq!(warm.class, cold.class);
    }

    // -- feature extraction edge cases ------------------------------------

    #[test]
    fn test_single_numbered_item_is_not_multi_step() {
        let f = extract_features("1. just one item");
        assert!(!f.multi_step);
    }

    #[test]
    fn test_numbered_list_with_parens_detected() {
        let f = extract_features("1) first\n2) second");
        assert!(f.multi_step);
    }

    #[test]
    fn test_sentence_count_minimum_one() {
        assert_eq!(extract_features("no punctuation here").sentence_count, 1);
    }

    #[test]
    fn test_class_display_names() {
        assert_eq!(ComplexityClass::Simple.to_string(), "simple");
        assert_eq!(ComplexityClass::Expert.to_string(), "expert");
    }

    #[test]
    fn test_class_ordering_supports_escalation_detection() {
        assert!(ComplexityClass::Simple < ComplexityClass::Medium);
        assert!(ComplexityClass::Medium < ComplexityClass::Complex);
        assert!(ComplexityClass::Complex < ComplexityClass::Expert);
    }
}
