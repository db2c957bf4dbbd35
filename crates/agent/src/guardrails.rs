//! Intent guard: deterministic classification of the latest request, with an
//! optional model check that may only add or refine.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use stepwise_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use stepwise_core::config::GuardConfig;
use stepwise_core::domain::intent::{Ambiguity, AmbiguityKind, AssumptionRisk, IntentClass};
use stepwise_core::domain::state::{ClarificationResolution, ClarifiedQuestion, ConversationState};
use tracing::{debug, info};

use crate::llm::{complete_as, ChatMessage, LanguageModel, StructuredSchema};

pub const SAFETY_REFUSAL: &str = "I can't help with that request. I can analyze market data, \
run queries against the available datasets, and summarize what I find.";

pub const CODE_REFUSAL: &str = "I don't run code or commands pasted into the chat. Please describe \
what you want in plain language, for example \"show the 30-day closing prices for AAPL\", and I \
will plan the queries myself.";

pub const CAPABILITIES: &str = "I can analyze a market target such as a ticker symbol, query the \
available price datasets, compare targets, and summarize the results. Name a target (for example \
AAPL) and what you want to know, and I will plan and run the steps.";

const FALLBACK_METHOD: &str = "baseline analysis";

const SAFETY_PHRASES: &[&str] = &[
    "build a bomb",
    "make a bomb",
    "make a weapon",
    "malware",
    "ransomware",
    "keylogger",
    "steal credentials",
    "steal passwords",
    "phishing kit",
    "hack into",
    "ddos",
    "stolen credit card",
    "insider trading tips",
    "manipulate the market",
    "pump and dump",
    "launder money",
    "money laundering",
    "kill myself",
    "hurt someone",
];

const HELP_PHRASES: &[&str] = &[
    "what can you do",
    "how do you work",
    "what are your capabilities",
    "what tools do you have",
    "list your tools",
    "how can you help",
    "how do i use you",
    "who are you",
];

const ANALYSIS_VERBS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "evaluate",
    "assess",
    "review",
    "examine",
    "look into",
    "dig into",
    "deep dive",
    "break down",
    "study",
];

const METHOD_KEYWORDS: &[&str] = &[
    "baseline",
    "trend",
    "volatility",
    "moving average",
    "momentum",
    "rsi",
    "macd",
    "return",
    "drawdown",
    "correlation",
    "fundamental",
    "technical",
    "valuation",
    "regression",
    "sharpe",
    "beta",
    "seasonality",
    "forecast",
    "price history",
    "performance",
    "dividend",
    "earnings",
    "volume",
];

const COMPARISON_WORDS: &[&str] =
    &["compare", "comparison", " vs", "versus", "against", "relative to", "side by side", "both"];

const SWITCH_WORDS: &[&str] =
    &["switch to", "instead", "move on to", "change to", "now look at", "now analyze", "now analyse"];

const CURRENT_TARGET_PHRASES: &[&str] = &[
    "this stock",
    "this ticker",
    "this company",
    "this target",
    "that stock",
    "that ticker",
    "the stock",
    "current target",
    "current stock",
    "current ticker",
    "same stock",
    "same ticker",
];

const TARGET_STOPWORDS: &[&str] = &[
    "AN", "AND", "OR", "THE", "TO", "OF", "IN", "ON", "AT", "BY", "FOR", "IS", "IT", "BE", "DO",
    "ME", "MY", "WE", "US", "OK", "HI", "NO", "YES", "NOT", "CAN", "YOU", "ALL", "ANY", "ETF",
    "CEO", "CFO", "USA", "USD", "EUR", "GBP", "JPY", "AI", "API", "SQL", "CSV", "PDF", "JSON",
    "HTML", "EPS", "PE", "ROI", "ROE", "YTD", "QOQ", "YOY", "GDP", "IPO", "RSI", "MACD", "SMA",
    "EMA", "ATR", "VWAP", "FAQ", "TLDR", "HELP", "NOTE", "PS", "AM", "PM", "UTC", "EST", "TTM",
];

/// Classification of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardOutcome {
    pub intent: IntentClass,
    pub reason_code: &'static str,
    pub guardrail_response: Option<String>,
    pub needs_clarification: bool,
    pub ambiguity: Option<Ambiguity>,
    pub assumption: Option<String>,
    pub target: Option<String>,
    /// Target the thread should be bound to from now on.
    pub bind_target: Option<String>,
}

impl GuardOutcome {
    fn task() -> Self {
        Self {
            intent: IntentClass::Task,
            reason_code: "task",
            guardrail_response: None,
            needs_clarification: false,
            ambiguity: None,
            assumption: None,
            target: None,
            bind_target: None,
        }
    }

    fn terminal(intent: IntentClass, reason_code: &'static str, response: &str) -> Self {
        Self { intent, reason_code, guardrail_response: Some(response.to_string()), ..Self::task() }
    }

    fn current_target(target: String) -> Self {
        Self {
            intent: IntentClass::AnalyzeCurrentTarget,
            reason_code: "analyze_current_target",
            target: Some(target),
            ..Self::task()
        }
    }

    fn other_target(target: String) -> Self {
        Self {
            intent: IntentClass::AnalyzeOtherTarget,
            reason_code: "analyze_other_target",
            target: Some(target.clone()),
            bind_target: Some(target),
            ..Self::task()
        }
    }

    fn with_assumption(mut self, assumption: impl Into<String>) -> Self {
        self.assumption = Some(assumption.into());
        self
    }

    fn is_deterministic_block(&self) -> bool {
        self.intent.is_terminal() || self.needs_clarification
    }
}

#[derive(Debug, Deserialize)]
struct IntentVerdict {
    intent: String,
}

pub struct IntentGuard {
    config: GuardConfig,
    max_clarifications: u32,
    model: Option<Arc<dyn LanguageModel>>,
    audit: Arc<dyn AuditSink>,
}

impl IntentGuard {
    pub fn new(
        config: GuardConfig,
        max_clarifications: u32,
        model: Option<Arc<dyn LanguageModel>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { config, max_clarifications, model, audit }
    }

    pub async fn classify(&self, state: &ConversationState, audit: &AuditContext) -> GuardOutcome {
        let mut outcome = self.classify_rules(state);
        if self.config.model_check && !outcome.is_deterministic_block() {
            if let Some(model) = &self.model {
                outcome = refine_with_model(model.as_ref(), state, outcome).await;
            }
        }

        info!(
            event_name = "guard.classified",
            thread_id = %state.thread_id,
            intent = outcome.intent.as_str(),
            reason_code = outcome.reason_code,
            signature = outcome.ambiguity.as_ref().map(|a| a.signature.as_str()).unwrap_or(""),
            needs_clarification = outcome.needs_clarification,
            "request classified"
        );
        let mut event = AuditEvent::new(
            audit,
            "guard.classified",
            AuditCategory::Guard,
            if outcome.guardrail_response.is_some() {
                AuditOutcome::Rejected
            } else {
                AuditOutcome::Success
            },
        )
        .with_metadata("intent", outcome.intent.as_str())
        .with_metadata("reason_code", outcome.reason_code);
        if let Some(assumption) = &outcome.assumption {
            event = event.with_metadata("assumption", assumption.clone());
        }
        self.audit.emit(event);
        outcome
    }

    /// Deterministic rules only, in fixed priority order.
    pub fn classify_rules(&self, state: &ConversationState) -> GuardOutcome {
        let clarified = state.turn.clarified.as_ref();
        let text = match clarified {
            Some(clarified) => clarified.question.clone(),
            None => state.latest_user_text().to_string(),
        };
        let lower = text.to_lowercase();

        if contains_any(&lower, SAFETY_PHRASES) {
            return GuardOutcome::terminal(IntentClass::BlockedSafety, "unsafe_content", SAFETY_REFUSAL);
        }
        if looks_like_code(&text) {
            return GuardOutcome::terminal(
                IntentClass::BlockedUserCode,
                "code_submission",
                CODE_REFUSAL,
            );
        }
        if is_help_request(&lower) {
            return GuardOutcome::terminal(IntentClass::MetaHelp, "meta_help", CAPABILITIES);
        }

        let (mut outcome, mut ambiguity) = analyze_targets(&text, &lower, state.bound_target.as_deref());
        if let Some(found) = ambiguity.take() {
            match resolution_for(clarified, &found) {
                Some(resolution) => outcome = apply_resolution(outcome, resolution, state),
                None => ambiguity = Some(found),
            }
        }

        if ambiguity.is_none() && outcome.intent.is_target_analysis() {
            if let Some(found) = self.method_ambiguity(&lower) {
                match resolution_for(clarified, &found) {
                    Some(resolution) => outcome = apply_resolution(outcome, resolution, state),
                    None => ambiguity = Some(found),
                }
            }
        }

        match ambiguity {
            Some(found) => self.decide(outcome, found, state),
            None => outcome,
        }
    }

    fn method_ambiguity(&self, lower: &str) -> Option<Ambiguity> {
        if !contains_any(lower, ANALYSIS_VERBS) || contains_any(lower, METHOD_KEYWORDS) {
            return None;
        }
        Some(Ambiguity::new(
            AmbiguityKind::AnalysisMethodUnspecified,
            AssumptionRisk::Medium,
            self.config.default_analysis_method.clone(),
        ))
    }

    /// Ask when the risk warrants it and budget remains; otherwise proceed on
    /// a recorded default assumption.
    fn decide(
        &self,
        outcome: GuardOutcome,
        ambiguity: Ambiguity,
        state: &ConversationState,
    ) -> GuardOutcome {
        let ledger = &state.clarification;
        let ask = ambiguity.warrants_clarification()
            && !ledger.already_asked(&ambiguity.signature)
            && !ledger.budget_exhausted(self.max_clarifications);
        if ask {
            return GuardOutcome {
                intent: IntentClass::NeedsClarification,
                reason_code: "ambiguous_request",
                needs_clarification: true,
                ambiguity: Some(ambiguity),
                ..outcome
            };
        }

        debug!(
            event_name = "guard.default_assumption",
            thread_id = %state.thread_id,
            signature = %ambiguity.signature,
            "resolving ambiguity without asking"
        );
        let resolved = match &ambiguity.kind {
            AmbiguityKind::UnboundCurrentTarget => GuardOutcome::task().with_assumption(
                "No target is set in this conversation, so the request is handled as a general \
                 question.",
            ),
            AmbiguityKind::MultipleTargets { targets } => {
                let first = targets.first().cloned().unwrap_or_default();
                GuardOutcome::other_target(first.clone())
                    .with_assumption(format!("Several targets were mentioned; focusing on {first}."))
            }
            AmbiguityKind::TargetMismatch { bound, requested } => {
                GuardOutcome::current_target(bound.clone()).with_assumption(format!(
                    "Staying on {bound}, the target already in use, rather than switching to \
                     {requested}."
                ))
            }
            AmbiguityKind::AnalysisMethodUnspecified => {
                let method = ambiguity.safe_default.as_deref().unwrap_or(FALLBACK_METHOD);
                outcome.with_assumption(format!("No analysis method was given; using {method}."))
            }
        };
        GuardOutcome { ambiguity: Some(ambiguity), ..resolved }
    }
}

/// Writes a guard outcome into the turn.
pub fn apply_outcome(state: &mut ConversationState, outcome: &GuardOutcome) {
    let turn = &mut state.turn;
    turn.intent_class = Some(outcome.intent);
    turn.guardrail_response = outcome.guardrail_response.clone();
    turn.needs_clarification = outcome.needs_clarification;
    turn.clarification_signature = outcome.ambiguity.as_ref().map(|a| a.signature.clone());
    turn.analysis_target = outcome.target.clone();
    if let Some(assumption) = &outcome.assumption {
        if !turn.assumptions.contains(assumption) {
            turn.assumptions.push(assumption.clone());
        }
    }
    if let Some(target) = &outcome.bind_target {
        state.bound_target = Some(target.clone());
    }
}

fn analyze_targets(
    text: &str,
    lower: &str,
    bound: Option<&str>,
) -> (GuardOutcome, Option<Ambiguity>) {
    let targets = explicit_targets(text);
    let analysis = contains_any(lower, ANALYSIS_VERBS);

    match targets.as_slice() {
        [] => {
            let current_ref = refers_to_current_target(lower, analysis);
            match bound {
                Some(bound) if current_ref || analysis => {
                    (GuardOutcome::current_target(bound.to_string()), None)
                }
                None if current_ref => (
                    GuardOutcome::task(),
                    Some(Ambiguity::new(
                        AmbiguityKind::UnboundCurrentTarget,
                        AssumptionRisk::High,
                        None,
                    )),
                ),
                _ => (GuardOutcome::task(), None),
            }
        }
        [single] => match bound {
            Some(bound) if bound == single => (GuardOutcome::current_target(single.clone()), None),
            Some(_) if contains_any(lower, SWITCH_WORDS) => {
                (GuardOutcome::other_target(single.clone()), None)
            }
            Some(bound) => (
                GuardOutcome::task(),
                Some(Ambiguity::new(
                    AmbiguityKind::TargetMismatch {
                        bound: bound.to_string(),
                        requested: single.clone(),
                    },
                    AssumptionRisk::High,
                    None,
                )),
            ),
            None => (GuardOutcome::other_target(single.clone()), None),
        },
        many => {
            if contains_any(lower, COMPARISON_WORDS) {
                (GuardOutcome { reason_code: "comparison", ..GuardOutcome::task() }, None)
            } else {
                (
                    GuardOutcome::task(),
                    Some(Ambiguity::new(
                        AmbiguityKind::MultipleTargets { targets: many.to_vec() },
                        AssumptionRisk::Medium,
                        None,
                    )),
                )
            }
        }
    }
}

fn resolution_for<'a>(
    clarified: Option<&'a ClarifiedQuestion>,
    ambiguity: &Ambiguity,
) -> Option<&'a ClarificationResolution> {
    clarified
        .filter(|clarified| clarified.signature == ambiguity.signature)
        .map(|clarified| &clarified.resolution)
}

fn apply_resolution(
    outcome: GuardOutcome,
    resolution: &ClarificationResolution,
    state: &ConversationState,
) -> GuardOutcome {
    let resolved = match resolution {
        ClarificationResolution::BindTarget(target) => GuardOutcome::other_target(target.clone()),
        ClarificationResolution::KeepBoundTarget => match &state.bound_target {
            Some(bound) => GuardOutcome::current_target(bound.clone()),
            None => GuardOutcome::task(),
        },
        ClarificationResolution::CompareTargets(targets) => GuardOutcome {
            reason_code: "comparison",
            ..GuardOutcome::task()
        }
        .with_assumption(format!("Comparing {} as requested.", targets.join(" and "))),
        ClarificationResolution::UseMethod(method) => {
            outcome.with_assumption(format!("Analysis method chosen by the user: {method}."))
        }
        ClarificationResolution::ProceedWithoutTarget => GuardOutcome::task(),
    };
    GuardOutcome { reason_code: "clarification_resolved", ..resolved }
}

async fn refine_with_model(
    model: &dyn LanguageModel,
    state: &ConversationState,
    outcome: GuardOutcome,
) -> GuardOutcome {
    let schema = StructuredSchema::new(
        "intent_check",
        json!({
            "type": "object",
            "properties": {
                "intent": {
                    "type": "string",
                    "enum": [
                        "task", "meta_help", "blocked_user_code", "blocked_safety",
                        "analyze_current_target", "analyze_other_target"
                    ]
                }
            },
            "required": ["intent"]
        }),
    );
    let messages = [
        ChatMessage::system(
            "Classify the user's request. Use blocked_safety for harmful requests, \
             blocked_user_code when the user pasted code or shell commands to run, meta_help for \
             questions about the assistant itself, analyze_current_target when the request is \
             about the target already under discussion, and task otherwise.",
        ),
        ChatMessage::user(state.request_text()),
    ];

    let verdict = match complete_as::<IntentVerdict>(model, &messages, &schema).await {
        Ok(verdict) => verdict,
        Err(error) => {
            debug!(event_name = "guard.model_check_failed", error = %error, "ignoring model check");
            return outcome;
        }
    };

    match IntentClass::parse(&verdict.intent) {
        Some(IntentClass::BlockedSafety) => {
            GuardOutcome::terminal(IntentClass::BlockedSafety, "model_unsafe_content", SAFETY_REFUSAL)
        }
        Some(IntentClass::BlockedUserCode) => {
            GuardOutcome::terminal(IntentClass::BlockedUserCode, "model_code_submission", CODE_REFUSAL)
        }
        Some(IntentClass::MetaHelp) => {
            GuardOutcome::terminal(IntentClass::MetaHelp, "model_meta_help", CAPABILITIES)
        }
        Some(IntentClass::AnalyzeCurrentTarget) if outcome.intent == IntentClass::Task => {
            match state.bound_target.clone() {
                Some(bound) if outcome.ambiguity.is_none() => GuardOutcome {
                    reason_code: "model_refined",
                    assumption: outcome.assumption,
                    ..GuardOutcome::current_target(bound)
                },
                _ => outcome,
            }
        }
        _ => outcome,
    }
}

/// Ticker-like identifiers: `$ABC`, or 2-5 letter uppercase words that are not
/// common acronyms. Order of first mention, deduplicated.
pub fn explicit_targets(text: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for token in text.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '$')) {
        let candidate = match token.strip_prefix('$') {
            Some(symbol)
                if (1..=5).contains(&symbol.len())
                    && symbol.chars().all(|ch| ch.is_ascii_alphabetic()) =>
            {
                symbol.to_ascii_uppercase()
            }
            Some(_) => continue,
            None if (2..=5).contains(&token.len())
                && token.chars().all(|ch| ch.is_ascii_uppercase())
                && !TARGET_STOPWORDS.contains(&token) =>
            {
                token.to_string()
            }
            None => continue,
        };
        if !targets.contains(&candidate) {
            targets.push(candidate);
        }
    }
    targets
}

fn refers_to_current_target(lower: &str, analysis: bool) -> bool {
    if contains_any(lower, CURRENT_TARGET_PHRASES) {
        return true;
    }
    analysis && lower.split(|ch: char| !ch.is_ascii_alphanumeric()).any(|word| word == "it")
}

fn is_help_request(lower: &str) -> bool {
    matches!(lower.trim(), "help" | "help?" | "/help") || contains_any(lower, HELP_PHRASES)
}

/// Pasted code or shell input rather than a plain-language request.
pub fn looks_like_code(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.contains("```") || trimmed.starts_with("#!") {
        return true;
    }

    let lines = trimmed.lines().map(str::trim).filter(|line| !line.is_empty()).collect::<Vec<_>>();
    if lines
        .iter()
        .any(|line| line.starts_with("$ ") || line.starts_with(">>> ") || line.starts_with("PS>"))
    {
        return true;
    }

    let lower = trimmed.to_lowercase();
    let sql_select = lower.starts_with("select ")
        && lower.contains(" from ")
        && [" where ", " join ", " group by ", " order by ", " limit ", "*", ";"]
            .iter()
            .any(|clause| lower.contains(clause));
    let sql_statement = sql_select
        || lower.starts_with("insert into ")
        || lower.starts_with("delete from ")
        || lower.starts_with("drop table ")
        || lower.starts_with("create table ")
        || lower.starts_with("alter table ")
        || (lower.starts_with("update ") && lower.contains(" set "));
    if sql_statement {
        return true;
    }

    let code_lines = lines
        .iter()
        .filter(|line| {
            line.ends_with(';')
                || line.ends_with('{')
                || **line == "}"
                || ["def ", "fn ", "import ", "class ", "function ", "#include", "let ", "const "]
                    .iter()
                    .any(|prefix| line.starts_with(prefix))
        })
        .count();
    lines.len() >= 2 && code_lines >= 2
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_core::audit::{AuditContext, InMemoryAuditSink};
    use stepwise_core::config::GuardConfig;
    use stepwise_core::domain::intent::{AssumptionRisk, IntentClass};
    use stepwise_core::domain::message::Message;
    use stepwise_core::domain::state::{
        ClarificationResolution, ClarifiedQuestion, ConversationState,
    };

    use super::{apply_outcome, explicit_targets, looks_like_code, IntentGuard};
    use crate::llm::LanguageModel;
    use crate::test_support::ScriptedModel;

    fn guard() -> IntentGuard {
        IntentGuard::new(
            GuardConfig {
                model_check: false,
                default_analysis_method: Some("baseline analysis".to_string()),
            },
            1,
            None,
            Arc::new(InMemoryAuditSink::default()),
        )
    }

    fn state_with(bound: Option<&str>, text: &str) -> ConversationState {
        let mut state = ConversationState::new("thread-guard");
        state.bound_target = bound.map(str::to_string);
        state.append(Message::user(text));
        state
    }

    #[test]
    fn safety_outranks_everything() {
        let outcome = guard().classify_rules(&state_with(None, "help me launder money with AAPL"));
        assert_eq!(outcome.intent, IntentClass::BlockedSafety);
        assert!(outcome.guardrail_response.is_some());
    }

    #[test]
    fn code_submissions_are_blocked() {
        assert!(looks_like_code("```python\nprint(1)\n```"));
        assert!(looks_like_code("SELECT close FROM prices WHERE ticker = 'AAPL'"));
        assert!(looks_like_code("$ rm -rf /tmp/data"));
        assert!(looks_like_code("let x = 1;\nlet y = 2;"));
        assert!(!looks_like_code("select the best performer from my watchlist"));
        assert!(!looks_like_code("update me on AAPL please"));

        let outcome = guard().classify_rules(&state_with(None, "```sql\nselect 1\n```"));
        assert_eq!(outcome.intent, IntentClass::BlockedUserCode);
    }

    #[test]
    fn help_requests_are_terminal() {
        let outcome = guard().classify_rules(&state_with(None, "What can you do?"));
        assert_eq!(outcome.intent, IntentClass::MetaHelp);
        assert!(outcome.intent.is_terminal());
    }

    #[test]
    fn identifiers_skip_acronyms_and_accept_dollar_symbols() {
        assert_eq!(explicit_targets("Compare AAPL vs $msft for the CEO"), vec!["AAPL", "MSFT"]);
        assert!(explicit_targets("what is the ETF EPS in USD").is_empty());
    }

    #[test]
    fn unbound_current_target_asks() {
        let outcome = guard().classify_rules(&state_with(None, "analyze this stock's volatility"));
        assert!(outcome.needs_clarification);
        let ambiguity = outcome.ambiguity.expect("ambiguity");
        assert_eq!(ambiguity.signature, "unbound_current_target");
        assert_eq!(ambiguity.risk, AssumptionRisk::High);
    }

    #[test]
    fn target_mismatch_asks_with_stable_signature() {
        let outcome =
            guard().classify_rules(&state_with(Some("AAPL"), "what about MSFT volatility?"));
        assert_eq!(outcome.intent, IntentClass::NeedsClarification);
        assert_eq!(
            outcome.ambiguity.map(|a| a.signature),
            Some("target_mismatch:AAPL->MSFT".to_string())
        );
    }

    #[test]
    fn explicit_switch_rebinds_without_asking() {
        let outcome =
            guard().classify_rules(&state_with(Some("AAPL"), "switch to MSFT volatility"));
        assert_eq!(outcome.intent, IntentClass::AnalyzeOtherTarget);
        assert_eq!(outcome.bind_target.as_deref(), Some("MSFT"));
    }

    #[test]
    fn multiple_targets_without_comparison_ask() {
        let outcome = guard().classify_rules(&state_with(None, "AAPL TSLA volatility"));
        assert!(outcome.needs_clarification);
        assert_eq!(
            outcome.ambiguity.map(|a| a.signature),
            Some("multiple_targets:AAPL,TSLA".to_string())
        );

        let compare = guard().classify_rules(&state_with(None, "compare AAPL and TSLA returns"));
        assert!(!compare.needs_clarification);
        assert_eq!(compare.intent, IntentClass::Task);
    }

    #[test]
    fn broad_analysis_uses_default_method() {
        let outcome = guard().classify_rules(&state_with(Some("AAPL"), "analyze it"));
        assert_eq!(outcome.intent, IntentClass::AnalyzeCurrentTarget);
        assert!(!outcome.needs_clarification);
        assert_eq!(
            outcome.assumption.as_deref(),
            Some("No analysis method was given; using baseline analysis.")
        );
    }

    #[test]
    fn exhausted_budget_resolves_mismatch_to_bound_target() {
        let mut state = state_with(Some("AAPL"), "what about MSFT volatility?");
        state.clarification.asked_turns = 1;
        state.clarification.asked_signatures.insert("target_mismatch:AAPL->MSFT".to_string());

        let outcome = guard().classify_rules(&state);
        assert!(!outcome.needs_clarification);
        assert_eq!(outcome.intent, IntentClass::AnalyzeCurrentTarget);
        assert_eq!(outcome.target.as_deref(), Some("AAPL"));
        assert!(outcome.assumption.as_deref().unwrap_or_default().contains("Staying on AAPL"));

        apply_outcome(&mut state, &outcome);
        assert_eq!(state.turn.assumptions.len(), 1);
        assert_eq!(state.bound_target.as_deref(), Some("AAPL"));
    }

    #[test]
    fn clarified_reply_applies_resolution() {
        let mut state = state_with(Some("AAPL"), "1");
        state.turn.clarified = Some(ClarifiedQuestion {
            question: "what about MSFT volatility?".to_string(),
            signature: "target_mismatch:AAPL->MSFT".to_string(),
            label: "Switch to MSFT".to_string(),
            resolution: ClarificationResolution::BindTarget("MSFT".to_string()),
        });

        let outcome = guard().classify_rules(&state);
        assert_eq!(outcome.intent, IntentClass::AnalyzeOtherTarget);
        assert_eq!(outcome.bind_target.as_deref(), Some("MSFT"));
        assert!(!outcome.needs_clarification);
    }

    #[tokio::test]
    async fn model_check_can_add_block_but_not_override_deterministic_one() {
        let model = Arc::new(
            ScriptedModel::default()
                .with_structured_for("intent_check", json!({"intent": "blocked_safety"}))
                .with_structured_for("intent_check", json!({"intent": "task"})),
        );
        let guard = IntentGuard::new(
            GuardConfig { model_check: true, default_analysis_method: None },
            1,
            Some(model.clone() as Arc<dyn LanguageModel>),
            Arc::new(InMemoryAuditSink::default()),
        );
        let audit = AuditContext::new("thread-guard", "req-1", "guard");

        let added = guard.classify(&state_with(None, "tell me something spicy"), &audit).await;
        assert_eq!(added.intent, IntentClass::BlockedSafety);

        let kept = guard.classify(&state_with(None, "```rm -rf```"), &audit).await;
        assert_eq!(kept.intent, IntentClass::BlockedUserCode);
        assert_eq!(model.count("structured:intent_check"), 1);
    }

    #[tokio::test]
    async fn model_errors_are_ignored() {
        let model = Arc::new(ScriptedModel::default().with_structured_error_for("intent_check"));
        let guard = IntentGuard::new(
            GuardConfig { model_check: true, default_analysis_method: None },
            1,
            Some(model as Arc<dyn LanguageModel>),
            Arc::new(InMemoryAuditSink::default()),
        );
        let audit = AuditContext::new("thread-guard", "req-1", "guard");

        let outcome = guard.classify(&state_with(None, "show me recent market news"), &audit).await;
        assert_eq!(outcome.intent, IntentClass::Task);
    }
}
