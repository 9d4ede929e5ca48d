//! Hybrid intent classification: ordered pattern rules first, then an LLM
//! pass through the provider chain, then a safe default.

use std::collections::{HashMap, HashSet};

use carelink_llm::{GenerateRequest, PromptRegistry, ProviderRegistry};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use carelink_common::{CarelinkError, Result};

pub const INTENT_MEDICAL_EMERGENCY: &str = "medical_emergency";
pub const INTENT_GENERAL_INFO: &str = "general_info";

const CLASSIFIER_SYSTEM_PROMPT: &str = "You are an intent classifier for a healthcare \
chatbot. Respond with only the intent name, e.g., 'appointment_booking', 'general_info', \
'medical_emergency'.";

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Pattern,
    LlmPrimary,
    LlmFallback,
    Default,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: String,
    pub confidence: f32,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn is_emergency(&self) -> bool {
        self.intent == INTENT_MEDICAL_EMERGENCY
    }
}

/// One rule as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRuleConfig {
    pub intent: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

struct IntentRule {
    intent: String,
    keywords: Vec<Regex>,
    pattern: Option<Regex>,
}

impl IntentRule {
    fn compile(config: &IntentRuleConfig) -> Result<Self> {
        let keywords = config
            .keywords
            .iter()
            .map(|kw| {
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw))).map_err(|e| {
                    CarelinkError::Config(format!("bad keyword '{kw}' in intent rules: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let pattern = config
            .pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    CarelinkError::Config(format!("bad pattern for '{}': {e}", config.intent))
                })
            })
            .transpose()?;
        Ok(Self {
            intent: config.intent.clone(),
            keywords,
            pattern,
        })
    }

    fn matches(&self, message: &str) -> bool {
        self.keywords.iter().any(|kw| kw.is_match(message))
            || self.pattern.as_ref().is_some_and(|p| p.is_match(message))
    }
}

pub struct IntentClassifier {
    rules: Vec<IntentRule>,
    vocabulary: HashSet<String>,
}

impl IntentClassifier {
    /// Emergency rules are deliberately ordered above booking so that
    /// "chest pain - please book" classifies as an emergency.
    pub fn default_rules() -> Vec<IntentRuleConfig> {
        fn rule(intent: &str, keywords: &[&str]) -> IntentRuleConfig {
            IntentRuleConfig {
                intent: intent.to_string(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                pattern: None,
            }
        }
        vec![
            rule(
                INTENT_MEDICAL_EMERGENCY,
                &["emergency", "urgent", "pain", "bleeding", "chest"],
            ),
            rule(
                "appointment_booking",
                &["book", "schedule", "appointment", "doctor", "clinic"],
            ),
            rule(
                "appointment_modify",
                &["reschedule", "cancel", "change", "move"],
            ),
            rule(
                "pre_admission",
                &["admission", "surgery", "procedure", "preparation"],
            ),
            rule(
                "post_discharge",
                &["discharge", "recovery", "follow-up", "medication"],
            ),
        ]
    }

    pub fn with_default_rules() -> Self {
        Self::from_rules(&Self::default_rules()).expect("built-in rules compile")
    }

    pub fn from_rules(configs: &[IntentRuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(IntentRule::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut vocabulary: HashSet<String> =
            rules.iter().map(|r| r.intent.clone()).collect();
        vocabulary.insert(INTENT_GENERAL_INFO.to_string());

        Ok(Self { rules, vocabulary })
    }

    /// Load rules from a YAML file (a list of [`IntentRuleConfig`]).
    pub fn from_rules_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let configs: Vec<IntentRuleConfig> = serde_yaml::from_str(&raw)
            .map_err(|e| CarelinkError::Config(format!("bad intent rules file: {e}")))?;
        Self::from_rules(&configs)
    }

    /// First matching rule wins; rules are checked in declaration order.
    pub fn pattern_pass(&self, message: &str) -> Option<&str> {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.intent.as_str())
    }

    /// Full classification: pattern pass, LLM pass, default.
    ///
    /// The LLM output is accepted only when it normalizes to a known
    /// intent; an in-vocabulary answer from a non-primary provider is
    /// attributed to the fallback.
    pub async fn classify(
        &self,
        message: &str,
        history_text: &str,
        context_json: &str,
        prompts: &PromptRegistry,
        providers: &ProviderRegistry,
    ) -> Classification {
        if let Some(intent) = self.pattern_pass(message) {
            info!(intent, "intent classified via patterns");
            return Classification {
                intent: intent.to_string(),
                confidence: 1.0,
                source: ClassificationSource::Pattern,
            };
        }

        debug!("no pattern match, classifying via LLM");
        match self
            .llm_pass(message, history_text, context_json, prompts, providers)
            .await
        {
            Some(classification) => classification,
            None => Classification {
                intent: INTENT_GENERAL_INFO.to_string(),
                confidence: 0.0,
                source: ClassificationSource::Default,
            },
        }
    }

    async fn llm_pass(
        &self,
        message: &str,
        history_text: &str,
        context_json: &str,
        prompts: &PromptRegistry,
        providers: &ProviderRegistry,
    ) -> Option<Classification> {
        let mut vars = HashMap::new();
        vars.insert("message".to_string(), message.to_string());
        vars.insert("conversation_history".to_string(), history_text.to_string());
        vars.insert("current_context".to_string(), context_json.to_string());

        let prompt = match prompts.render("intent_recognition", &vars) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "intent_recognition template unavailable");
                return None;
            }
        };

        let request = GenerateRequest {
            prompt,
            system_prompt: Some(CLASSIFIER_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.1),
            max_tokens: Some(50),
            ..Default::default()
        };

        // Walk the chain: an out-of-vocabulary answer from one provider
        // moves on to the next, same as a provider error would.
        let mut start_rank = 0;
        loop {
            let outcome = match providers.generate_from(start_rank, request.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "LLM intent classification exhausted providers");
                    return None;
                }
            };

            let intent = normalize_intent(&outcome.response.content);
            if self.vocabulary.contains(&intent) {
                let source = if outcome.provider_rank == 0 {
                    ClassificationSource::LlmPrimary
                } else {
                    ClassificationSource::LlmFallback
                };
                let confidence = match source {
                    ClassificationSource::LlmPrimary => 0.9,
                    _ => 0.7,
                };
                info!(intent, rank = outcome.provider_rank, "intent classified via LLM");
                return Some(Classification {
                    intent,
                    confidence,
                    source,
                });
            }

            warn!(
                raw = %outcome.response.content,
                rank = outcome.provider_rank,
                "LLM returned out-of-vocabulary intent"
            );
            start_rank = outcome.provider_rank + 1;
        }
    }
}

/// Trim, lowercase, and strip punctuation from a model answer.
fn normalize_intent(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_outranks_booking() {
        let classifier = IntentClassifier::with_default_rules();
        let intent = classifier
            .pattern_pass("I have chest pain - please book me in")
            .unwrap();
        assert_eq!(intent, INTENT_MEDICAL_EMERGENCY);
    }

    #[test]
    fn booking_keywords_match_on_word_boundaries() {
        let classifier = IntentClassifier::with_default_rules();
        assert_eq!(
            classifier.pattern_pass("I want to book an appointment with cardiology"),
            Some("appointment_booking")
        );
        // "rebooking" must not match the bare keyword "book".
        assert_eq!(classifier.pattern_pass("my rebooking went through"), None);
    }

    #[test]
    fn modify_keywords_fire_after_booking_rules() {
        let classifier = IntentClassifier::with_default_rules();
        // "cancel my appointment" hits the booking rule first ("appointment"),
        // matching the declared order.
        assert_eq!(
            classifier.pattern_pass("cancel my appointment"),
            Some("appointment_booking")
        );
        assert_eq!(
            classifier.pattern_pass("I need to cancel tomorrow"),
            Some("appointment_modify")
        );
    }

    #[test]
    fn no_rule_match_returns_none() {
        let classifier = IntentClassifier::with_default_rules();
        assert_eq!(classifier.pattern_pass("what are your visiting hours?"), None);
    }

    #[test]
    fn custom_regex_rule_matches() {
        let classifier = IntentClassifier::from_rules(&[IntentRuleConfig {
            intent: "pre_admission".into(),
            keywords: vec![],
            pattern: Some(r"(?i)\bcheck[- ]?in\b".into()),
        }])
        .unwrap();
        assert_eq!(
            classifier.pattern_pass("when is my check-in?"),
            Some("pre_admission")
        );
    }

    #[test]
    fn bad_regex_in_rules_is_a_config_error() {
        let result = IntentClassifier::from_rules(&[IntentRuleConfig {
            intent: "x".into(),
            keywords: vec![],
            pattern: Some("(unclosed".into()),
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn normalization_strips_noise() {
        assert_eq!(normalize_intent("  Appointment_Booking.\n"), "appointment_booking");
        assert_eq!(normalize_intent("'general_info'"), "general_info");
        assert_eq!(normalize_intent("I think it's booking"), "ithinkitsbooking");
    }

    #[test]
    fn vocabulary_includes_general_info() {
        let classifier = IntentClassifier::with_default_rules();
        assert!(classifier.vocabulary.contains(INTENT_GENERAL_INFO));
        assert!(classifier.vocabulary.contains(INTENT_MEDICAL_EMERGENCY));
    }
}
