use crate::models::DealType;
use serde::Deserialize;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReviewerRulesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One routing rule. Unset fields match anything.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReviewerRule {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub deal: Option<DealType>,
    #[serde(default)]
    pub submitter: Option<String>,
    pub reviewer_id: String,
}

impl ReviewerRule {
    fn matches(&self, region: Option<&str>, deal: DealType, submitter: Option<&str>) -> bool {
        field_matches(self.region.as_deref(), region)
            && self.deal.is_none_or(|d| d == deal)
            && field_matches(self.submitter.as_deref(), submitter)
    }
}

fn field_matches(rule: Option<&str>, value: Option<&str>) -> bool {
    match rule {
        None => true,
        Some(expected) => value.is_some_and(|v| v.trim().eq_ignore_ascii_case(expected.trim())),
    }
}

/// First matching rule wins; `fallback` when none match.
pub fn assign_reviewer<'a>(
    rules: &'a [ReviewerRule],
    fallback: &'a str,
    region: Option<&str>,
    deal: DealType,
    submitter: Option<&str>,
) -> &'a str {
    rules
        .iter()
        .find(|rule| rule.matches(region, deal, submitter))
        .map(|rule| rule.reviewer_id.as_str())
        .unwrap_or(fallback)
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    rules: Vec<ReviewerRule>,
}

#[derive(Debug, Clone)]
pub struct ReviewerRules {
    rules: Vec<ReviewerRule>,
    fallback: String,
}

impl ReviewerRules {
    pub fn new(rules: Vec<ReviewerRule>, fallback: impl Into<String>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| {
                let valid = Uuid::try_parse(&rule.reviewer_id).is_ok();
                if !valid {
                    warn!(
                        target = "realty.publisher",
                        reviewer_id = %rule.reviewer_id,
                        "reviewer_rule_ignored_invalid_id"
                    );
                }
                valid
            })
            .collect();
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    /// Agency routing used when no rules file is configured.
    pub fn builtin(fallback: impl Into<String>) -> Self {
        let rule = |region: Option<&str>, deal: Option<DealType>, submitter: Option<&str>, id: &str| {
            ReviewerRule {
                region: region.map(str::to_string),
                deal,
                submitter: submitter.map(str::to_string),
                reviewer_id: id.to_string(),
            }
        };
        Self::new(
            vec![
                rule(None, None, Some("lead-agent"), "2b7f1c9e-4d3a-4e8b-a1c2-d3e4f5a6b701"),
                rule(Some("Limassol"), Some(DealType::Sale), None, "6c1d2e3f-4a5b-4c6d-8e7f-a0b1c2d3e402"),
                rule(Some("Limassol"), Some(DealType::Rent), None, "7d2e3f4a-5b6c-4d7e-9f80-b1c2d3e4f503"),
                rule(Some("Paphos"), None, None, "8e3f4a5b-6c7d-4e8f-a091-c2d3e4f5a604"),
                rule(Some("Nicosia"), None, None, "9f4a5b6c-7d8e-4f90-b1a2-d3e4f5a6b705"),
                rule(Some("Larnaca"), Some(DealType::Sale), None, "a05b6c7d-8e9f-4a01-82b3-e4f5a6b7c806"),
            ],
            fallback,
        )
    }

    pub fn from_yaml(raw: &str, default_fallback: &str) -> Result<Self, ReviewerRulesError> {
        let file: RulesFile = serde_yaml::from_str(raw)?;
        let fallback = file
            .fallback
            .filter(|f| Uuid::try_parse(f).is_ok())
            .unwrap_or_else(|| default_fallback.to_string());
        Ok(Self::new(file.rules, fallback))
    }

    /// Reads `path` when given; any problem falls back to the built-in table.
    pub fn load(path: Option<&Path>, default_fallback: &str) -> Self {
        let Some(path) = path else {
            return Self::builtin(default_fallback);
        };
        match fs::read_to_string(path)
            .map_err(ReviewerRulesError::from)
            .and_then(|raw| Self::from_yaml(&raw, default_fallback))
        {
            Ok(rules) => {
                info!(
                    target = "realty.publisher",
                    path = %path.display(),
                    rule_count = rules.rules.len(),
                    "reviewer_rules_loaded"
                );
                rules
            }
            Err(err) => {
                warn!(
                    target = "realty.publisher",
                    path = %path.display(),
                    error = %err,
                    "reviewer_rules_unreadable_using_builtin"
                );
                Self::builtin(default_fallback)
            }
        }
    }

    pub fn assign(&self, region: Option<&str>, deal: DealType, submitter: Option<&str>) -> &str {
        assign_reviewer(&self.rules, &self.fallback, region, deal, submitter)
    }

    #[cfg(test)]
    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: &str = "0f6e2d4c-8a1b-4c3d-9e5f-a7b8c9d0e105";

    #[test]
    fn region_and_deal_select_reviewer() {
        let rules = ReviewerRules::builtin(FALLBACK);
        assert_eq!(
            rules.assign(Some("limassol"), DealType::Rent, None),
            "7d2e3f4a-5b6c-4d7e-9f80-b1c2d3e4f503"
        );
        assert_eq!(
            rules.assign(Some("Paphos"), DealType::Rent, Some("someone")),
            "8e3f4a5b-6c7d-4e8f-a091-c2d3e4f5a604"
        );
    }

    #[test]
    fn submitter_rule_takes_precedence() {
        let rules = ReviewerRules::builtin(FALLBACK);
        assert_eq!(
            rules.assign(Some("Paphos"), DealType::Sale, Some("lead-agent")),
            "2b7f1c9e-4d3a-4e8b-a1c2-d3e4f5a6b701"
        );
    }

    #[test]
    fn unmatched_falls_back() {
        let rules = ReviewerRules::builtin(FALLBACK);
        assert_eq!(rules.assign(Some("Larnaca"), DealType::Rent, None), FALLBACK);
        assert_eq!(rules.assign(None, DealType::Sale, None), FALLBACK);
    }

    #[test]
    fn yaml_rules_drop_invalid_ids() {
        let raw = r#"
fallback: "11111111-2222-4333-8444-555555555555"
rules:
  - region: Famagusta
    deal: sale
    reviewer_id: "not-a-uuid"
  - region: Famagusta
    reviewer_id: "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee"
"#;
        let rules = ReviewerRules::from_yaml(raw, FALLBACK).expect("rules");
        assert_eq!(rules.fallback(), "11111111-2222-4333-8444-555555555555");
        assert_eq!(
            rules.assign(Some("Famagusta"), DealType::Sale, None),
            "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee"
        );
    }

    #[test]
    fn unreadable_file_uses_builtin() {
        let rules = ReviewerRules::load(Some(Path::new("/nonexistent/reviewers.yaml")), FALLBACK);
        assert_eq!(rules.fallback(), FALLBACK);
        assert_eq!(
            rules.assign(Some("Nicosia"), DealType::Sale, None),
            "9f4a5b6c-7d8e-4f90-b1a2-d3e4f5a6b705"
        );
    }
}
