//! Default content analyzer: weighted phrase scans over the payload text.
//!
//! Scores start from a per-format baseline and lose a share of each
//! rule's impact per match, saturating after a few matches. The result is
//! clamped to `0.0..=1.0` and mapped to an assessment label.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::InfraError;
use crate::worker::{Analyzer, TaskOptions};

/// Texts with fewer words than this get a low-confidence score.
const MIN_RELIABLE_WORDS: usize = 50;
/// Texts with more words than this get an imprecision finding.
const MAX_PRECISE_WORDS: usize = 10_000;
/// HTML with more comments than this is flagged.
const MAX_HTML_COMMENTS: usize = 10;

/// How much a finding lowered the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    /// Small impact.
    Low,
    /// Larger impact.
    Medium,
}

/// One observation made while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule label, e.g. `sensational_language`.
    pub kind: String,
    /// Human-readable summary.
    pub description: String,
    /// Impact class.
    pub severity: FindingSeverity,
}

/// Analyzer output for one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Authenticity score in `0.0..=1.0`.
    pub score: f64,
    /// Confidence in `0.1..=1.0`.
    pub confidence: f64,
    /// Label derived from the score.
    pub assessment: String,
    /// Observations.
    pub findings: Vec<Finding>,
}

/// Maps a score to its assessment label.
#[must_use]
pub fn assessment_for(score: f64) -> &'static str {
    if score >= 0.9 {
        "Highly Authentic"
    } else if score >= 0.7 {
        "Likely Authentic"
    } else if score >= 0.5 {
        "Uncertain"
    } else if score >= 0.3 {
        "Likely Misinformation"
    } else {
        "Highly Suspect"
    }
}

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    label: &'static str,
    impact: f64,
    saturation: usize,
    medium_above: f64,
}

impl Rule {
    fn new(
        pattern: &str,
        label: &'static str,
        impact: f64,
        saturation: usize,
        medium_above: f64,
    ) -> Result<Self, InfraError> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| InfraError::Internal(format!("bad {label} pattern: {e}")))?;
        Ok(Self {
            pattern,
            label,
            impact,
            saturation,
            medium_above,
        })
    }

    /// Applies the rule, returning the score penalty and a finding if it
    /// matched.
    fn apply(&self, text: &str) -> Option<(f64, Finding)> {
        let matches = self.pattern.find_iter(text).count();
        if matches == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let penalty = self.impact * matches.min(self.saturation) as f64 / self.saturation as f64;
        let severity = if self.impact > self.medium_above {
            FindingSeverity::Medium
        } else {
            FindingSeverity::Low
        };
        Some((
            penalty,
            Finding {
                kind: self.label.to_string(),
                description: format!("Detected {matches} instances of {}", self.label),
                severity,
            },
        ))
    }
}

/// Phrase-pattern analyzer for plain text and HTML payloads.
#[derive(Debug)]
pub struct PhraseScanAnalyzer {
    text_rules: Vec<Rule>,
    html_rules: Vec<Rule>,
}

impl PhraseScanAnalyzer {
    /// Compiles the rule set.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Internal`] if a pattern fails to compile.
    pub fn new() -> Result<Self, InfraError> {
        Ok(Self {
            text_rules: vec![
                Rule::new(r"\b(breaking news|urgent|shocking)\b", "sensational_language", 0.3, 5, 0.3)?,
                Rule::new(r"\b(unconfirmed|alleged|reportedly)\b", "uncertain_claims", 0.2, 5, 0.3)?,
                Rule::new(r"\b(expert says|scientists agree)\b", "vague_authority", 0.25, 5, 0.3)?,
                Rule::new(r"(\b99%|\b(all|none|everyone|nobody)\b)", "absolute_claims", 0.35, 5, 0.3)?,
            ],
            html_rules: vec![
                Rule::new(r"<script[^>]*>.*?</script>", "embedded_scripts", 0.2, 3, 0.2)?,
                Rule::new(r"\son\w+\s*=", "inline_event_handlers", 0.15, 3, 0.2)?,
                Rule::new(r"<iframe[^>]*>", "embedded_iframes", 0.25, 3, 0.2)?,
                Rule::new(r"<meta[^>]*refresh[^>]*>", "auto_refresh", 0.3, 3, 0.2)?,
            ],
        })
    }

    fn scan_text(&self, text: &str) -> Analysis {
        let mut score = 0.85;
        let mut confidence = 0.9;
        let mut findings = Vec::new();
        for rule in &self.text_rules {
            if let Some((penalty, finding)) = rule.apply(text) {
                score -= penalty;
                findings.push(finding);
            }
        }
        let words = text.split_whitespace().count();
        if words < MIN_RELIABLE_WORDS {
            findings.push(Finding {
                kind: "insufficient_content".to_string(),
                description: "Content too short for reliable verification".to_string(),
                severity: FindingSeverity::Low,
            });
            confidence = 0.5;
        } else if words > MAX_PRECISE_WORDS {
            findings.push(Finding {
                kind: "excessive_content".to_string(),
                description: "Content very long, analysis may be less precise".to_string(),
                severity: FindingSeverity::Low,
            });
        }
        finish(score, confidence, findings)
    }

    fn scan_html(&self, html: &str) -> Analysis {
        let mut score = 0.8;
        let mut findings = Vec::new();
        for rule in &self.html_rules {
            if let Some((penalty, finding)) = rule.apply(html) {
                score -= penalty;
                findings.push(finding);
            }
        }
        let comments = html.matches("<!--").count();
        if comments > MAX_HTML_COMMENTS {
            findings.push(Finding {
                kind: "excessive_comments".to_string(),
                description: format!(
                    "Found {comments} HTML comments, possibly indicating content manipulation"
                ),
                severity: FindingSeverity::Medium,
            });
            score -= 0.1;
        }
        finish(score, 0.85, findings)
    }
}

fn finish(score: f64, confidence: f64, findings: Vec<Finding>) -> Analysis {
    let score = score.clamp(0.0, 1.0);
    Analysis {
        score,
        confidence: confidence.max(0.1),
        assessment: assessment_for(score).to_string(),
        findings,
    }
}

impl Analyzer for PhraseScanAnalyzer {
    type Output = Analysis;

    fn analyze(&self, content: &[u8], options: &TaskOptions) -> Analysis {
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("text/plain")
            .to_ascii_lowercase();
        let text = String::from_utf8_lossy(content);
        if content_type.starts_with("text/html") || content_type == "application/xhtml+xml" {
            self.scan_html(&text)
        } else if content_type.starts_with("text/") || content_type == "application/json" {
            self.scan_text(&text)
        } else {
            finish(
                0.5,
                0.1,
                vec![Finding {
                    kind: "unsupported_content_type".to_string(),
                    description: format!("No analyzer for {content_type}"),
                    severity: FindingSeverity::Low,
                }],
            )
        }
    }
}
