//! Default content processor.
//!
//! Classifies a record into a [`ConversationType`] from keyword hits plus
//! structural hints, then renders markdown (metadata, body, key points, tags)
//! and the reference metadata object the destination stores alongside it.

use chrono::Timelike;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;

use super::{Transform, Transformed};
use crate::record::{ContentNode, Record};

const MEETING_KEYWORDS: &[&str] = &[
    "meeting", "standup", "sync", "1:1", "review", "retrospective", "planning", "kickoff", "demo",
    "presentation", "interview", "call", "conference", "discussion", "session",
];

const TECHNICAL_KEYWORDS: &[&str] = &[
    "code", "debug", "api", "database", "deploy", "deployment", "bug", "fix", "feature",
    "implementation", "architecture", "system", "server", "client", "framework", "library",
    "programming", "development", "software", "technical", "infrastructure", "devops", "ci/cd",
    "testing",
];

const DECISION_KEYWORDS: &[&str] = &[
    "decision", "decided", "plan", "strategy", "approach", "solution", "recommendation",
    "proposal", "choice", "option", "alternative", "conclusion", "resolution", "agreement",
    "consensus", "direction", "path forward",
];

const PERSONAL_KEYWORDS: &[&str] = &[
    "personal", "family", "friend", "relationship", "health", "hobby", "interest", "vacation",
    "travel", "weekend", "evening", "morning", "lunch", "dinner", "coffee", "casual", "informal",
    "private",
];

const KEY_POINT_MARKERS: &[&str] = &["important", "key", "main", "primary", "decision", "conclusion"];

/// Characters of body text considered during classification.
const CLASSIFY_WINDOW: usize = 500;
/// Minimum winning score; anything lower is a plain conversation.
const MIN_CONFIDENCE: f64 = 0.3;
const MAX_KEY_POINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    Meeting,
    Technical,
    Decision,
    Personal,
    Conversation,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meeting => "MEETING",
            Self::Technical => "TECHNICAL",
            Self::Decision => "DECISION",
            Self::Personal => "PERSONAL",
            Self::Conversation => "CONVERSATION",
        }
    }
}

impl std::fmt::Display for ConversationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a record's content tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentStructure {
    pub heading_count: u32,
    pub speaker_changes: u32,
    pub has_user_speech: bool,
    /// Node types in order of first appearance.
    pub content_types: Vec<String>,
    pub total_nodes: u32,
}

impl ContentStructure {
    pub fn analyze(record: &Record) -> Self {
        let mut structure = Self::default();
        let mut previous_speaker: Option<&str> = None;

        for node in record.nodes() {
            structure.total_nodes += 1;
            if !structure.content_types.contains(&node.node_type) {
                structure.content_types.push(node.node_type.clone());
            }
            if node.node_type.starts_with("heading") {
                structure.heading_count += 1;
            }
            if let Some(speaker) = node.speaker_name.as_deref() {
                if previous_speaker.is_some_and(|prev| prev != speaker) {
                    structure.speaker_changes += 1;
                }
                previous_speaker = Some(speaker);
            }
            if node.is_user() {
                structure.has_user_speech = true;
            }
        }
        structure
    }
}

/// Keyword and structure based processor. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentProcessor;

impl ContentProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, record: &Record, structure: &ContentStructure) -> ConversationType {
        let body: String = plain_text(record).to_lowercase().chars().take(CLASSIFY_WINDOW).collect();
        let text = format!("{} {body}", record.title.to_lowercase());

        let mut scores = [
            (ConversationType::Meeting, keyword_score(&text, MEETING_KEYWORDS)),
            (ConversationType::Technical, keyword_score(&text, TECHNICAL_KEYWORDS)),
            (ConversationType::Decision, keyword_score(&text, DECISION_KEYWORDS)),
            (ConversationType::Personal, keyword_score(&text, PERSONAL_KEYWORDS)),
        ];

        let duration = record.duration_minutes();
        if structure.speaker_changes >= 2 {
            scores[0].1 += 0.3;
        }
        if structure.heading_count >= 3 {
            scores[1].1 += 0.2;
            scores[2].1 += 0.2;
        }
        if structure.has_user_speech {
            scores[0].1 += 0.1;
        }
        if duration >= 30 {
            scores[0].1 += 0.2;
        }
        if duration <= 5 {
            scores[3].1 += 0.1;
        }

        // First maximum wins ties.
        let (best, score) = scores
            .iter()
            .copied()
            .fold((ConversationType::Conversation, f64::MIN), |acc, cur| {
                if cur.1 > acc.1 {
                    cur
                } else {
                    acc
                }
            });

        if score >= MIN_CONFIDENCE {
            best
        } else {
            ConversationType::Conversation
        }
    }

    fn render(
        &self,
        record: &Record,
        kind: ConversationType,
        speakers: &[String],
        structure: &ContentStructure,
    ) -> String {
        let duration = record.duration_minutes();
        let mut lines: Vec<String> = vec![
            format!("# {}", record.title),
            String::new(),
            "## Metadata".to_string(),
            format!("**Date:** {}", record.start_time.format("%Y-%m-%d %H:%M")),
            format!("**Duration:** {duration} minutes"),
            format!("**Type:** {kind}"),
        ];
        if record.is_starred {
            lines.push("**Status:** ⭐ STARRED".to_string());
        }
        if !speakers.is_empty() {
            lines.push(format!("**Participants:** {}", speakers.join(", ")));
        }
        lines.push(String::new());

        match record.markdown.as_deref().filter(|md| !md.trim().is_empty()) {
            Some(markdown) => {
                lines.push("## Content".to_string());
                lines.push(String::new());
                lines.push(markdown.to_string());
            }
            None if !record.contents.is_empty() => {
                lines.push("## Conversation".to_string());
                lines.push(String::new());
                render_nodes(&record.contents, &mut lines);
            }
            None => {
                lines.push("## Content".to_string());
                lines.push("*No content available*".to_string());
            }
        }
        lines.push(String::new());

        if duration >= 10 && structure.heading_count > 0 {
            lines.push("## Key Points".to_string());
            let points = key_points(record);
            if !points.is_empty() {
                lines.extend(points.into_iter().take(MAX_KEY_POINTS).map(|p| format!("- {p}")));
                lines.push(String::new());
            }
        }

        lines.push("---".to_string());
        lines.push(String::new());
        lines.push(format!("**Tags:** {}", tags(record, kind, speakers).join(", ")));

        lines.join("\n")
    }

    fn reference(
        &self,
        record: &Record,
        kind: ConversationType,
        speakers: &[String],
        structure: &ContentStructure,
    ) -> serde_json::Value {
        let url = format!("limitless://lifelog/{}", record.id);
        let title = format!("Limitless Lifelog - {kind}");
        json!({
            "source": {
                "platform": "limitless_pendant",
                "type": "application_plugin",
                "version": "1.0",
                "url": url,
                "title": title,
            },
            "content_context": {
                "url": url,
                "title": title,
                "additional_context": {
                    "lifelog_id": record.id,
                    "duration_minutes": record.duration_minutes(),
                    "is_starred": record.is_starred,
                    "speakers": speakers,
                    "start_time": record.start_time.to_rfc3339(),
                    "end_time": record.end_time.to_rfc3339(),
                    "conversation_type": kind,
                    "content_structure": structure,
                },
            },
        })
    }
}

impl Transform for ContentProcessor {
    fn transform(&self, record: &Record) -> anyhow::Result<Transformed> {
        let structure = ContentStructure::analyze(record);
        let kind = self.classify(record, &structure);
        let speakers = speakers(record);

        let content = self.render(record, kind, &speakers, &structure);
        let reference = self.reference(record, kind, &speakers, &structure);

        tracing::debug!(
            record_id = %record.id,
            conversation_type = %kind,
            speakers = speakers.len(),
            duration_minutes = record.duration_minutes(),
            "record transformed"
        );
        Ok(Transformed { content, reference })
    }
}

/// Unique speaker names, sorted.
fn speakers(record: &Record) -> Vec<String> {
    record
        .nodes()
        .filter_map(|n| n.speaker_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn plain_text(record: &Record) -> String {
    record
        .nodes()
        .map(|n| n.content.as_str())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fraction of the keyword set present as whole words, plus up to 0.5 for
/// repeated occurrences.
fn keyword_score(text: &str, keywords: &[&str]) -> f64 {
    let words: BTreeSet<&str> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let matched: Vec<&str> = keywords.iter().copied().filter(|k| words.contains(k)).collect();
    if keywords.is_empty() {
        return 0.0;
    }

    let base = matched.len() as f64 / keywords.len() as f64;
    let occurrences: usize = matched.iter().map(|k| text.matches(k).count()).sum();
    base + (occurrences as f64 * 0.1).min(0.5)
}

fn render_nodes(nodes: &[ContentNode], lines: &mut Vec<String>) {
    for node in nodes {
        if !node.content.trim().is_empty() {
            let mut line = match (node.node_type.as_str(), node.speaker_name.as_deref()) {
                ("heading1", _) => format!("### {}", node.content),
                ("heading2", _) => format!("#### {}", node.content),
                ("heading3", _) => format!("##### {}", node.content),
                (_, Some(speaker)) => format!("**{speaker}:** {}", node.content),
                ("blockquote", None) => format!("> {}", node.content),
                (_, None) => node.content.clone(),
            };
            if let Some(start) = node.start_time {
                line.push_str(&format!(" *({:02}:{:02})*", start.hour(), start.minute()));
            }
            lines.push(line);
            lines.push(String::new());
        }
        render_nodes(&node.children, lines);
    }
}

fn key_points(record: &Record) -> Vec<String> {
    record
        .nodes()
        .filter_map(|node| {
            let content = node.content.trim();
            if node.node_type.starts_with("heading") && !content.is_empty() {
                return Some(content.to_string());
            }
            let lowered = node.content.to_lowercase();
            let long_and_marked = node.content.chars().count() > 50
                && KEY_POINT_MARKERS.iter().any(|m| lowered.contains(m));
            if !long_and_marked {
                return None;
            }
            if content.chars().count() > 100 {
                Some(format!("{}...", content.chars().take(97).collect::<String>()))
            } else {
                Some(content.to_string())
            }
        })
        .collect()
}

fn tags(record: &Record, kind: ConversationType, speakers: &[String]) -> Vec<String> {
    let start = record.start_time;
    let mut tags: Vec<String> = vec![
        "limitless".into(),
        "pendant".into(),
        "lifelog".into(),
        kind.as_str().to_lowercase(),
        start.format("%B-%Y").to_string().to_lowercase(),
        start.format("%Y").to_string(),
        start.format("%A").to_string().to_lowercase(),
    ];

    tags.push(
        match start.hour() {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        }
        .into(),
    );

    let duration = record.duration_minutes();
    if duration < 5 {
        tags.push("short".into());
    } else if duration > 30 {
        tags.push("long".into());
    }

    match speakers.len() {
        0 => tags.push("monologue".into()),
        1 => {}
        2 => tags.push("dialogue".into()),
        _ => tags.push("group".into()),
    }

    if record.is_starred {
        tags.push("starred".into());
        tags.push("important".into());
    }
    tags
}
