use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};

use crate::strategies::truncate;

use super::graph::KnowledgeGraph;

/// Detector output severity; feeds the prioritization score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedGap {
    pub gap_type: &'static str,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub category_label: &'static str,
    pub subject: String,
    pub evidence_docs: Vec<String>,
}

/// Run the eight specialized analyzers over the assembled graph.
pub fn run_all(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    let mut gaps = Vec::new();
    gaps.extend(bus_factor(graph));
    gaps.extend(decision_archaeology(graph));
    gaps.extend(process_completeness(graph));
    gaps.extend(tribal_knowledge(graph));
    gaps.extend(dependency_risk(graph));
    gaps.extend(temporal_staleness(graph));
    gaps.extend(contradiction(graph));
    gaps.extend(onboarding_barrier(graph));
    gaps
}

/// Knowledge concentrated in one head: a well-referenced entity whose every
/// mention traces back to a single author.
fn bus_factor(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    graph
        .entities
        .values()
        .filter(|node| node.mention_count >= 3 && node.authors.len() == 1)
        .map(|node| {
            let author = node.authors.iter().next().cloned().unwrap_or_default();
            DetectedGap {
                gap_type: "bus_factor",
                severity: Severity::Critical,
                title: format!("Only {author} writes about \"{}\"", node.name),
                description: format!(
                    "\"{}\" is referenced {} times across {} document(s), all authored by {author}.",
                    node.name,
                    node.mention_count,
                    node.docs.len()
                ),
                category_label: "relationship",
                subject: node.name.clone(),
                evidence_docs: node.docs.iter().cloned().collect(),
            }
        })
        .collect()
}

/// Decisions recorded without their reasoning.
fn decision_archaeology(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    graph
        .decisions
        .iter()
        .filter(|decision| !decision.has_rationale)
        .map(|decision| DetectedGap {
            gap_type: "decision_archaeology",
            severity: Severity::High,
            title: format!("Decision without rationale in \"{}\"", decision.doc_title),
            description: format!("\"{}\"", truncate(&decision.text, 300)),
            category_label: "rationale",
            subject: truncate(&decision.text, 120),
            evidence_docs: vec![decision.doc_id.clone()],
        })
        .collect()
}

/// Processes referenced without visible steps.
fn process_completeness(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    graph
        .processes
        .iter()
        .filter(|process| {
            let lower = process.text.to_lowercase();
            // Step markers signal the process is actually written out.
            !(lower.contains("1.")
                || lower.contains("first")
                || lower.contains("then")
                || lower.contains("finally"))
        })
        .map(|process| DetectedGap {
            gap_type: "process_completeness",
            severity: Severity::High,
            title: format!("Process referenced but not written down in \"{}\"", process.doc_title),
            description: format!("\"{}\"", truncate(&process.text, 300)),
            category_label: "process",
            subject: truncate(&process.text, 120),
            evidence_docs: vec![process.doc_id.clone()],
        })
        .collect()
}

/// Jargon used repeatedly but never explained anywhere.
fn tribal_knowledge(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    graph
        .terms
        .values()
        .filter(|term| term.uses >= 2 && !term.defined)
        .map(|term| DetectedGap {
            gap_type: "tribal_knowledge",
            severity: Severity::Medium,
            title: format!("\"{}\" is used but never defined", term.term),
            description: format!(
                "The term \"{}\" appears {} times across {} document(s) with no definition in the corpus.",
                term.term,
                term.uses,
                term.docs.len()
            ),
            category_label: "context",
            subject: term.term.clone(),
            evidence_docs: term.docs.iter().cloned().collect(),
        })
        .collect()
}

/// Declared dependencies on systems the corpus says nothing else about.
fn dependency_risk(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    let mut seen: HashSet<String> = HashSet::new();
    graph
        .dependencies
        .iter()
        .filter(|dep| {
            let key = dep.target.to_lowercase();
            let documented = graph
                .entities
                .get(&key)
                .is_some_and(|node| node.docs.len() > 1);
            !documented && seen.insert(key)
        })
        .map(|dep| DetectedGap {
            gap_type: "dependency_risk",
            severity: Severity::High,
            title: format!("Dependency \"{}\" is otherwise undocumented", dep.target),
            description: format!(
                "Something depends on \"{}\", yet the corpus holds no other knowledge about it.",
                dep.target
            ),
            category_label: "technical",
            subject: dep.target.clone(),
            evidence_docs: vec![dep.doc_id.clone()],
        })
        .collect()
}

/// Entities whose written knowledge has gone stale.
fn temporal_staleness(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    let cutoff = Utc::now() - Duration::days(365);
    graph
        .entities
        .values()
        .filter(|node| {
            node.mention_count >= 2
                && node
                    .latest_seen
                    .is_some_and(|latest| latest < cutoff)
        })
        .map(|node| DetectedGap {
            gap_type: "temporal_staleness",
            severity: Severity::Medium,
            title: format!("Knowledge about \"{}\" may be stale", node.name),
            description: format!(
                "The most recent document mentioning \"{}\" is over a year old.",
                node.name
            ),
            category_label: "timeline",
            subject: node.name.clone(),
            evidence_docs: node.docs.iter().cloned().collect(),
        })
        .collect()
}

/// Claims asserted with opposite polarity in different documents.
fn contradiction(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    let mut by_subject: HashMap<String, (Vec<&super::graph::ClaimRecord>, Vec<&super::graph::ClaimRecord>)> =
        HashMap::new();

    for claim in &graph.claims {
        // Subject approximation: the first capitalized token of the claim.
        let Some(subject) = claim
            .text
            .split_whitespace()
            .find(|word| word.chars().next().is_some_and(char::is_uppercase) && word.len() > 2)
        else {
            continue;
        };
        let entry = by_subject.entry(subject.to_lowercase()).or_default();
        if claim.negated {
            entry.1.push(claim);
        } else {
            entry.0.push(claim);
        }
    }

    by_subject
        .into_iter()
        .filter_map(|(subject, (positive, negative))| {
            let pos = positive.first()?;
            let neg = negative.first()?;
            if pos.doc_id == neg.doc_id {
                return None;
            }
            Some(DetectedGap {
                gap_type: "contradiction",
                severity: Severity::Critical,
                title: format!("Documents disagree about \"{subject}\""),
                description: format!(
                    "\"{}\" vs \"{}\"",
                    truncate(&pos.text, 200),
                    truncate(&neg.text, 200)
                ),
                category_label: "context",
                subject,
                evidence_docs: vec![pos.doc_id.clone(), neg.doc_id.clone()],
            })
        })
        .collect()
}

/// Heavy undefined-jargon load is itself an onboarding barrier.
fn onboarding_barrier(graph: &KnowledgeGraph) -> Vec<DetectedGap> {
    let undefined: Vec<&str> = graph
        .terms
        .values()
        .filter(|t| !t.defined && t.uses >= 2)
        .map(|t| t.term.as_str())
        .collect();

    if undefined.len() < 5 {
        return Vec::new();
    }

    let mut sample: Vec<&str> = undefined;
    sample.sort_unstable();
    sample.truncate(10);

    vec![DetectedGap {
        gap_type: "onboarding_barrier",
        severity: Severity::High,
        title: "Vocabulary barrier for new hires".to_string(),
        description: format!(
            "{} recurring terms have no definition anywhere; a new hire meets them with no glossary (sample: {}).",
            sample.len(),
            sample.join(", ")
        ),
        category_label: "context",
        subject: "glossary".to_string(),
        evidence_docs: Vec::new(),
    }]
}
