use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::extraction::DocExtraction;

/// One resolved entity across the corpus. Resolution is case-insensitive on
/// the name; the display name keeps the first spelling seen.
#[derive(Debug, Default)]
pub struct EntityNode {
    pub name: String,
    pub kinds: HashSet<String>,
    pub docs: HashSet<String>,
    pub authors: HashSet<String>,
    pub mention_count: usize,
    pub latest_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DecisionRecord {
    pub text: String,
    pub doc_id: String,
    pub doc_title: String,
    pub has_rationale: bool,
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub text: String,
    pub doc_id: String,
    pub doc_title: String,
}

#[derive(Debug)]
pub struct ClaimRecord {
    pub text: String,
    pub doc_id: String,
    pub negated: bool,
}

#[derive(Debug, Default)]
pub struct TermStats {
    pub term: String,
    pub uses: usize,
    pub docs: HashSet<String>,
    pub defined: bool,
}

#[derive(Debug)]
pub struct DependencyRecord {
    pub doc_id: String,
    pub target: String,
}

/// Corpus-level knowledge graph assembled from per-document extractions.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    pub entities: HashMap<String, EntityNode>,
    pub decisions: Vec<DecisionRecord>,
    pub processes: Vec<ProcessRecord>,
    pub claims: Vec<ClaimRecord>,
    pub terms: HashMap<String, TermStats>,
    pub dependencies: Vec<DependencyRecord>,
    pub documents: usize,
    pub newest_doc: Option<DateTime<Utc>>,
}

pub fn assemble(extractions: &[DocExtraction]) -> KnowledgeGraph {
    let mut graph = KnowledgeGraph {
        documents: extractions.len(),
        ..Default::default()
    };

    for extraction in extractions {
        graph.newest_doc = graph.newest_doc.max(extraction.created_at);

        for entity in &extraction.entities {
            if entity.name.trim().is_empty() {
                continue;
            }
            let key = entity.name.to_lowercase();
            let node = graph.entities.entry(key).or_default();
            if node.name.is_empty() {
                node.name = entity.name.clone();
            }
            if !entity.kind.is_empty() {
                node.kinds.insert(entity.kind.to_lowercase());
            }
            node.docs.insert(extraction.doc_id.clone());
            if let Some(author) = &extraction.author {
                node.authors.insert(author.clone());
            }
            node.mention_count = node.mention_count.saturating_add(1);
            node.latest_seen = node.latest_seen.max(extraction.created_at);
        }

        for decision in &extraction.decisions {
            if decision.text.trim().is_empty() {
                continue;
            }
            graph.decisions.push(DecisionRecord {
                text: decision.text.clone(),
                doc_id: extraction.doc_id.clone(),
                doc_title: extraction.title.clone(),
                has_rationale: decision.has_rationale,
            });
        }

        for process in &extraction.processes {
            if process.trim().is_empty() {
                continue;
            }
            graph.processes.push(ProcessRecord {
                text: process.clone(),
                doc_id: extraction.doc_id.clone(),
                doc_title: extraction.title.clone(),
            });
        }

        for claim in &extraction.claims {
            if claim.trim().is_empty() {
                continue;
            }
            let negated = claim.to_lowercase().contains("not ")
                || claim.to_lowercase().contains("never ")
                || claim.to_lowercase().contains("deprecated");
            graph.claims.push(ClaimRecord {
                text: claim.clone(),
                doc_id: extraction.doc_id.clone(),
                negated,
            });
        }

        for term in &extraction.terms {
            if term.trim().is_empty() {
                continue;
            }
            let key = term.to_lowercase();
            let stats = graph.terms.entry(key).or_default();
            if stats.term.is_empty() {
                stats.term = term.clone();
            }
            stats.uses = stats.uses.saturating_add(1);
            stats.docs.insert(extraction.doc_id.clone());
        }

        for dependency in &extraction.dependencies {
            if dependency.trim().is_empty() {
                continue;
            }
            graph.dependencies.push(DependencyRecord {
                doc_id: extraction.doc_id.clone(),
                target: dependency.clone(),
            });
        }
    }

    // A term counts as defined when some entity or claim explains it. Here:
    // when it also shows up as a multi-doc entity, someone wrote about it.
    for stats in graph.terms.values_mut() {
        if let Some(entity) = graph.entities.get(&stats.term.to_lowercase()) {
            stats.defined = entity.docs.len() > 1;
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::v3::extraction::{ExtractedDecision, ExtractedEntity};

    fn extraction(doc_id: &str, author: &str, entity: &str) -> DocExtraction {
        DocExtraction {
            doc_id: doc_id.to_string(),
            title: format!("Doc {doc_id}"),
            author: Some(author.to_string()),
            created_at: Some(Utc::now()),
            entities: vec![ExtractedEntity {
                name: entity.to_string(),
                kind: "system".to_string(),
            }],
            decisions: vec![ExtractedDecision {
                text: format!("chose {entity}"),
                has_rationale: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn entity_resolution_is_case_insensitive() {
        let extractions = vec![
            extraction("d1", "ada", "Redis"),
            extraction("d2", "sam", "redis"),
        ];
        let graph = assemble(&extractions);

        assert_eq!(graph.entities.len(), 1);
        let node = graph.entities.get("redis").expect("resolved entity");
        assert_eq!(node.name, "Redis");
        assert_eq!(node.docs.len(), 2);
        assert_eq!(node.authors.len(), 2);
        assert_eq!(node.mention_count, 2);
        assert_eq!(graph.decisions.len(), 2);
        assert_eq!(graph.documents, 2);
    }
}
