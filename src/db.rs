//! In-memory search database for replicated documentation pages.
//!
//! Holds the local copy of the remote `page` and `page_section` tables and
//! answers dot-product similarity queries over section embeddings. The store
//! is created fresh on every worker bootstrap and never persisted; it is a
//! read replica and is never written back to the remote source.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Embedding dimension of the documentation corpus (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Structured metadata stored in a page's JSON `meta` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One documentation page, as replicated from the remote `page` table.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub id: i64,
    pub path: String,
    #[serde(default)]
    pub meta: Option<PageMeta>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// One addressable heading within a page, as replicated from `page_section`.
#[derive(Debug, Clone, Deserialize)]
pub struct PageSection {
    pub id: i64,
    pub page_id: i64,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub rag_ignore: bool,
    #[serde(rename = "hf_embedding", deserialize_with = "deserialize_embedding")]
    pub embedding: Vec<f32>,
}

/// A section that cleared the similarity threshold, in rank order.
#[derive(Debug, Clone)]
pub struct SectionHit {
    pub section_id: i64,
    pub page_id: i64,
    pub heading: Option<String>,
    pub slug: Option<String>,
    /// Dot product against the query embedding. Both sides are unit
    /// normalized, so this approximates cosine similarity. The remote
    /// engine reports the same quantity negated.
    pub score: f32,
}

/// Page-level aggregate returned to the host: the page's metadata plus the
/// ordered heading/slug pairs of its matching sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMatch {
    pub id: i64,
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    #[serde(default)]
    pub slugs: Vec<String>,
}

/// Errors that can occur storing or matching against the local replica.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot store or match a zero-norm embedding")]
    ZeroNormVector,
}

/// The embedded search database: `page` and `page_section` keyed by id.
///
/// Referential integrity is not enforced at insert; replication order
/// (pages before sections) makes dangling sections unlikely, and any that
/// slip through are dropped at aggregation time.
pub struct SearchDb {
    pages: HashMap<i64, Page>,
    sections: HashMap<i64, PageSection>,
    dimensions: usize,
}

impl SearchDb {
    pub fn new(dimensions: usize) -> Self {
        Self {
            pages: HashMap::new(),
            sections: HashMap::new(),
            dimensions,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Insert or replace a page.
    pub fn insert_page(&mut self, page: Page) {
        self.pages.insert(page.id, page);
    }

    /// Insert or replace a section.
    ///
    /// Rejects embeddings whose dimension does not match the store and
    /// zero-norm embeddings, which cannot participate in similarity.
    pub fn insert_section(&mut self, section: PageSection) -> Result<(), DbError> {
        if section.embedding.len() != self.dimensions {
            return Err(DbError::DimensionMismatch {
                expected: self.dimensions,
                got: section.embedding.len(),
            });
        }

        if l2_norm(&section.embedding) < f32::EPSILON {
            return Err(DbError::ZeroNormVector);
        }

        self.sections.insert(section.id, section);
        Ok(())
    }

    /// Find the sections most similar to `query`.
    ///
    /// Sections score `query . embedding`; those at or below `threshold`
    /// are dropped, the rest are sorted by score descending (section id as
    /// the deterministic tie-break) and truncated to `limit`.
    ///
    /// `include_ignored` keeps sections flagged `rag_ignore`, matching the
    /// behavior observed in the original retrieval query; pass `false` to
    /// filter them out.
    pub fn match_sections(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
        include_ignored: bool,
    ) -> Result<Vec<SectionHit>, DbError> {
        if query.len() != self.dimensions {
            return Err(DbError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if l2_norm(query) < f32::EPSILON {
            return Err(DbError::ZeroNormVector);
        }

        let mut hits: Vec<SectionHit> = self
            .sections
            .values()
            .filter(|section| include_ignored || !section.rag_ignore)
            .filter_map(|section| {
                let score = dot(query, &section.embedding);
                if score > threshold {
                    Some(SectionHit {
                        section_id: section.id,
                        page_id: section.page_id,
                        heading: section.heading.clone(),
                        slug: section.slug.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.section_id.cmp(&b.section_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    /// Group ranked hits by page, preserving rank order.
    ///
    /// The first hit for a page fixes the page's position in the output;
    /// later hits for the same page append their heading/slug pair.
    pub fn aggregate(&self, hits: &[SectionHit]) -> Vec<PageMatch> {
        let mut order: Vec<i64> = Vec::new();
        let mut by_page: HashMap<i64, PageMatch> = HashMap::new();

        for hit in hits {
            let Some(page) = self.pages.get(&hit.page_id) else {
                log::warn!(
                    "section {} references missing page {}, dropping from results",
                    hit.section_id,
                    hit.page_id
                );
                continue;
            };

            let entry = by_page.entry(hit.page_id).or_insert_with(|| {
                order.push(hit.page_id);
                let meta = page.meta.clone().unwrap_or_default();
                PageMatch {
                    id: page.id,
                    path: page.path.clone(),
                    kind: page.kind.clone(),
                    title: meta.title,
                    subtitle: meta.subtitle,
                    description: meta.description,
                    headings: Vec::new(),
                    slugs: Vec::new(),
                }
            });

            if let Some(heading) = &hit.heading {
                entry.headings.push(heading.clone());
            }
            if let Some(slug) = &hit.slug {
                entry.slugs.push(slug.clone());
            }
        }

        order
            .into_iter()
            .filter_map(|id| by_page.remove(&id))
            .collect()
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `rag_ignore` is nullable in the remote schema; treat null as false.
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Vector columns arrive as JSON arrays from some deployments and as
/// `"[0.1,0.2,..]"` strings from others; accept both.
fn deserialize_embedding<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Floats(Vec<f32>),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Floats(v) => Ok(v),
        Raw::Text(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(id: i64, path: &str, title: &str) -> Page {
        Page {
            id,
            path: path.to_string(),
            meta: Some(PageMeta {
                title: Some(title.to_string()),
                subtitle: None,
                description: None,
            }),
            kind: Some("guide".to_string()),
            source: None,
        }
    }

    fn section(id: i64, page_id: i64, slug: &str, embedding: Vec<f32>) -> PageSection {
        PageSection {
            id,
            page_id,
            slug: Some(slug.to_string()),
            heading: Some(format!("heading-{id}")),
            rag_ignore: false,
            embedding,
        }
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut db = SearchDb::new(3);
        let result = db.insert_section(section(1, 1, "a", vec![1.0, 0.0, 0.0, 0.0]));
        assert!(matches!(result, Err(DbError::DimensionMismatch { .. })));
        assert_eq!(db.section_count(), 0);
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut db = SearchDb::new(3);
        let result = db.insert_section(section(1, 1, "a", vec![0.0, 0.0, 0.0]));
        assert!(matches!(result, Err(DbError::ZeroNormVector)));
    }

    #[test]
    fn test_match_orders_by_score_descending() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        db.insert_section(section(10, 1, "exact", vec![1.0, 0.0, 0.0]))
            .unwrap();
        db.insert_section(section(11, 1, "close", vec![0.9, 0.1, 0.0]))
            .unwrap();
        db.insert_section(section(12, 1, "far", vec![0.0, 1.0, 0.0]))
            .unwrap();

        let hits = db
            .match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true)
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].section_id, 10);
        assert_eq!(hits[1].section_id, 11);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_match_is_deterministic_on_ties() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        for id in [31, 7, 19] {
            db.insert_section(section(id, 1, "same", vec![1.0, 0.0, 0.0]))
                .unwrap();
        }

        let first = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();
        let second = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();

        let ids: Vec<i64> = first.iter().map(|h| h.section_id).collect();
        assert_eq!(ids, vec![7, 19, 31]);
        assert_eq!(
            ids,
            second.iter().map(|h| h.section_id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_match_respects_limit() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        for id in 0..20 {
            db.insert_section(section(id, 1, "s", vec![1.0, id as f32 * 0.001, 0.0]))
                .unwrap();
        }

        let hits = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();
        assert_eq!(hits.len(), 10);
    }

    #[test]
    fn test_ignored_sections_kept_by_default_and_filtered_on_request() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        db.insert_section(section(10, 1, "normal", vec![1.0, 0.0, 0.0]))
            .unwrap();
        let mut ignored = section(11, 1, "ignored", vec![1.0, 0.0, 0.0]);
        ignored.rag_ignore = true;
        db.insert_section(ignored).unwrap();

        let unfiltered = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();
        assert_eq!(unfiltered.len(), 2);

        let filtered = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, false).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].section_id, 10);
    }

    #[test]
    fn test_match_rejects_bad_query() {
        let db = SearchDb::new(3);
        assert!(matches!(
            db.match_sections(&[1.0, 0.0], 0.5, 10, true),
            Err(DbError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            db.match_sections(&[0.0, 0.0, 0.0], 0.5, 10, true),
            Err(DbError::ZeroNormVector)
        ));
    }

    #[test]
    fn test_aggregate_groups_by_page_in_rank_order() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        db.insert_page(page(2, "/b", "B"));
        db.insert_section(section(10, 1, "a1", vec![1.0, 0.0, 0.0]))
            .unwrap();
        db.insert_section(section(11, 2, "b1", vec![0.9, 0.1, 0.0]))
            .unwrap();
        db.insert_section(section(12, 1, "a2", vec![0.8, 0.2, 0.0]))
            .unwrap();

        let hits = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();
        let matches = db.aggregate(&hits);

        assert_eq!(matches.len(), 2);
        // page 1 holds the best hit, so it comes first and collects both
        // of its sections in rank order
        assert_eq!(matches[0].id, 1);
        assert_eq!(matches[0].slugs, vec!["a1", "a2"]);
        assert_eq!(matches[0].title.as_deref(), Some("A"));
        assert_eq!(matches[1].id, 2);
        assert_eq!(matches[1].slugs, vec!["b1"]);
    }

    #[test]
    fn test_aggregate_drops_hits_for_missing_pages() {
        let mut db = SearchDb::new(3);
        db.insert_page(page(1, "/a", "A"));
        db.insert_section(section(10, 1, "a1", vec![1.0, 0.0, 0.0]))
            .unwrap();
        db.insert_section(section(11, 99, "orphan", vec![1.0, 0.0, 0.0]))
            .unwrap();

        let hits = db.match_sections(&[1.0, 0.0, 0.0], 0.5, 10, true).unwrap();
        let matches = db.aggregate(&hits);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, 1);
    }

    #[test]
    fn test_section_row_decoding_accepts_string_embeddings() {
        let row = json!({
            "id": 1,
            "page_id": 2,
            "slug": "getting-started",
            "heading": "Getting started",
            "rag_ignore": null,
            "hf_embedding": "[1.0, 0.0, 0.0]",
        });

        let section: PageSection = serde_json::from_value(row).unwrap();
        assert_eq!(section.embedding, vec![1.0, 0.0, 0.0]);
        assert!(!section.rag_ignore);
    }

    #[test]
    fn test_page_row_decoding_tolerates_null_meta() {
        let row = json!({
            "id": 7,
            "path": "/guides/auth",
            "meta": null,
            "type": null,
            "source": "guide",
        });

        let page: Page = serde_json::from_value(row).unwrap();
        assert_eq!(page.id, 7);
        assert!(page.meta.is_none());
    }
}
