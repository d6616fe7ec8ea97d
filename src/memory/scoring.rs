//! Hybrid search scoring: BM25 full-text relevance and cosine similarity.

use serde_json::{json, Value};

use crate::memory::eval::evaluate;
use crate::query::fetch::{FetchError, FullTextStatistics, GlobalStatistics};
use crate::query::plan::{HybridSearch, RankComponent};

const K1: f64 = 1.2;
const B: f64 = 0.75;

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

fn words(document: &Value, path: &str) -> Vec<String> {
    match evaluate(document, path) {
        Some(Value::String(text)) => tokenize(text).collect(),
        _ => Vec::new(),
    }
}

/// Statistics of `documents` for the full-text components of `hybrid`.
pub fn statistics<'a>(
    hybrid: &HybridSearch,
    documents: impl IntoIterator<Item = &'a Value>,
) -> GlobalStatistics {
    let documents: Vec<&Value> = documents.into_iter().collect();
    let full_text = hybrid
        .full_text()
        .map(|(path, terms)| {
            let terms: Vec<String> = terms.iter().map(|term| term.to_lowercase()).collect();
            let mut total_word_count = 0u64;
            let mut hit_counts = vec![0u64; terms.len()];
            for document in &documents {
                let words = words(document, path);
                total_word_count += words.len() as u64;
                for (hits, term) in hit_counts.iter_mut().zip(&terms) {
                    if words.contains(term) {
                        *hits += 1;
                    }
                }
            }
            FullTextStatistics {
                total_word_count,
                hit_counts,
            }
        })
        .collect();
    GlobalStatistics {
        document_count: documents.len() as u64,
        full_text,
    }
}

fn bm25(words: &[String], terms: &[String], document_count: u64, stats: &FullTextStatistics) -> f64 {
    if document_count == 0 || stats.total_word_count == 0 {
        return 0.0;
    }
    let n = document_count as f64;
    let average = stats.total_word_count as f64 / n;
    let length = words.len() as f64;
    terms
        .iter()
        .zip(&stats.hit_counts)
        .map(|(term, hits)| {
            let term = term.to_lowercase();
            let frequency = words.iter().filter(|word| **word == term).count() as f64;
            if frequency == 0.0 {
                return 0.0;
            }
            let hits = *hits as f64;
            let idf = ((n - hits + 0.5) / (hits + 0.5) + 1.0).ln();
            idf * frequency * (K1 + 1.0) / (frequency + K1 * (1.0 - B + B * length / average))
        })
        .sum()
}

fn cosine(value: Option<&Value>, embedding: &[f64]) -> f64 {
    let Some(Value::Array(vector)) = value else {
        return 0.0;
    };
    if vector.len() != embedding.len() {
        return 0.0;
    }
    let (mut dot, mut left, mut right) = (0.0, 0.0, 0.0);
    for (x, y) in vector.iter().zip(embedding) {
        let x = x.as_f64().unwrap_or(0.0);
        dot += x * y;
        left += x * x;
        right += y * y;
    }
    if left == 0.0 || right == 0.0 {
        0.0
    } else {
        dot / (left.sqrt() * right.sqrt())
    }
}

/// Scores documents once per ranking of a hybrid search.
#[derive(Debug)]
pub struct Scorer<'a> {
    hybrid: &'a HybridSearch,
    statistics: Option<&'a GlobalStatistics>,
}

impl<'a> Scorer<'a> {
    /// Full-text rankings need the statistics gathered across every range.
    pub fn new(hybrid: &'a HybridSearch, statistics: Option<&'a GlobalStatistics>) -> Result<Self, FetchError> {
        let texts = hybrid.full_text().count();
        match statistics {
            None if texts > 0 => Err(FetchError::BadRequest(
                "full-text scoring requires global statistics".into(),
            )),
            Some(stats) if stats.full_text.len() != texts => Err(FetchError::BadRequest(format!(
                "statistics describe {} full-text components, query has {texts}",
                stats.full_text.len()
            ))),
            _ => Ok(Self { hybrid, statistics }),
        }
    }

    /// One score per ranking; higher is better.
    pub fn scores(&self, document: &Value) -> Vec<Value> {
        let mut text_index = 0;
        self.hybrid
            .components
            .iter()
            .map(|component| {
                let score = match component {
                    RankComponent::FullText { path, terms } => {
                        let score = self
                            .statistics
                            .and_then(|stats| {
                                let text = stats.full_text.get(text_index)?;
                                Some(bm25(&words(document, path), terms, stats.document_count, text))
                            })
                            .unwrap_or(0.0);
                        text_index += 1;
                        score
                    }
                    RankComponent::Vector { path, embedding } => {
                        cosine(evaluate(document, path), embedding)
                    }
                };
                json!(score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search() -> HybridSearch {
        HybridSearch {
            components: vec![
                RankComponent::FullText {
                    path: "r.body".into(),
                    terms: vec!["Fox".into(), "dog".into()],
                },
                RankComponent::Vector {
                    path: "r.v".into(),
                    embedding: vec![1.0, 0.0],
                },
            ],
        }
    }

    #[test]
    fn statistics_count_words_and_hits() {
        let docs = [
            json!({"body": "The quick brown fox"}),
            json!({"body": "lazy dog, lazy fox!"}),
            json!({"title": "no body"}),
        ];
        let stats = statistics(&search(), docs.iter());
        assert_eq!(stats.document_count, 3);
        assert_eq!(
            stats.full_text,
            vec![FullTextStatistics {
                total_word_count: 8,
                hit_counts: vec![2, 1],
            }]
        );
    }

    #[test]
    fn rarer_terms_and_closer_vectors_score_higher() {
        let docs = [
            json!({"body": "fox fox", "v": [1.0, 0.0]}),
            json!({"body": "dog", "v": [0.0, 1.0]}),
            json!({"body": "fox", "v": [1.0, 1.0]}),
            json!({"body": "cat"}),
        ];
        let hybrid = search();
        let stats = statistics(&hybrid, docs.iter());
        let scorer = Scorer::new(&hybrid, Some(&stats)).unwrap();
        let scores: Vec<(f64, f64)> = docs
            .iter()
            .map(|doc| {
                let s = scorer.scores(doc);
                (s[0].as_f64().unwrap(), s[1].as_f64().unwrap())
            })
            .collect();

        assert!(scores[1].0 > scores[2].0, "one dog outweighs one fox");
        assert!(scores[0].0 > scores[2].0);
        assert_eq!(scores[3], (0.0, 0.0));
        assert!((scores[0].1 - 1.0).abs() < 1e-9);
        assert!(scores[0].1 > scores[2].1 && scores[2].1 > scores[1].1);
    }

    #[test]
    fn full_text_needs_matching_statistics() {
        let hybrid = search();
        assert!(Scorer::new(&hybrid, None).is_err());
        assert!(Scorer::new(&hybrid, Some(&GlobalStatistics::default())).is_err());

        let vectors = HybridSearch {
            components: vec![RankComponent::Vector {
                path: "r.v".into(),
                embedding: vec![1.0],
            }],
        };
        let scorer = Scorer::new(&vectors, None).unwrap();
        assert_eq!(scorer.scores(&json!({"v": [2.0]})), vec![json!(1.0)]);
    }
}
