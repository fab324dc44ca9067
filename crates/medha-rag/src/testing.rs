//! Deterministic collaborators for unit tests. No network.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::embeddings::EmbeddingModel;
use crate::index::{ScoredPassage, SimilarityIndex};
use crate::llm::{GenerationConfig, LanguageModel, ProviderInfo};
use crate::state::{Message, Passage};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "by", "can", "do", "does", "for", "from", "her", "his",
    "in", "is", "its", "of", "on", "s", "the", "their", "to", "what", "who", "with",
];

pub fn keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

pub fn department_corpus() -> Vec<Passage> {
    vec![
        Passage::new("Dr. Asha Mehta is the head of the department of Computer Science.")
            .with_metadata("id", "head")
            .with_metadata("source", "faculty.md"),
        Passage::new("Dr. Asha Mehta can be reached by email at asha.mehta@univ.edu.")
            .with_metadata("id", "contact")
            .with_metadata("source", "contacts.md"),
        Passage::new("Office hours are held on Mondays from 2pm to 4pm in room 301.")
            .with_metadata("id", "office-hours")
            .with_metadata("source", "faculty.md"),
        Passage::new("The department offers courses in compilers, databases and networks.")
            .with_metadata("id", "courses")
            .with_metadata("source", "courses.md"),
    ]
}

/// Replies from a fixed script, in order. Every call is recorded.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, messages: &[Message], _config: &GenerationConfig) -> Result<String> {
        self.calls.lock().push(messages.to_vec());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no reply left"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "Scripted".to_string(),
            model: "scripted-test".to_string(),
        }
    }
}

pub struct FailingModel;

#[async_trait]
impl LanguageModel for FailingModel {
    async fn chat(&self, _messages: &[Message], _config: &GenerationConfig) -> Result<String> {
        Err(anyhow!("API error (503 Service Unavailable): upstream overloaded"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "Failing".to_string(),
            model: "failing-test".to_string(),
        }
    }
}

/// Ranks by the number of distinct query keywords a passage contains.
/// Passages sharing no keyword are not returned.
pub struct FakeIndex {
    passages: Mutex<Vec<Passage>>,
    queries: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeIndex {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self {
            passages: Mutex::new(passages),
            queries: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl SimilarityIndex for FakeIndex {
    async fn search_scored(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>> {
        self.queries.lock().push(query.to_string());
        if self.fail {
            return Err(anyhow!("index offline"));
        }
        let wanted: HashSet<String> = keywords(query).into_iter().collect();
        let mut hits: Vec<ScoredPassage> = self
            .passages
            .lock()
            .iter()
            .filter_map(|p| {
                let have: HashSet<String> = keywords(&p.content).into_iter().collect();
                let overlap = wanted.intersection(&have).count();
                (overlap > 0).then(|| ScoredPassage {
                    passage: p.clone(),
                    score: overlap as f32,
                })
            })
            .collect();
        // stable sort keeps insertion order on ties
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn upsert(&self, passages: Vec<Passage>) -> Result<usize> {
        let written = passages.len();
        self.passages.lock().extend(passages);
        Ok(written)
    }

    fn len(&self) -> usize {
        self.passages.lock().len()
    }
}

const FAKE_DIMENSIONS: usize = 512;

/// Bag-of-words vectors over a vocabulary that grows as text is seen.
pub struct FakeEmbeddings {
    vocabulary: Mutex<HashMap<String, usize>>,
}

impl FakeEmbeddings {
    pub fn new() -> Self {
        Self {
            vocabulary: Mutex::new(HashMap::new()),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vocabulary = self.vocabulary.lock();
        let mut vector = vec![0.0f32; FAKE_DIMENSIONS];
        for word in keywords(text) {
            let next = vocabulary.len();
            let slot = *vocabulary.entry(word).or_insert(next) % FAKE_DIMENSIONS;
            vector[slot] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for FakeEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn model_name(&self) -> &str {
        "fake-bag-of-words"
    }
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
