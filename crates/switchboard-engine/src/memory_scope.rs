use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use switchboard_core::ids::UserId;
use switchboard_core::memory::{MemoryItem, MAX_MEMORY_LIMIT, STANDARD_TOPICS};
use switchboard_store::memory::MemoryRepo;
use switchboard_telemetry::{Counter, Diagnostics};

/// Bounded, topic-filtered memory query for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryScope {
    pub topics: Vec<String>,
    pub limit: usize,
}

/// Standard topics that occur as whole words in `message`. No match means an
/// unfiltered query for the most recent memories.
pub fn scope_for(message: &str, limit: usize) -> MemoryScope {
    let words: Vec<String> = message
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let padded = format!(" {} ", words.join(" "));

    let topics = STANDARD_TOPICS
        .iter()
        .filter(|t| padded.contains(&format!(" {t} ")))
        .map(|t| t.to_string())
        .collect();

    MemoryScope {
        topics,
        limit: limit.min(MAX_MEMORY_LIMIT),
    }
}

pub struct MemoryScopeFilter {
    repo: MemoryRepo,
    limit: usize,
    diagnostics: Arc<Diagnostics>,
}

impl MemoryScopeFilter {
    pub fn new(repo: MemoryRepo, limit: usize, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            repo,
            limit,
            diagnostics,
        }
    }

    pub fn scope_for(&self, message: &str) -> MemoryScope {
        scope_for(message, self.limit)
    }

    /// Failures degrade to no memories.
    pub fn search(&self, scope: &MemoryScope, user_id: &UserId) -> Vec<MemoryItem> {
        match self.repo.search(&scope.topics, user_id, scope.limit) {
            Ok(items) => {
                debug!(user_id = %user_id, topics = ?scope.topics, found = items.len(), "memory lookup");
                items
            }
            Err(e) => {
                self.diagnostics.incr(Counter::MemoryLookupFailures);
                warn!(user_id = %user_id, error = %e, "memory lookup failed, continuing without memories");
                Vec::new()
            }
        }
    }
}

/// The `memories` dependency handed to the engine.
pub fn memories_dependency(items: &[MemoryItem]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|m| json!({"memory": m.memory, "topics": m.topics, "updated_at": m.updated_at}))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_store::Database;

    #[test]
    fn picks_whole_word_topics() {
        let scope = scope_for("Any news on my Travel plans? I said AI, not email.", 20);
        assert_eq!(scope.topics, vec!["travel", "ai", "news"]);
        assert_eq!(scope.limit, 20);
    }

    #[test]
    fn multi_word_topics_and_limit_cap() {
        let scope = scope_for("Adjust your communication style please", 500);
        assert_eq!(scope.topics, vec!["communication style"]);
        assert_eq!(scope.limit, MAX_MEMORY_LIMIT);
    }

    #[test]
    fn search_is_bounded_and_filtered() {
        let db = Database::in_memory().unwrap();
        let repo = MemoryRepo::new(db);
        let user = UserId::from_raw("user_1");
        for i in 0..5 {
            repo.add(&user, &format!("trip {i}"), &["travel"]).unwrap();
        }
        repo.add(&user, "likes jazz", &["music"]).unwrap();

        let filter = MemoryScopeFilter::new(repo, 3, Arc::new(Diagnostics::new()));
        let scope = filter.scope_for("plan my travel");
        let items = filter.search(&scope, &user);
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|m| m.topics.contains(&"travel".to_string())));

        let dep = memories_dependency(&items);
        assert_eq!(dep.as_array().unwrap().len(), 3);
        assert!(dep[0]["memory"].as_str().unwrap().starts_with("trip"));
    }

    #[test]
    fn other_users_memories_are_invisible() {
        let db = Database::in_memory().unwrap();
        let repo = MemoryRepo::new(db);
        repo.add(&UserId::from_raw("alice"), "alice likes tea", &["preferences"]).unwrap();
        let filter = MemoryScopeFilter::new(repo, 10, Arc::new(Diagnostics::new()));
        let scope = filter.scope_for("what are my preferences");
        assert!(filter.search(&scope, &UserId::from_raw("bob")).is_empty());
    }
}
