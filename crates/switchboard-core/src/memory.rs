use serde::{Deserialize, Serialize};

/// A stored fact about a user, tagged with topics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub memory_id: String,
    pub user_id: String,
    pub memory: String,
    pub topics: Vec<String>,
    pub updated_at: String,
}

/// Topics memories are tagged with. Queries select from this list.
pub const STANDARD_TOPICS: &[&str] = &[
    "preferences",
    "goals",
    "relationships",
    "family",
    "identity",
    "emotional state",
    "communication style",
    "behavioral patterns",
    "work",
    "projects",
    "deadlines",
    "skills",
    "expertise",
    "interests",
    "hobbies",
    "sports",
    "music",
    "travel",
    "programming",
    "ai",
    "technology",
    "software",
    "hardware",
    "location",
    "events",
    "calendar",
    "history",
    "legal",
    "research",
    "news",
    "finance",
];

/// Upper bound on memories injected into one request.
pub const MAX_MEMORY_LIMIT: usize = 50;
