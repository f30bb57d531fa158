//! Best-effort session titles.
//!
//! Naming runs off the request path. Attempts for one session never overlap,
//! a title is committed at most once, and a session that failed
//! [`MAX_NAMING_ATTEMPTS`] times is left unnamed for good.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_core::ids::SessionId;
use switchboard_core::session::MAX_NAMING_ATTEMPTS;
use switchboard_core::summarizer::{SummarizerError, TitleSummarizer, Turn};
use switchboard_store::sessions::SessionRepo;
use switchboard_store::turns::TurnRepo;
use switchboard_store::{Database, StoreError};
use switchboard_telemetry::{Counter, Diagnostics};

pub const MIN_TURNS_FOR_NAMING: u32 = 2;
pub const MAX_SUMMARY_TURNS: u32 = 6;
pub const MAX_TURN_CHARS: usize = 500;
pub const MAX_TITLE_WORDS: usize = 10;

const GENERIC_TITLES: &[&str] = &["test", "hey", "hello", "hi", "greeting", "greetings", "untitled", "new chat"];
const QUOTES: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamingOutcome {
    Named(String),
    /// Someone else committed a title first.
    AlreadyNamed,
    /// Not enough turns yet, or the session no longer wants a name.
    Skipped,
    Failed { attempts: u32 },
}

/// Clean a summarizer reply into a title.
pub fn sanitize_title(raw: &str) -> Result<String, SummarizerError> {
    let trimmed = raw
        .trim()
        .trim_start_matches("Session Name:")
        .trim()
        .trim_matches(|c: char| QUOTES.contains(&c) || c.is_whitespace())
        .trim_end_matches('.');
    let title = trimmed
        .split_whitespace()
        .take(MAX_TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() || GENERIC_TITLES.contains(&title.to_lowercase().as_str()) {
        return Err(SummarizerError::EmptyTitle(raw.to_string()));
    }
    Ok(title)
}

fn truncate(content: &str) -> String {
    match content.char_indices().nth(MAX_TURN_CHARS) {
        Some((idx, _)) => format!("{}...", &content[..idx]),
        None => content.to_string(),
    }
}

/// Everything one naming attempt needs.
#[derive(Clone)]
pub struct Namer {
    sessions: SessionRepo,
    turns: TurnRepo,
    summarizer: Arc<dyn TitleSummarizer>,
    diagnostics: Arc<Diagnostics>,
}

impl Namer {
    pub fn new(db: Database, summarizer: Arc<dyn TitleSummarizer>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            turns: TurnRepo::new(db),
            summarizer,
            diagnostics,
        }
    }

    /// One naming attempt. Store errors are returned; summarizer errors are
    /// counted against the session.
    pub async fn attempt(&self, session_id: &SessionId) -> Result<NamingOutcome, StoreError> {
        let Some(state) = self.sessions.find(session_id)? else {
            return Ok(NamingOutcome::Skipped);
        };
        if !state.wants_name() || self.turns.count(session_id)? < MIN_TURNS_FOR_NAMING {
            return Ok(NamingOutcome::Skipped);
        }

        let turns: Vec<Turn> = self
            .turns
            .list(session_id, MAX_SUMMARY_TURNS)?
            .into_iter()
            .map(|t| Turn {
                content: truncate(&t.content),
                ..t
            })
            .collect();

        let title = match self.summarizer.summarize_title(&turns).await {
            Ok(raw) => sanitize_title(&raw),
            Err(e) => Err(e),
        };

        match title {
            Ok(title) => {
                if self.sessions.set_name_once(session_id, &title)? {
                    self.diagnostics.incr(Counter::NamesAssigned);
                    info!(session_id = %session_id, %title, "session named");
                    Ok(NamingOutcome::Named(title))
                } else {
                    Ok(NamingOutcome::AlreadyNamed)
                }
            }
            Err(e) => {
                let attempts = self.sessions.record_naming_failure(session_id)?;
                self.diagnostics.incr(Counter::NamingFailures);
                warn!(session_id = %session_id, attempts, error = %e, "session naming failed");
                if attempts >= MAX_NAMING_ATTEMPTS {
                    info!(session_id = %session_id, "giving up on session naming");
                }
                Ok(NamingOutcome::Failed { attempts })
            }
        }
    }
}

/// Fire-and-forget naming queue.
#[derive(Clone)]
pub struct NamingScheduler {
    tx: mpsc::UnboundedSender<SessionId>,
}

impl NamingScheduler {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn spawn(namer: Namer) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionId>();
        let in_flight: Arc<DashMap<SessionId, ()>> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(session_id) = rx.recv().await {
                if in_flight.insert(session_id.clone(), ()).is_some() {
                    debug!(session_id = %session_id, "naming already in flight, skipping");
                    continue;
                }
                let namer = namer.clone();
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    if let Err(e) = namer.attempt(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "naming attempt aborted");
                    }
                    in_flight.remove(&session_id);
                });
            }
        });

        Self { tx }
    }

    pub fn schedule(&self, session_id: SessionId) {
        if self.tx.send(session_id).is_err() {
            warn!("naming dispatcher stopped, dropping request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use switchboard_core::ids::UserId;

    struct FakeSummarizer {
        replies: Mutex<VecDeque<Result<String, SummarizerError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<Turn>>>,
        delay: Duration,
    }

    impl FakeSummarizer {
        fn new(replies: Vec<Result<String, SummarizerError>>) -> Arc<Self> {
            Self::slow(replies, Duration::ZERO)
        }

        fn slow(replies: Vec<Result<String, SummarizerError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl TitleSummarizer for FakeSummarizer {
        async fn summarize_title(&self, turns: &[Turn]) -> Result<String, SummarizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(turns.to_vec());
            tokio::time::sleep(self.delay).await;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SummarizerError::Request("no reply".into())))
        }
    }

    fn setup(turns: usize) -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let sid = SessionId::new();
        SessionRepo::new(db.clone()).create(&sid, &UserId::from_raw("u1")).unwrap();
        let repo = TurnRepo::new(db.clone());
        for i in 0..turns {
            let turn = if i % 2 == 0 {
                Turn::user(format!("question {i}"))
            } else {
                Turn::assistant(format!("answer {i}"))
            };
            repo.append(&sid, &turn).unwrap();
        }
        (db, sid)
    }

    fn fail() -> Result<String, SummarizerError> {
        Err(SummarizerError::Request("503".into()))
    }

    #[test]
    fn sanitize_strips_quotes_and_limits_words() {
        assert_eq!(sanitize_title("  \"Trip To Lisbon.\" ").unwrap(), "Trip To Lisbon");
        assert_eq!(
            sanitize_title("one two three four five six seven eight nine ten eleven").unwrap(),
            "one two three four five six seven eight nine ten"
        );
        assert_eq!(sanitize_title("Session Name: 'Budget   Review'").unwrap(), "Budget Review");
        assert!(sanitize_title("  \"\" ").is_err());
        assert!(sanitize_title("Hello").is_err());
    }

    #[test]
    fn long_turns_are_truncated() {
        let long = "x".repeat(600);
        let t = truncate(&long);
        assert_eq!(t.len(), MAX_TURN_CHARS + 3);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn waits_for_two_turns() {
        let (db, sid) = setup(1);
        let summarizer = FakeSummarizer::new(vec![Ok("Anything".into())]);
        let namer = Namer::new(db, summarizer.clone(), Arc::new(Diagnostics::new()));
        assert_eq!(namer.attempt(&sid).await.unwrap(), NamingOutcome::Skipped);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn names_once_with_first_six_turns() {
        let (db, sid) = setup(9);
        let summarizer = FakeSummarizer::new(vec![Ok("Numbered Questions".into()), Ok("Other".into())]);
        let namer = Namer::new(db.clone(), summarizer.clone(), Arc::new(Diagnostics::new()));

        assert_eq!(
            namer.attempt(&sid).await.unwrap(),
            NamingOutcome::Named("Numbered Questions".into())
        );
        assert_eq!(summarizer.seen.lock()[0].len(), 6);
        assert_eq!(summarizer.seen.lock()[0][0].content, "question 0");

        assert_eq!(namer.attempt(&sid).await.unwrap(), NamingOutcome::Skipped);
        let state = SessionRepo::new(db).get(&sid).unwrap();
        assert_eq!(state.name.as_deref(), Some("Numbered Questions"));
    }

    #[tokio::test]
    async fn three_failures_leave_session_unnamed() {
        let (db, sid) = setup(2);
        let summarizer = FakeSummarizer::new(vec![fail(), Ok("   ".into()), fail(), Ok("Too Late".into())]);
        let diagnostics = Arc::new(Diagnostics::new());
        let namer = Namer::new(db.clone(), summarizer.clone(), diagnostics.clone());

        for expected in 1..=3 {
            assert_eq!(namer.attempt(&sid).await.unwrap(), NamingOutcome::Failed { attempts: expected });
        }
        assert_eq!(namer.attempt(&sid).await.unwrap(), NamingOutcome::Skipped);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(diagnostics.get(Counter::NamingFailures), 3);

        let state = SessionRepo::new(db).get(&sid).unwrap();
        assert!(state.name.is_none());
        assert_eq!(state.naming_attempts, 3);
    }

    #[tokio::test]
    async fn scheduler_names_in_background_without_overlap() {
        let (db, sid) = setup(2);
        let summarizer = FakeSummarizer::slow(vec![Ok("Background Title".into())], Duration::from_millis(50));
        let namer = Namer::new(db.clone(), summarizer.clone(), Arc::new(Diagnostics::new()));
        let scheduler = NamingScheduler::spawn(namer);

        scheduler.schedule(sid.clone());
        scheduler.schedule(sid.clone());

        let repo = SessionRepo::new(db);
        let mut named = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            named = repo.get(&sid).unwrap().name;
            if named.is_some() {
                break;
            }
        }
        assert_eq!(named.as_deref(), Some("Background Title"));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }
}
