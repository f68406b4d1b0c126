//! Prompt classifier.
//!
//! Decides, per incoming chunk, whether the interactive assistant is blocked
//! on a multi-choice prompt. This is a heuristic over unstructured terminal
//! text: interactive assistants re-render the same prompt box many times
//! while idle-waiting, and resolution text can arrive in the same burst as
//! the next prompt. The state machine therefore:
//!
//! - checks resolution markers before new-prompt detection,
//! - suppresses re-renders via a time-boxed dedup window (15 s) keyed on a
//!   normalized 20-character prefix of the previous prompt,
//! - withdraws an unanswered prompt after a 30 s auto-clear deadline.
//!
//! The marker lists are product-specific UI literals, so they live in a
//! replaceable [`ClassifierPolicy`] rather than being hard-coded behavior.
//! All timing is driven by caller-supplied `Instant`s; there are no timers
//! to leak, and tests run on a fake clock.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::sanitize::strip_controls;

/// Numbered-options marker: the selected first option of a choice menu.
static OPTION_ONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[❯>]\s*1\.").unwrap());

/// A success glyph at the start of a line.
static SUCCESS_GLYPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[✓✅]").unwrap());

/// Box-drawing characters stripped before dedup comparison.
const BOX_CHARS: &[char] = &['│', '╭', '╮', '╯', '╰', '─', '┤', '├', '❯'];

/// Replaceable marker lists and timing knobs for the classifier.
///
/// The defaults mirror one assistant's observed UI text; they are
/// illustrative policy, not load-bearing protocol.
#[derive(Debug, Clone)]
pub struct ClassifierPolicy {
    /// Interrogative phrases that mark a chunk as a question.
    pub prompt_phrases: Vec<String>,
    /// Phrases that mark a pending prompt as answered/resolved.
    pub resolution_markers: Vec<String>,
    /// Literal shell-prompt-resumed markers (host-specific, empty by default).
    pub shell_prompt_markers: Vec<String>,
    /// Banner text that marks the assistant as started.
    pub start_banners: Vec<String>,
    /// Marker text that signals return to the plain shell.
    pub stop_markers: Vec<String>,
    /// Re-render suppression window after a prompt was hidden.
    pub dedup_window: Duration,
    /// Deadline after which an unanswered prompt is assumed stale.
    pub auto_clear: Duration,
    /// Normalized prefix length compared for duplicate detection.
    pub dedup_prefix_len: usize,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            prompt_phrases: [
                "do you want",
                "should i",
                "would you like",
                "make this edit",
                "continue?",
                "proceed?",
            ]
            .map(String::from)
            .to_vec(),
            resolution_markers: [
                "edit applied",
                "changes saved",
                "file updated",
                "edit complete",
                "successfully",
                "continuing…",
                "done",
            ]
            .map(String::from)
            .to_vec(),
            shell_prompt_markers: Vec::new(),
            start_banners: ["Welcome to Claude Code", "Claude Opus", "Claude Sonnet"]
                .map(String::from)
                .to_vec(),
            stop_markers: ["Goodbye!", "Session ended"].map(String::from).to_vec(),
            dedup_window: Duration::from_secs(15),
            auto_clear: Duration::from_secs(30),
            dedup_prefix_len: 20,
        }
    }
}

/// Classifier state: either no prompt is pending, or one awaits a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptGate {
    Idle,
    AwaitingResponse,
}

/// Events emitted by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptEvent {
    /// A new interactive prompt is awaiting a response.
    Detected { text: String },
    /// The pending prompt was resolved by output text.
    Resolved,
    /// The pending prompt went unanswered past the auto-clear deadline.
    Expired,
}

/// Stateful per-session prompt detector.
pub struct PromptClassifier {
    policy: ClassifierPolicy,
    state: PromptGate,
    /// Normalized text of the most recent prompt. Retained across auto-clear
    /// so the next dedup check still recognizes a re-render.
    last_prompt_text: String,
    last_hide_at: Option<Instant>,
    auto_clear_deadline: Option<Instant>,
}

impl PromptClassifier {
    pub fn new(policy: ClassifierPolicy) -> Self {
        Self {
            policy,
            state: PromptGate::Idle,
            last_prompt_text: String::new(),
            last_hide_at: None,
            auto_clear_deadline: None,
        }
    }

    pub fn state(&self) -> PromptGate {
        self.state
    }

    pub fn is_awaiting(&self) -> bool {
        self.state == PromptGate::AwaitingResponse
    }

    /// The next instant at which [`poll`](Self::poll) may produce an event.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.auto_clear_deadline
    }

    /// Evaluate one raw chunk. Resolution is checked before new-prompt
    /// detection so a resolution and the next prompt arriving in the same
    /// burst are both honored.
    pub fn classify(&mut self, chunk: &str, now: Instant) -> Vec<PromptEvent> {
        let stripped = strip_controls(chunk);
        let text = stripped.trim();
        let mut events = Vec::new();

        if self.state == PromptGate::AwaitingResponse && self.is_resolution(text) {
            self.state = PromptGate::Idle;
            self.auto_clear_deadline = None;
            self.last_hide_at = Some(now);
            events.push(PromptEvent::Resolved);
        }

        if self.state == PromptGate::Idle && self.is_new_prompt(text) {
            if self.is_duplicate(text, now) {
                return events;
            }
            self.state = PromptGate::AwaitingResponse;
            self.last_prompt_text = normalize(text, self.policy.dedup_prefix_len * 8);
            self.auto_clear_deadline = Some(now + self.policy.auto_clear);
            events.push(PromptEvent::Detected {
                text: text.to_string(),
            });
        }

        events
    }

    /// Check the auto-clear deadline. Fires at most once per pending prompt:
    /// expiry clears the deadline but keeps the prompt text for dedup.
    pub fn poll(&mut self, now: Instant) -> Option<PromptEvent> {
        match self.auto_clear_deadline {
            Some(deadline) if self.state == PromptGate::AwaitingResponse && now >= deadline => {
                self.state = PromptGate::Idle;
                self.auto_clear_deadline = None;
                self.last_hide_at = Some(now);
                Some(PromptEvent::Expired)
            }
            _ => None,
        }
    }

    fn is_new_prompt(&self, text: &str) -> bool {
        let has_options = OPTION_ONE.is_match(text)
            && (text.contains("2.") || text.contains("3."));
        if !has_options {
            return false;
        }
        let lower = text.to_lowercase();
        self.policy
            .prompt_phrases
            .iter()
            .any(|p| lower.contains(p.as_str()))
    }

    fn is_resolution(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.policy
            .resolution_markers
            .iter()
            .any(|m| lower.contains(&m.to_lowercase()))
            || SUCCESS_GLYPH.is_match(text)
            || self
                .policy
                .shell_prompt_markers
                .iter()
                .any(|m| text.contains(m.as_str()))
    }

    fn is_duplicate(&self, text: &str, now: Instant) -> bool {
        let Some(hidden_at) = self.last_hide_at else {
            return false;
        };
        if now.duration_since(hidden_at) >= self.policy.dedup_window {
            return false;
        }
        let current = normalize(text, self.policy.dedup_prefix_len * 8);
        let previous = &self.last_prompt_text;
        if current.chars().count() <= 10 || previous.chars().count() <= 10 {
            return false;
        }
        let cur_prefix = prefix(&current, self.policy.dedup_prefix_len);
        let prev_prefix = prefix(previous, self.policy.dedup_prefix_len);
        current.contains(&prev_prefix) || previous.contains(&cur_prefix)
    }
}

impl Default for PromptClassifier {
    fn default() -> Self {
        Self::new(ClassifierPolicy::default())
    }
}

/// Normalize prompt text for dedup comparison: collapse whitespace, strip
/// box-drawing characters, lowercase. Capped so a giant re-render does not
/// balloon the retained state.
fn normalize(text: &str, max_len: usize) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if BOX_CHARS.contains(&c) { ' ' } else { c })
        .collect();
    let collapsed = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(max_len).collect()
}

fn prefix(text: &str, len: usize) -> String {
    text.chars().take(len).collect()
}

/// Coarse "assistant is running" detector.
///
/// Independent of the prompt state machine: toggles on start/stop banner
/// text in any incoming chunk, and gates auto-resume logic in the client.
pub struct RunStateDetector {
    start_banners: Vec<String>,
    stop_markers: Vec<String>,
    running: bool,
}

impl RunStateDetector {
    pub fn new(policy: &ClassifierPolicy) -> Self {
        Self {
            start_banners: policy.start_banners.clone(),
            stop_markers: policy.stop_markers.clone(),
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Observe one chunk; returns `Some(new_state)` on a transition.
    pub fn observe(&mut self, chunk: &str) -> Option<bool> {
        let text = strip_controls(chunk);
        if !self.running && self.start_banners.iter().any(|b| text.contains(b.as_str())) {
            self.running = true;
            return Some(true);
        }
        if self.running
            && self.stop_markers.iter().any(|m| text.contains(m.as_str()))
        {
            self.running = false;
            return Some(false);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "Do you want to make this edit?\n❯ 1. Yes\n  2. Yes, don't ask again\n  3. No";

    fn classifier() -> PromptClassifier {
        PromptClassifier::default()
    }

    #[test]
    fn detects_numbered_prompt_with_interrogative() {
        let mut c = classifier();
        let now = Instant::now();
        let events = c.classify(PROMPT, now);
        assert_eq!(
            events,
            vec![PromptEvent::Detected {
                text: PROMPT.to_string()
            }]
        );
        assert!(c.is_awaiting());
        assert_eq!(c.next_deadline(), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn options_without_interrogative_do_not_fire() {
        let mut c = classifier();
        let events = c.classify("❯ 1. apples\n  2. oranges", Instant::now());
        assert!(events.is_empty());
        assert!(!c.is_awaiting());
    }

    #[test]
    fn interrogative_without_options_does_not_fire() {
        let mut c = classifier();
        let events = c.classify("Do you want fries with that", Instant::now());
        assert!(events.is_empty());
    }

    #[test]
    fn resolution_marker_clears_pending_prompt() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        let events = c.classify("Edit applied to src/main.rs", t0 + Duration::from_secs(2));
        assert_eq!(events, vec![PromptEvent::Resolved]);
        assert!(!c.is_awaiting());
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn success_glyph_at_line_start_resolves() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        let events = c.classify("✓ wrote 3 files", t0 + Duration::from_secs(1));
        assert_eq!(events, vec![PromptEvent::Resolved]);
    }

    #[test]
    fn duplicate_within_window_is_suppressed() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        c.classify("Edit applied", t0 + Duration::from_secs(1));

        // Same prompt re-rendered 5s after hide: suppressed.
        let events = c.classify(PROMPT, t0 + Duration::from_secs(6));
        assert!(events.is_empty());
        assert_eq!(c.state(), PromptGate::Idle);
    }

    #[test]
    fn duplicate_outside_window_fires_again() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        c.classify("Edit applied", t0 + Duration::from_secs(1));

        // Same prompt 20s after hide: outside the 15s window, fires.
        let events = c.classify(PROMPT, t0 + Duration::from_secs(21));
        assert_eq!(events.len(), 1);
        assert!(c.is_awaiting());
    }

    #[test]
    fn different_prompt_within_window_fires() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        c.classify("Changes saved", t0 + Duration::from_secs(1));

        let other = "Should I delete the old config?\n❯ 1. Yes\n  2. No";
        let events = c.classify(other, t0 + Duration::from_secs(3));
        assert_eq!(events.len(), 1);
        assert!(c.is_awaiting());
    }

    #[test]
    fn auto_clear_fires_exactly_once() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);

        assert_eq!(c.poll(t0 + Duration::from_secs(29)), None);
        assert_eq!(c.poll(t0 + Duration::from_secs(30)), Some(PromptEvent::Expired));
        assert!(!c.is_awaiting());
        // Deadline cleared: the timer is not retriggered.
        assert_eq!(c.poll(t0 + Duration::from_secs(31)), None);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn auto_clear_retains_prompt_text_for_dedup() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        c.poll(t0 + Duration::from_secs(30));

        // Re-render 5s after the auto-clear: still recognized as duplicate.
        let events = c.classify(PROMPT, t0 + Duration::from_secs(35));
        assert!(events.is_empty());
        assert_eq!(c.state(), PromptGate::Idle);
    }

    #[test]
    fn idle_state_never_holds_a_deadline() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);
        c.classify("Edit applied", t0 + Duration::from_secs(1));
        assert_eq!(c.state(), PromptGate::Idle);
        assert_eq!(c.next_deadline(), None);

        c.classify(PROMPT, t0 + Duration::from_secs(40));
        c.poll(t0 + Duration::from_secs(80));
        assert_eq!(c.state(), PromptGate::Idle);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn resolution_and_next_prompt_in_same_burst() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.classify(PROMPT, t0);

        // Resolution text and a structurally different prompt in one chunk.
        let burst = "Edit applied\nShould I run the tests now?\n❯ 1. Yes\n  2. No";
        let events = c.classify(burst, t0 + Duration::from_secs(2));
        assert_eq!(
            events,
            vec![
                PromptEvent::Resolved,
                PromptEvent::Detected {
                    text: burst.to_string()
                }
            ]
        );
        assert!(c.is_awaiting());
    }

    #[test]
    fn classify_ignores_ansi_wrapping() {
        let mut c = classifier();
        let colored = format!("\x1b[33m{}\x1b[0m", PROMPT);
        let events = c.classify(&colored, Instant::now());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn run_state_detector_toggles_on_banners() {
        let policy = ClassifierPolicy::default();
        let mut d = RunStateDetector::new(&policy);
        assert!(!d.is_running());

        assert_eq!(d.observe("plain shell output"), None);
        assert_eq!(d.observe("Welcome to Claude Code v2.1"), Some(true));
        assert!(d.is_running());
        // Repeated start banner: no transition.
        assert_eq!(d.observe("Welcome to Claude Code v2.1"), None);
        assert_eq!(d.observe("Goodbye!"), Some(false));
        assert!(!d.is_running());
    }
}
