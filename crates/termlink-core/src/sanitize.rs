//! Output sanitizer.
//!
//! Turns raw PTY output into display-worthy lines: strips terminal control
//! sequences, then drops lines that carry no meaning for a remote viewer
//! (bare prompts, control residue, installer banners, box-drawing chrome).
//!
//! Every chunk passes through here before it reaches the prompt classifier
//! or the client's output window. Stripping runs to a fixpoint so the
//! result is idempotent: `sanitize(sanitize(x)) == sanitize(x)`.

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences: cursor movement, colors, modes, bracketed-paste markers.
static CSI_SEQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z~]").unwrap());

/// OSC sequences (window title etc.), terminated by BEL or ST.
static OSC_SEQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Remaining two-byte escapes and a bare trailing ESC.
static ESC_SEQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[@-_=><]?").unwrap());

/// CSI residue that arrives without its ESC byte (split across chunks).
static BRACKET_RESIDUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[0-9;]*[A-Za-z]").unwrap());

/// Private-mode residue like `?2004h` / `?25l`.
static MODE_RESIDUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?\d+[lh]").unwrap());

/// Control bytes other than newline/tab.
static CONTROL_BYTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").unwrap());

/// Lines that are nothing but control-sequence leftovers.
static RESIDUE_ONLY: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^\[[0-9;]*[A-Za-z]$").unwrap(),
        Regex::new(r"^\?\d+[lh]$").unwrap(),
        Regex::new(r"^[K\s]*$").unwrap(),
        Regex::new(r"^[0-9;]*[mGKH]$").unwrap(),
    ]
});

/// Box-drawing chrome and empty prompt boxes.
static BOX_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[│╭╮╯╰─┤├┬┴┼═━\s]*$").unwrap());
static EMPTY_PROMPT_BOX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[│\s]*[>❯]\s*[│\s]*$").unwrap());

/// Bare shell prompts (`%`, `$`, `#` with nothing else).
static BARE_SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[%$#\s]*$").unwrap());

/// Known-noise phrases: installer banners, model-name echoes, interrupt
/// hints, command self-echoes. Matched by containment on the stripped line.
const NOISE_CONTAINS: &[&str] = &[
    "anthropic-ai/claude-code",
    "esc to interrupt",
    "shift+tab to cycle",
    "limit reached",
    "now using",
    "Claude Opus",
    "Claude Sonnet",
    "using Sonnet",
];

const NOISE_PREFIXES: &[&str] = &[
    "Auto-update failed",
    "Try claude doctor",
    "npm i -g",
    "or npm i -g",
];

/// Command self-echoes from launching the assistant.
const NOISE_EXACT: &[&str] = &["claude", "claude-code", "aude-code"];

/// Strip all terminal control/escape sequences from a chunk.
///
/// Applied to a fixpoint: removing one sequence can butt two fragments
/// together into a new match (common when sequences were split across
/// read chunks), so a single pass is not idempotent.
pub fn strip_controls(input: &str) -> String {
    let mut out = input.to_string();
    loop {
        let mut next = CSI_SEQ.replace_all(&out, "").into_owned();
        next = OSC_SEQ.replace_all(&next, "").into_owned();
        next = ESC_SEQ.replace_all(&next, "").into_owned();
        next = MODE_RESIDUE.replace_all(&next, "").into_owned();
        next = BRACKET_RESIDUE.replace_all(&next, "").into_owned();
        next = CONTROL_BYTES.replace_all(&next, "").into_owned();
        if next == out {
            return next;
        }
        out = next;
    }
}

/// Sanitize one raw chunk into a meaningful line, or discard it.
pub fn sanitize(raw: &str) -> Option<String> {
    let stripped = strip_controls(raw);
    let line = stripped.trim();

    if line.chars().count() < 4 {
        return None;
    }
    if RESIDUE_ONLY.iter().any(|re| re.is_match(line)) {
        return None;
    }
    if BARE_SHELL_PROMPT.is_match(line)
        || BOX_ONLY.is_match(line)
        || EMPTY_PROMPT_BOX.is_match(line)
    {
        return None;
    }
    if NOISE_CONTAINS.iter().any(|n| line.contains(n)) {
        return None;
    }
    if NOISE_PREFIXES.iter().any(|n| line.starts_with(n)) {
        return None;
    }
    if NOISE_EXACT.contains(&line) {
        return None;
    }

    Some(line.to_string())
}

/// Split a chunk on newlines and sanitize each line independently.
pub fn sanitize_lines(raw: &str) -> Vec<String> {
    raw.split(['\n', '\r'])
        .filter_map(sanitize)
        .collect()
}
