//! Prompt classification for `auto` runner selection
//!
//! Keyword scoring against two small vocabularies. Code-leaning prompts go
//! to the external coding CLI; content-leaning prompts go to the embedded
//! loop. Ties fall back to the workspace's orientation.

use crate::domain::RunnerKind;

const CODE_TERMS: &[&str] = &[
    "code", "bug", "fix", "refactor", "implement", "compile", "test", "function", "api", "crash", "build", "deploy",
    "class", "module", "regression", "lint", "merge", "branch", "commit", "debug",
];

const CONTENT_TERMS: &[&str] = &[
    "write", "draft", "essay", "blog", "summarize", "summary", "email", "notes", "article", "document", "post",
    "research", "outline", "translate", "story", "letter", "brainstorm", "reword",
];

/// Scores produced by the classifier, logged with every submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierScores {
    pub code: u32,
    pub content: u32,
}

/// Pick a runner for an `auto` submission
///
/// On a tie the embedded loop wins when the workspace is code-oriented,
/// otherwise the external CLI.
pub fn classify(prompt: &str, workspace_code_oriented: bool) -> (RunnerKind, ClassifierScores) {
    let lowered = prompt.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let count = |vocab: &[&str]| words.iter().filter(|w| vocab.contains(*w)).count() as u32;
    let scores = ClassifierScores {
        code: count(CODE_TERMS),
        content: count(CONTENT_TERMS),
    };

    let runner = if scores.code > scores.content {
        RunnerKind::ExternalCli
    } else if scores.content > scores.code {
        RunnerKind::Embedded
    } else if workspace_code_oriented {
        RunnerKind::Embedded
    } else {
        RunnerKind::ExternalCli
    };

    (runner, scores)
}
