//! Operator confirmation boundary.
//!
//! The repair and migration code asks questions through [`Prompt`] and never
//! touches a terminal itself; the CLI supplies the interactive implementation.

use std::collections::VecDeque;

use anyhow::Result;

use crate::select::ForcedAction;

pub trait Prompt {
    /// Yes/no question. `false` means the operator declined.
    fn confirm(&mut self, question: &str) -> Result<bool>;

    /// Pick one of `options` by index, `None` to cancel.
    fn choose(&mut self, question: &str, options: &[&str]) -> Result<Option<usize>>;
}

/// Non-interactive answers for `--yes`: every confirmation is granted and no
/// optional menu entry is picked.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Prompt for AssumeYes {
    fn confirm(&mut self, _question: &str) -> Result<bool> {
        Ok(true)
    }

    fn choose(&mut self, _question: &str, _options: &[&str]) -> Result<Option<usize>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Choice(Option<usize>),
}

/// Replays a fixed list of answers and records every question asked. Running
/// out of answers declines.
#[derive(Debug, Default, Clone)]
pub struct ScriptedPrompt {
    answers: VecDeque<Answer>,
    pub asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        ScriptedPrompt {
            answers: answers.into_iter().collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        self.asked.push(question.to_string());
        Ok(matches!(self.answers.pop_front(), Some(Answer::Yes)))
    }

    fn choose(&mut self, question: &str, _options: &[&str]) -> Result<Option<usize>> {
        self.asked.push(question.to_string());
        Ok(match self.answers.pop_front() {
            Some(Answer::Choice(c)) => c,
            _ => None,
        })
    }
}

/// Offers the forced-action menu shown when everything already audits valid.
pub fn choose_forced_action(prompt: &mut dyn Prompt, target: &str) -> Result<Option<ForcedAction>> {
    let labels: Vec<&str> = ForcedAction::ALL.iter().map(|a| a.label()).collect();
    let question = format!("{} is valid. Force an action anyway?", target);
    Ok(prompt
        .choose(&question, &labels)?
        .and_then(|i| ForcedAction::ALL.get(i).copied()))
}
