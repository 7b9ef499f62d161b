use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::poll::{MAX_OPTIONS, MIN_OPTIONS},
};

/// A validated request to create a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    question: String,
    options: Vec<String>,
    duration_minutes: u64,
}

impl PollSpec {
    /// Validate user input. Blank options are dropped rather than rejected;
    /// what remains must be between two and five options.
    pub fn new<S: AsRef<str>>(question: &str, options: &[S], duration_minutes: i64) -> Result<Self> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::InvalidPoll("question must not be empty".to_string()));
        }

        let options = options
            .iter()
            .map(|option| option.as_ref().trim())
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if options.len() < MIN_OPTIONS || options.len() > MAX_OPTIONS {
            return Err(Error::InvalidPoll(format!(
                "expected {MIN_OPTIONS} to {MAX_OPTIONS} options, got {}",
                options.len()
            )));
        }

        let duration_minutes = u64::try_from(duration_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)
            .ok_or_else(|| {
                Error::InvalidPoll(format!(
                    "duration must be a positive number of minutes, got {duration_minutes}"
                ))
            })?;

        Ok(Self {
            question: question.to_string(),
            options,
            duration_minutes,
        })
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn duration_minutes(&self) -> u64 {
        self.duration_minutes
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl PollSpec {
        pub fn example() -> Self {
            Self::new("Tabs or spaces?", &["A", "B"], 60).unwrap()
        }
    }
}
