use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::poll::Poll;

/// One option's revealed count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTally {
    pub label: String,
    pub votes: u64,
}

/// Revealed results paired with their option labels, in ballot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    options: Vec<OptionTally>,
}

impl Tally {
    /// The tally of a revealed poll, or `None` if results are not in yet.
    pub fn of(poll: &Poll) -> Option<Self> {
        if poll.final_results.is_empty() {
            return None;
        }
        Some(Self::new(&poll.options, &poll.final_results))
    }

    /// Pair labels with counts by position. Missing counts are zero.
    pub fn new(labels: &[String], counts: &[u64]) -> Self {
        let options = labels
            .iter()
            .enumerate()
            .map(|(index, label)| OptionTally {
                label: label.clone(),
                votes: counts.get(index).copied().unwrap_or(0),
            })
            .collect();
        Self { options }
    }

    pub fn options(&self) -> &[OptionTally] {
        &self.options
    }

    /// Total number of ballots counted.
    pub fn turnout(&self) -> u64 {
        self.options.iter().map(|option| option.votes).sum()
    }

    /// Percentage of the turnout won by an option; zero when nobody voted.
    pub fn share(&self, index: usize) -> Option<f64> {
        let option = self.options.get(index)?;
        let turnout = self.turnout();
        if turnout == 0 {
            return Some(0.0);
        }
        Some(option.votes as f64 * 100.0 / turnout as f64)
    }

    /// Every option holding the highest count. Empty when nobody voted.
    pub fn leaders(&self) -> Vec<&str> {
        let max = match self.options.iter().map(|option| option.votes).max() {
            Some(max) if max > 0 => max,
            _ => return vec![],
        };
        self.options
            .iter()
            .filter(|option| option.votes == max)
            .map(|option| option.label.as_str())
            .collect()
    }
}

impl Display for Tally {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, option) in self.options.iter().enumerate() {
            writeln!(
                f,
                "{}: {} vote{} ({:.1}%)",
                option.label,
                option.votes,
                if option.votes != 1 { "s" } else { "" },
                self.share(index).unwrap_or(0.0)
            )?;
        }
        let turnout = self.turnout();
        write!(
            f,
            "{} ballot{} counted",
            turnout,
            if turnout != 1 { "s" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::poll::examples::epoch;

    fn labels(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|label| label.to_string()).collect()
    }

    #[test]
    fn unrevealed_poll_has_no_tally() {
        assert_eq!(Tally::of(&Poll::example(epoch())), None);
    }

    #[test]
    fn shares_and_leaders() {
        let tally = Tally::new(&labels(&["A", "B", "C"]), &[1, 3, 0]);
        assert_eq!(tally.turnout(), 4);
        assert_eq!(tally.share(0), Some(25.0));
        assert_eq!(tally.share(1), Some(75.0));
        assert_eq!(tally.share(3), None);
        assert_eq!(tally.leaders(), vec!["B"]);

        let tie = Tally::new(&labels(&["A", "B"]), &[2, 2]);
        assert_eq!(tie.leaders(), vec!["A", "B"]);
    }

    #[test]
    fn short_results_count_as_zero() {
        let tally = Tally::new(&labels(&["A", "B", "C"]), &[1]);
        assert_eq!(tally.options()[2].votes, 0);
        assert_eq!(tally.turnout(), 1);
    }

    #[test]
    fn empty_poll() {
        let tally = Tally::new(&labels(&["A", "B"]), &[0, 0]);
        assert_eq!(tally.share(0), Some(0.0));
        assert!(tally.leaders().is_empty());
    }

    #[test]
    fn display() {
        let tally = Tally::new(&labels(&["Yes", "No"]), &[1, 3]);
        assert_eq!(
            tally.to_string(),
            "Yes: 1 vote (25.0%)\nNo: 3 votes (75.0%)\n4 ballots counted"
        );
    }
}
