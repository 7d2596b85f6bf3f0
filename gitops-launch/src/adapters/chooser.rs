//! Interactive selection on the terminal

use crate::bootstrap::collaborators::Chooser;
use crate::error::{NoChoiceSnafu, Result, TerminalSnafu};
use console::{Term, style};
use snafu::ResultExt;
use std::io;

/// Numbered list on stderr, answer read from the terminal.
#[derive(Debug, Clone)]
pub struct ConsoleChooser {
    term: Term,
}

impl ConsoleChooser {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl Default for ConsoleChooser {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts either the 1-based index or the option text itself.
pub fn parse_choice(answer: &str, options: &[String]) -> Option<String> {
    let answer = answer.trim();
    if let Ok(index) = answer.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| options.get(i))
            .cloned();
    }
    options
        .iter()
        .find(|option| option.eq_ignore_ascii_case(answer))
        .cloned()
}

impl ConsoleChooser {
    /// `None` after three answers that match no option.
    fn ask(&self, prompt: &str, options: &[String]) -> io::Result<Option<String>> {
        self.term.write_line(&style(prompt).bold().to_string())?;
        for (i, option) in options.iter().enumerate() {
            self.term.write_line(&format!("  {}) {option}", i + 1))?;
        }
        for _ in 0..3 {
            self.term.write_str("> ")?;
            let answer = self.term.read_line()?;
            if let Some(choice) = parse_choice(&answer, options) {
                return Ok(Some(choice));
            }
            self.term
                .write_line(&style("not one of the options").yellow().to_string())?;
        }
        Ok(None)
    }
}

impl Chooser for ConsoleChooser {
    fn choose_one(&self, prompt: &str, options: &[String]) -> Result<String> {
        if options.is_empty() || !self.term.is_term() {
            return NoChoiceSnafu { prompt }.fail();
        }
        match self.ask(prompt, options).context(TerminalSnafu { prompt })? {
            Some(choice) => Ok(choice),
            None => NoChoiceSnafu { prompt }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn providers() -> Vec<String> {
        vec!["gitlab".to_string(), "github".to_string()]
    }

    #[test]
    fn test_parse_choice_by_index_and_name() {
        assert_eq!(parse_choice("2", &providers()), Some("github".to_string()));
        assert_eq!(parse_choice(" GitLab ", &providers()), Some("gitlab".to_string()));
        assert_eq!(parse_choice("0", &providers()), None);
        assert_eq!(parse_choice("3", &providers()), None);
        assert_eq!(parse_choice("bitbucket", &providers()), None);
    }

    #[test]
    fn test_empty_options_is_no_choice() {
        let err = ConsoleChooser::new().choose_one("provider?", &[]).unwrap_err();
        assert!(matches!(err, Error::NoChoice { .. }));
    }
}
