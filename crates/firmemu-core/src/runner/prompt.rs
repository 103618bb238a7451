//! Prompt/response scripting for interactive commands.

use regex::Regex;

#[derive(Debug, Clone)]
struct Prompt {
    pattern: Regex,
    response: String,
}

/// Ordered table of `{pattern: response}` pairs.
///
/// When several patterns match, the one matching earliest in the output wins;
/// ties go to the pattern registered first.
#[derive(Debug, Clone, Default)]
pub struct PromptTable {
    prompts: Vec<Prompt>,
}

impl PromptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a regex prompt pattern.
    pub fn pattern(
        mut self,
        pattern: &str,
        response: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        self.prompts.push(Prompt {
            pattern: Regex::new(pattern)?,
            response: response.into(),
        });
        Ok(self)
    }

    /// Register a prompt matched as literal text.
    pub fn literal(self, text: &str, response: impl Into<String>) -> Result<Self, regex::Error> {
        self.pattern(&regex::escape(text), response)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Find the earliest prompt in `text`.
    ///
    /// Returns the byte offset just past the match and the response to send.
    pub fn find(&self, text: &str) -> Option<(usize, &str)> {
        self.prompts
            .iter()
            .filter_map(|p| p.pattern.find(text).map(|m| (m.start(), m.end(), p)))
            .min_by_key(|(start, _, _)| *start)
            .map(|(_, end, p)| (end, p.response.as_str()))
    }
}
