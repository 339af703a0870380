use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// Query text with `${name}` placeholders. `$${` produces a literal `${`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(pos) = rest.find("${") {
            let (before, after) = rest.split_at(pos);
            if let Some(kept) = before.strip_suffix('$') {
                literal.push_str(kept);
                literal.push_str("${");
                rest = after.strip_prefix("${").unwrap_or(after);
                continue;
            }
            literal.push_str(before);

            let after = after.strip_prefix("${").unwrap_or(after);
            let Some(end) = after.find('}') else {
                return Err(Error::Configuration(format!(
                    "unterminated placeholder in query: '${{{after}'"
                )));
            };
            let (name, tail) = after.split_at(end);
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Configuration(
                    "empty placeholder in query".to_string(),
                ));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Variable(name.to_string()));
            rest = tail.strip_prefix('}').unwrap_or(tail);
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitutes every placeholder, unknown variables render as an empty string.
    pub fn render<'a, F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Variable(name) => lookup(name).unwrap_or_default(),
            })
            .collect()
    }
}
