//! Namespace containers.
//!
//! An unqualified identifier `X` referenced inside container `a.b` resolves
//! against the candidates `a.b.X`, `a.X`, `X`, in that order. Aliases map a
//! short first segment onto a fully-qualified prefix; a leading `.` forces
//! absolute resolution and disables expansion entirely.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    name: String,
    /// short segment → fully-qualified name
    aliases: IndexMap<String, String>,
    /// fully-qualified names registered as abbreviations; kept for export,
    /// each is also materialized into `aliases` under its last segment.
    abbreviations: Vec<String>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: IndexMap::new(),
            abbreviations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &IndexMap<String, String> {
        &self.aliases
    }

    pub fn abbreviations(&self) -> &[String] {
        &self.abbreviations
    }

    /// Registers `short → qualified`. Fails when the short name is not a
    /// single segment or is already taken.
    pub fn add_alias(&mut self, short: impl Into<String>, qualified: impl Into<String>) -> Result<(), String> {
        let short = short.into();
        let qualified = qualified.into();
        if short.is_empty() || short.contains('.') {
            return Err(format!("alias '{short}' must be a single name segment"));
        }
        if self.aliases.contains_key(&short) {
            return Err(format!("alias '{short}' is already registered"));
        }
        self.aliases.insert(short, qualified);
        Ok(())
    }

    /// Registers an abbreviation: the last segment of `qualified` becomes an
    /// alias for the whole name.
    pub fn add_abbreviation(&mut self, qualified: impl Into<String>) -> Result<(), String> {
        let qualified = qualified.into();
        let short = qualified
            .rsplit('.')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("abbreviation '{qualified}' has no name segments"))?
            .to_string();
        self.add_alias(short, qualified.clone())?;
        self.abbreviations.push(qualified);
        Ok(())
    }

    /// Candidate fully-qualified names for `name`, most specific first.
    pub fn candidate_names(&self, name: &str) -> Vec<String> {
        if let Some(absolute) = name.strip_prefix('.') {
            return vec![absolute.to_string()];
        }
        let first_segment = name.split('.').next().unwrap_or(name);
        if let Some(qualified) = self.aliases.get(first_segment) {
            let rest = &name[first_segment.len()..];
            return vec![format!("{qualified}{rest}")];
        }
        let mut out = Vec::new();
        let mut prefix = self.name.as_str();
        while !prefix.is_empty() {
            out.push(format!("{prefix}.{name}"));
            prefix = match prefix.rfind('.') {
                Some(idx) => &prefix[..idx],
                None => "",
            };
        }
        out.push(name.to_string());
        out
    }
}
