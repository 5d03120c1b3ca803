//! Page targets: element locators and URL patterns.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How to find an element on a page.
///
/// Config strings use a `kind=value` prefix; anything without a known prefix
/// is a CSS selector:
///
/// ```text
/// label=Username
/// role=button[name="Sign in"]
/// placeholder=Email address
/// text=Stay signed in?
/// #kc-login
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Locator {
    Css(String),
    Label(String),
    Role { role: String, name: Option<String> },
    Placeholder(String),
    Text(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self::Css(selector.into())
    }

    pub fn label(text: impl Into<String>) -> Self {
        Self::Label(text.into())
    }

    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Role {
            role: role.into(),
            name: Some(name.into()),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn placeholder(text: impl Into<String>) -> Self {
        Self::Placeholder(text.into())
    }

    /// Parse a config string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("label=") {
            return Self::Label(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix("placeholder=") {
            return Self::Placeholder(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix("text=") {
            return Self::Text(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix("css=") {
            return Self::Css(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix("role=") {
            return parse_role(rest);
        }
        Self::Css(raw.to_string())
    }

    /// Whether this locator relies on accessible names rather than markup.
    #[must_use]
    pub const fn is_semantic(&self) -> bool {
        !matches!(self, Self::Css(_))
    }
}

fn parse_role(rest: &str) -> Locator {
    let Some((role, attrs)) = rest.split_once('[') else {
        return Locator::Role {
            role: rest.to_string(),
            name: None,
        };
    };
    let name = attrs
        .strip_suffix(']')
        .unwrap_or(attrs)
        .strip_prefix("name=")
        .map(|n| n.trim_matches(|c| c == '"' || c == '\'').to_string());
    Locator::Role {
        role: role.to_string(),
        name,
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(sel) => f.write_str(sel),
            Self::Label(text) => write!(f, "label={text}"),
            Self::Role { role, name: None } => write!(f, "role={role}"),
            Self::Role {
                role,
                name: Some(name),
            } => write!(f, "role={role}[name=\"{name}\"]"),
            Self::Placeholder(text) => write!(f, "placeholder={text}"),
            Self::Text(text) => write!(f, "text={text}"),
        }
    }
}

impl From<String> for Locator {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for Locator {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.to_string()
    }
}

/// URL glob: `**` matches anything, `*` matches within one path segment.
///
/// A pattern also matches the same URL with a query string or fragment
/// appended, so `https://app.test/home` matches `https://app.test/home?x=1`.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut re = String::with_capacity(pattern.len() * 2 + 16);
        re.push('^');
        let mut chars = pattern.chars().peekable();
        let mut literal = String::new();
        while let Some(c) = chars.next() {
            if c == '*' {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            } else {
                literal.push(c);
            }
        }
        re.push_str(&regex::escape(&literal));
        re.push_str("(?:[?#].*)?$");
        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&re)?,
        })
    }

    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
