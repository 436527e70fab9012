//! Path templates: `/users/{id}/posts`, `/files/*`.

use std::cmp::{Ordering, Reverse};

use percent_encoding::percent_decode_str;
use thiserror::Error;

use crate::context::PathParams;
use crate::http::request::trim_trailing_slash;

/// Name under which a trailing `*` segment captures the rest of the path.
pub const WILDCARD_PARAM: &str = "wildcard";

/// Rejected template strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template `{template}` must start with `/`")]
    MissingLeadingSlash { template: String },

    #[error("template `{template}` has a malformed segment `{segment}`")]
    InvalidSegment { template: String, segment: String },

    #[error("template `{template}` declares `{name}` more than once")]
    DuplicateParam { template: String, name: String },

    #[error("template `{template}` uses `*` before the last segment")]
    MisplacedWildcard { template: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// A compiled path template.
///
/// `{name}` matches exactly one non-empty segment and captures its
/// percent-decoded value. A final `*` matches the remainder of the path
/// (possibly empty) and captures it under [`WILDCARD_PARAM`]. Trailing slashes
/// are ignored on both sides.
///
/// Templates order by specificity: literal-only templates first, then by
/// ascending parameter count, with wildcard templates last. Remaining ties go
/// to the template whose first parameter appears later, then to string order.
///
/// ```
/// use switchyard::router::PathTemplate;
///
/// let template = PathTemplate::parse("/users/{id}").unwrap();
/// let params = template.matches("/users/ada%20l").unwrap();
/// assert_eq!(params.get("id"), Some("ada l"));
/// assert!(template.matches("/users").is_none());
///
/// let literal = PathTemplate::parse("/users/active").unwrap();
/// assert!(literal < template);
/// ```
#[derive(Debug, Clone)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if !template.starts_with('/') {
            return Err(TemplateError::MissingLeadingSlash {
                template: template.to_owned(),
            });
        }
        let source = trim_trailing_slash(template).to_owned();

        let mut segments = Vec::new();
        for raw in split_segments(&source) {
            if matches!(segments.last(), Some(Segment::Wildcard)) {
                return Err(TemplateError::MisplacedWildcard {
                    template: source.clone(),
                });
            }
            let segment = parse_segment(raw).ok_or_else(|| TemplateError::InvalidSegment {
                template: source.clone(),
                segment: raw.to_owned(),
            })?;
            if let Segment::Param(name) = &segment {
                let duplicate = segments
                    .iter()
                    .any(|s| matches!(s, Segment::Param(existing) if existing == name));
                if duplicate {
                    return Err(TemplateError::DuplicateParam {
                        template: source.clone(),
                        name: name.clone(),
                    });
                }
            }
            segments.push(segment);
        }

        Ok(Self { source, segments })
    }

    /// The template string as registered, minus any trailing slash.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    /// Matches `path`, returning the decoded parameters on success.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);
        let mut parts = split_segments(path);
        let mut params = PathParams::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => {
                    if parts.next()? != literal.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let part = parts.next()?;
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), decode(part)?);
                }
                Segment::Wildcard => {
                    let rest: Vec<&str> = parts.by_ref().collect();
                    let rest = if rest.is_empty() {
                        String::new()
                    } else {
                        format!("/{}", rest.join("/"))
                    };
                    params.insert(WILDCARD_PARAM, decode(&rest)?);
                }
            }
        }

        parts.next().is_none().then_some(params)
    }

    fn first_param_position(&self) -> usize {
        self.segments
            .iter()
            .position(|s| !matches!(s, Segment::Literal(_)))
            .unwrap_or(self.segments.len())
    }

    fn specificity(&self) -> (bool, usize, Reverse<usize>, &str) {
        (
            self.has_wildcard(),
            self.param_count(),
            Reverse(self.first_param_position()),
            self.source.as_str(),
        )
    }
}

impl PartialEq for PathTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathTemplate {}

impl PartialOrd for PathTemplate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathTemplate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.specificity().cmp(&other.specificity())
    }
}

impl std::fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// "/" yields no segments; "/a//b" yields "a", "", "b".
fn split_segments(path: &str) -> impl Iterator<Item = &str> + '_ {
    let body = path.strip_prefix('/').unwrap_or(path);
    body.split('/').filter(move |_| !body.is_empty())
}

fn parse_segment(raw: &str) -> Option<Segment> {
    if raw == "*" {
        return Some(Segment::Wildcard);
    }
    if let Some(inner) = raw.strip_prefix('{') {
        let name = inner.strip_suffix('}')?;
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        return valid.then(|| Segment::Param(name.to_owned()));
    }
    if raw.contains(['{', '}', '*']) {
        return None;
    }
    Some(Segment::Literal(raw.to_owned()))
}

fn decode(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|value| value.into_owned())
}
