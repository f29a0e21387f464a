use std::ops::Range;
use std::path::Path;

use crate::{RebaseError, RevisionId};

const REVISION_KEY: &str = "revision";
const PARENT_KEY: &str = "down_revision";
const MESSAGE_KEY: &str = "message";
const MARKER_KEY: &str = "migrate";
const ROOT_PARENT: &str = "none";

/// Typed view of one migration script.
///
/// The header fields are parsed into values while the file text is kept
/// verbatim. The byte span of the `down_revision` value is remembered so a
/// relink replaces exactly that span and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDocument {
    raw: String,
    revision: RevisionId,
    parents: Vec<RevisionId>,
    parent_span: Option<Range<usize>>,
    message: Option<String>,
    upgrade: Option<Range<usize>>,
    downgrade: Option<Range<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Upgrade,
    Downgrade,
}

struct HeaderLine<'a> {
    key: &'a str,
    value: &'a str,
    value_span: Range<usize>,
}

impl ScriptDocument {
    /// Parse script text read from `path`.
    ///
    /// # Errors
    /// Returns [`RebaseError::MalformedScript`] when the `revision` header is
    /// missing or any recorded revision id is not a valid token.
    pub fn parse(path: &Path, raw: String) -> Result<Self, RebaseError> {
        let mut revision_value: Option<&str> = None;
        let mut parent_field: Option<(&str, Range<usize>)> = None;
        let mut message = None;
        let mut upgrade_start = None;
        let mut downgrade_start = None;
        let mut upgrade = None;
        let mut downgrade = None;
        let mut section = Section::Header;

        let mut offset = 0;
        for line in raw.split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();

            let Some(header) = parse_header_line(line, line_start) else {
                continue;
            };

            if header.key == MARKER_KEY {
                let next = match header.value {
                    "up" => Section::Upgrade,
                    "down" => Section::Downgrade,
                    _ => continue,
                };
                close_section(line_start, &mut upgrade_start, &mut upgrade);
                close_section(line_start, &mut downgrade_start, &mut downgrade);
                match next {
                    Section::Upgrade if upgrade.is_none() && upgrade_start.is_none() => {
                        upgrade_start = Some(offset);
                    }
                    Section::Downgrade if downgrade.is_none() && downgrade_start.is_none() => {
                        downgrade_start = Some(offset);
                    }
                    _ => {
                        return Err(RebaseError::malformed(
                            path,
                            format!("duplicate `-- migrate:{}` marker", header.value),
                        ));
                    }
                }
                section = next;
                continue;
            }

            if section != Section::Header {
                continue;
            }

            match header.key {
                REVISION_KEY if revision_value.is_none() => revision_value = Some(header.value),
                PARENT_KEY if parent_field.is_none() => {
                    parent_field = Some((header.value, header.value_span));
                }
                MESSAGE_KEY if message.is_none() => message = Some(header.value.to_string()),
                _ => {}
            }
        }
        close_section(raw.len(), &mut upgrade_start, &mut upgrade);
        close_section(raw.len(), &mut downgrade_start, &mut downgrade);

        let Some(revision_value) = revision_value else {
            return Err(RebaseError::malformed(path, "missing `-- revision:` header"));
        };
        let revision = RevisionId::parse(revision_value).ok_or_else(|| {
            RebaseError::malformed(path, format!("invalid revision id `{revision_value}`"))
        })?;

        let (parents, parent_span) = match parent_field {
            Some((value, span)) => (parse_parents(path, value)?, Some(span)),
            None => (Vec::new(), None),
        };

        if parents.contains(&revision) {
            return Err(RebaseError::malformed(
                path,
                format!("revision {revision} records itself as its parent"),
            ));
        }

        Ok(Self { raw, revision, parents, parent_span, message, upgrade, downgrade })
    }

    #[must_use]
    pub fn revision(&self) -> &RevisionId {
        &self.revision
    }

    /// First recorded parent; the lineage followed when building chains.
    #[must_use]
    pub fn parent(&self) -> Option<&RevisionId> {
        self.parents.first()
    }

    /// Every recorded parent, more than one at a merge point.
    #[must_use]
    pub fn parents(&self) -> &[RevisionId] {
        &self.parents
    }

    #[must_use]
    pub fn has_parent_field(&self) -> bool {
        self.parent_span.is_some()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn into_raw(self) -> String {
        self.raw
    }

    #[must_use]
    pub fn upgrade_body(&self) -> Option<&str> {
        self.upgrade.clone().map(|span| &self.raw[span])
    }

    #[must_use]
    pub fn downgrade_body(&self) -> Option<&str> {
        self.downgrade.clone().map(|span| &self.raw[span])
    }

    /// Return a copy whose first `down_revision` entry is replaced by
    /// `new_parent`.
    ///
    /// Only the bytes of that entry change. The remaining parents of a merge
    /// script are kept; `None` drops the first entry, and an empty list is
    /// written as `none`. Relinking to the value already recorded yields
    /// identical text.
    ///
    /// # Errors
    /// Returns [`RebaseError::MalformedScript`] when the script has no
    /// `down_revision` field to rewrite.
    pub fn relinked(
        &self,
        path: &Path,
        new_parent: Option<&RevisionId>,
    ) -> Result<Self, RebaseError> {
        let Some(span) = self.parent_span.clone() else {
            return Err(RebaseError::malformed(
                path,
                "missing `-- down_revision:` header to relink",
            ));
        };

        let (span, value) = match (new_parent, self.parents.len()) {
            (Some(parent), 2..) => (self.first_parent_span(&span), parent.to_string()),
            (None, 2..) => (span, join_parents(&self.parents[1..])),
            (parent, _) => (span, parent.map_or(ROOT_PARENT, RevisionId::as_str).to_string()),
        };
        let separator = if span.is_empty() && !self.raw[..span.start].ends_with(char::is_whitespace)
        {
            " "
        } else {
            ""
        };

        let mut raw = String::with_capacity(self.raw.len() + value.len());
        raw.push_str(&self.raw[..span.start]);
        raw.push_str(separator);
        raw.push_str(&value);
        raw.push_str(&self.raw[span.end..]);

        Self::parse(path, raw)
    }

    /// Byte span of the first comma-separated entry inside `value_span`.
    fn first_parent_span(&self, value_span: &Range<usize>) -> Range<usize> {
        let value = &self.raw[value_span.clone()];
        let first = value.split(',').next().unwrap_or_default().trim_end();
        value_span.start..value_span.start + first.len()
    }
}

fn join_parents(parents: &[RevisionId]) -> String {
    parents.iter().map(RevisionId::as_str).collect::<Vec<_>>().join(", ")
}

/// Recognise `-- key: value` lines; `line_start` is the byte offset of `line`.
fn parse_header_line(line: &str, line_start: usize) -> Option<HeaderLine<'_>> {
    let content = line.trim_end_matches(['\n', '\r']);
    let rest = content.strip_prefix("--")?;
    let key_start = content.len() - rest.trim_start().len();
    let (key, after_colon) = content[key_start..].split_once(':')?;
    let key = key.trim_end();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let after_colon_start = content.len() - after_colon.len();
    let value = after_colon.trim();
    let value_start = if value.is_empty() {
        content.trim_end().len().max(after_colon_start)
    } else {
        after_colon_start + (after_colon.len() - after_colon.trim_start().len())
    };

    Some(HeaderLine {
        key,
        value,
        value_span: (line_start + value_start)..(line_start + value_start + value.len()),
    })
}

fn parse_parents(path: &Path, value: &str) -> Result<Vec<RevisionId>, RebaseError> {
    if value.is_empty() || value.eq_ignore_ascii_case(ROOT_PARENT) {
        return Ok(Vec::new());
    }

    let mut parents: Vec<RevisionId> = Vec::new();
    for raw in value.split(',') {
        let raw = raw.trim();
        let parent = RevisionId::parse(raw).ok_or_else(|| {
            RebaseError::malformed(path, format!("invalid down_revision entry `{raw}`"))
        })?;
        if parents.contains(&parent) {
            return Err(RebaseError::malformed(path, format!("duplicate parent {parent}")));
        }
        parents.push(parent);
    }
    Ok(parents)
}

fn close_section(end: usize, start: &mut Option<usize>, body: &mut Option<Range<usize>>) {
    if let Some(begin) = start.take() {
        *body = Some(begin..end.max(begin));
    }
}
