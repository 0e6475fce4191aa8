// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Field extraction from provisioning API log lines.
//!
//! The same event may be logged as a JSON object, possibly behind a
//! timestamp prefix, or as flat `key=value` tokens:
//!
//! ```text
//! {"level":"info","msg":"ipxe_boot_request","uuid":"1234-..."}
//! 2024-03-01T12:00:00Z level=info msg=profile_matched uuid=1234-... profile="default"
//! ```
//!
//! A line is read as JSON only when nothing but bare words, such as a
//! timestamp or level, precedes the object. Flat values may themselves be
//! JSON objects (`labels={"rack":"4"}`) and are kept whole.

use serde_json::Value;

/// Boot request from iPXE.
pub(crate) const BOOT_REQUEST: &str = "ipxe_boot_request";
/// The API matched a profile.
pub(crate) const PROFILE_MATCHED: &str = "profile_matched";
/// The API selected an assignment.
pub(crate) const ASSIGNMENT_SELECTED: &str = "assignment_selected";
/// The machine fetched its rendered configuration.
pub(crate) const CONFIG_RETRIEVED: &str = "config_retrieved";

const UUID_FIELD: &str = "uuid";
/// Fields that name a line's event.
const EVENT_FIELDS: &[&str] = &["msg", "event", "message"];

/// A log line split into fields.
#[derive(Debug)]
pub(crate) struct LogLine<'a> {
    raw: &'a str,
    fields: Vec<(String, String)>,
    words: Vec<&'a str>,
}

impl<'a> LogLine<'a> {
    pub fn parse(raw: &'a str) -> Self {
        if let Some(fields) = parse_structured(raw) {
            return Self {
                raw,
                fields,
                words: Vec::new(),
            };
        }
        let mut fields = Vec::new();
        let mut words = Vec::new();
        for token in tokens(raw) {
            match token {
                Token::Pair(k, v) => fields.push((k.to_owned(), v)),
                Token::Word(w) => words.push(w),
            }
        }
        Self { raw, fields, words }
    }

    pub fn raw(&self) -> &'a str {
        self.raw
    }

    /// The first value of `key`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The value of the first of `keys` present on the line.
    pub fn first_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.field(key))
    }

    /// Whether the line is the event `marker`, either as the value of an
    /// event field (as in `msg=marker`) or as a bare word.
    pub fn is_event(&self, marker: &str) -> bool {
        self.fields
            .iter()
            .any(|(k, v)| v == marker && EVENT_FIELDS.contains(&k.as_str()))
            || self.words.contains(&marker)
    }

    /// The line's UUID field, if any.
    pub fn uuid(&self) -> Option<&str> {
        self.field(UUID_FIELD)
    }

    /// Whether the line names `uuid`.
    pub fn is_for(&self, uuid: &str) -> bool {
        self.uuid().is_some_and(|u| u.eq_ignore_ascii_case(uuid))
    }

    /// Whether the line names some UUID other than `uuid`.
    pub fn is_for_other(&self, uuid: &str) -> bool {
        self.uuid().is_some_and(|u| !u.eq_ignore_ascii_case(uuid))
    }
}

/// Parses every non-empty line of `text`.
pub(crate) fn parse_lines(text: &str) -> Vec<LogLine<'_>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(LogLine::parse)
        .collect()
}

fn parse_structured(raw: &str) -> Option<Vec<(String, String)>> {
    let start = raw.find('{')?;
    if raw[..start].contains('=') {
        return None;
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw[start..].trim_end()) else {
        return None;
    };
    let fields = map
        .into_iter()
        .filter_map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k, v))
        })
        .collect();
    Some(fields)
}

enum Token<'a> {
    Pair(&'a str, String),
    Word(&'a str),
}

/// Splits a flat line on whitespace, keeping double-quoted values (with
/// backslash escapes) together.
fn tokens(line: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        if let Some(value) = tail.strip_prefix('=') {
            let (value, remainder) = if let Some(quoted) = value.strip_prefix('"') {
                unquote(quoted)
            } else if value.starts_with('{') {
                let end = object_end(value);
                (value[..end].to_owned(), &value[end..])
            } else {
                let end = value.find(char::is_whitespace).unwrap_or(value.len());
                (value[..end].to_owned(), &value[end..])
            };
            if !head.is_empty() {
                out.push(Token::Pair(head, value));
            }
            rest = remainder.trim_start();
        } else {
            out.push(Token::Word(head));
            rest = tail.trim_start();
        }
    }
    out
}

/// Reads a quoted value up to its closing quote, returning the value and the
/// text after it. An unterminated quote runs to the end of the line.
fn unquote(s: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (value, &s[i + 1..]),
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            c => value.push(c),
        }
    }
    (value, "")
}

/// The length of the brace-balanced object at the start of `s`, ignoring
/// braces inside strings. An unbalanced object runs to the next whitespace.
fn object_end(s: &str) -> usize {
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    s.find(char::is_whitespace).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_line() {
        let line = LogLine::parse(
            r#"{"level":"info","msg":"profile_matched","uuid":"ABC","profile":"default","attempt":2}"#,
        );
        assert!(line.is_event(PROFILE_MATCHED));
        assert!(!line.is_event(BOOT_REQUEST));
        assert_eq!(line.field("profile"), Some("default"));
        assert_eq!(line.field("attempt"), Some("2"));
        assert!(line.is_for("abc"));
    }

    #[test]
    fn structured_line_behind_timestamp() {
        let line = LogLine::parse(r#"2024-03-01T12:00:00.000Z {"msg":"ipxe_boot_request","uuid":"u1"}"#);
        assert!(line.is_event(BOOT_REQUEST));
        assert_eq!(line.uuid(), Some("u1"));
    }

    #[test]
    fn flat_line_with_quotes() {
        let line = LogLine::parse(
            r#"time="2024-03-01 12:00:00" level=info msg=assignment_selected uuid=u1 assignment="rack 4 \"east\"""#,
        );
        assert!(line.is_event(ASSIGNMENT_SELECTED));
        assert_eq!(line.field("time"), Some("2024-03-01 12:00:00"));
        assert_eq!(line.field("assignment"), Some(r#"rack 4 "east""#));
        assert_eq!(line.uuid(), Some("u1"));
    }

    #[test]
    fn bare_marker_word() {
        let line = LogLine::parse("INFO config_retrieved uuid=u2 config=worker.ign");
        assert!(line.is_event(CONFIG_RETRIEVED));
        assert_eq!(line.first_field(&["config", "name"]), Some("worker.ign"));
        assert!(line.is_for_other("u1"));
        assert!(!line.is_for_other("U2"));
    }

    #[test]
    fn marker_prefix_is_not_the_event() {
        let line = LogLine::parse("msg=ipxe_boot_request_failed uuid=u1");
        assert!(!line.is_event(BOOT_REQUEST));
    }

    #[test]
    fn broken_json_falls_back_to_tokens() {
        let line = LogLine::parse(r#"msg=profile_matched name=a {"truncated"#);
        assert!(line.is_event(PROFILE_MATCHED));
        assert_eq!(line.first_field(&["profile", "name"]), Some("a"));
    }

    #[test]
    fn flat_line_with_object_value() {
        let line = LogLine::parse(
            r#"level=info msg=profile_matched uuid=X profile=default labels={"rack": "4", "note": "a}b"} attempt=2"#,
        );
        assert!(line.is_event(PROFILE_MATCHED));
        assert_eq!(line.uuid(), Some("X"));
        assert_eq!(line.field("profile"), Some("default"));
        assert_eq!(line.field("labels"), Some(r#"{"rack": "4", "note": "a}b"}"#));
        assert_eq!(line.field("attempt"), Some("2"));
    }

    #[test]
    fn marker_in_other_field_is_not_the_event() {
        let line = LogLine::parse("msg=profile_matched prev=ipxe_boot_request uuid=X profile=a");
        assert!(line.is_event(PROFILE_MATCHED));
        assert!(!line.is_event(BOOT_REQUEST));

        let line = LogLine::parse(r#"{"event":"config_retrieved","after":"profile_matched"}"#);
        assert!(line.is_event(CONFIG_RETRIEVED));
        assert!(!line.is_event(PROFILE_MATCHED));
    }

    #[test]
    fn blank_lines_are_dropped() {
        assert_eq!(parse_lines("a=1\n\n   \nb=2\n").len(), 2);
    }
}
