//! Line parser: raw G-code text to a structured [`Command`].
//!
//! Two syntax classes are recognised. Classic commands (`G1`, `M104`, `T0`,
//! `G28.1`) take single letter parameters that may be packed against each
//! other (`G1X10Y20`). Extended commands (`SET_FAN SPEED=0.5`) take
//! whitespace separated `KEY=value` pairs, where values may be quoted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GCodeError;

/// Which parameter grammar a command name selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxClass {
    Classic,
    Extended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    params: HashMap<String, String>,
    raw_params: String,
    syntax: SyntaxClass,
}

impl Command {
    /// Uppercased command name, e.g. `G1` or `SET_FAN`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Parameter text after the command name, checksum removed, case preserved.
    pub fn raw_params(&self) -> &str {
        &self.raw_params
    }

    pub fn syntax(&self) -> SyntaxClass {
        self.syntax
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    /// Like [`Command::get`] but missing parameters are a command error.
    pub fn require(&self, key: &str) -> Result<&str, GCodeError> {
        self.get(key).ok_or_else(|| {
            GCodeError::command(format!(
                "Error on '{}': missing {}",
                self.name,
                key.to_ascii_uppercase()
            ))
        })
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, GCodeError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|_| {
                GCodeError::command(format!(
                    "Error on '{}': unable to parse {}",
                    self.name, value
                ))
            }),
        }
    }

    /// True when the parameter is present and holds a truthy value.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_params.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, self.raw_params)
        }
    }
}

/// `1`, `true`, `yes` and `on` (any case), or any non-zero integer.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return n != 0;
    }
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on"
    )
}

/// Whether `name` is a classic letter+number command such as `G1` or `M204.1`.
pub fn is_classic_name(name: &str) -> bool {
    classic_prefix_len(name) == Some(name.len())
}

/// Length of a leading `[GMT]<digits>[.<digits>]` token, if present.
fn classic_prefix_len(token: &str) -> Option<usize> {
    let bytes = token.as_bytes();
    match bytes.first().map(u8::to_ascii_uppercase) {
        Some(b'G' | b'M' | b'T') => {}
        _ => return None,
    }
    let digits_from = |start: usize| {
        bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };
    let whole = digits_from(1);
    if whole == 0 {
        return None;
    }
    let mut end = 1 + whole;
    if bytes.get(end) == Some(&b'.') {
        let frac = digits_from(end + 1);
        if frac > 0 {
            end += 1 + frac;
        }
    }
    Some(end)
}

/// Cut the line at the first `;` that is not escaped with a backslash.
pub fn strip_comment(raw: &str) -> &str {
    let mut escaped = false;
    for (idx, byte) in raw.bytes().enumerate() {
        match byte {
            b'\\' if !escaped => escaped = true,
            b';' if !escaped => return &raw[..idx],
            _ => escaped = false,
        }
    }
    raw
}

fn split_token(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim_start()),
        None => (text, ""),
    }
}

fn is_line_number(token: &str) -> bool {
    let mut chars = token.chars();
    matches!(chars.next(), Some('N' | 'n'))
        && token.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

fn is_param_boundary(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '*' || c == '/'
}

/// Parse one raw line. Returns `None` for blank and comment-only lines.
pub fn parse_line(raw: &str) -> Option<Command> {
    let text = strip_comment(raw).trim();
    if text.is_empty() {
        return None;
    }

    let (mut token, mut rest) = split_token(text);
    if is_line_number(token) && !rest.is_empty() {
        (token, rest) = split_token(rest);
    }

    // Packed classic form: `G1X10` splits into `G1` and `X10`.
    let packed;
    if let Some(len) = classic_prefix_len(token) {
        if len < token.len() && token[len..].starts_with(is_param_boundary) {
            packed = if rest.is_empty() {
                token[len..].to_string()
            } else {
                format!("{} {}", &token[len..], rest)
            };
            token = &token[..len];
            rest = packed.as_str();
        }
    }

    let name = token.to_uppercase();
    let (syntax, params) = if is_classic_name(&name) {
        (SyntaxClass::Classic, parse_classic_params(rest))
    } else {
        (SyntaxClass::Extended, parse_extended_params(rest))
    };

    Some(Command {
        name,
        params,
        raw_params: strip_checksum(rest).to_string(),
        syntax,
    })
}

fn parse_classic_params(rest: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut key: Option<char> = None;
    let mut value = String::new();
    for c in rest.chars() {
        if is_param_boundary(c) {
            if let Some(k) = key.take() {
                params.insert(k.to_string(), value.trim().to_string());
            }
            key = Some(c.to_ascii_uppercase());
            value.clear();
        } else if key.is_some() {
            value.push(c);
        }
    }
    if let Some(k) = key {
        params.insert(k.to_string(), value.trim().to_string());
    }
    params
}

/// Any token without `=` makes the whole parameter list unparseable, in
/// which case the command carries no named parameters at all.
fn parse_extended_params(rest: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for token in split_quoted(rest) {
        let Some((key, value)) = token.split_once('=') else {
            return HashMap::new();
        };
        let key = key.trim();
        if key.is_empty() {
            return HashMap::new();
        }
        params.insert(key.to_uppercase(), unquote(value.trim()).to_string());
    }
    params
}

fn split_quoted(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut quoted = false;
    for (idx, c) in text.char_indices() {
        if c == '"' {
            quoted = !quoted;
        }
        if c.is_whitespace() && !quoted {
            if let Some(s) = start.take() {
                tokens.push(&text[s..idx]);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    tokens
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn strip_checksum(rest: &str) -> &str {
    let rest = rest.trim_end();
    if let Some(idx) = rest.rfind('*') {
        let digits = &rest[idx + 1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return rest[..idx].trim_end();
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_command_with_comment() {
        let cmd = parse_line("G1 X10 Y20.5 ; move").unwrap();
        assert_eq!(cmd.name(), "G1");
        assert_eq!(cmd.syntax(), SyntaxClass::Classic);
        assert_eq!(cmd.get("X"), Some("10"));
        assert_eq!(cmd.get("y"), Some("20.5"));
        assert_eq!(cmd.params().len(), 2);
        assert_eq!(cmd.raw_params(), "X10 Y20.5");
    }

    #[test]
    fn extended_command_with_quoted_value() {
        let cmd = parse_line("SET_FAN SPEED=0.5 NAME=\"part fan\"").unwrap();
        assert_eq!(cmd.name(), "SET_FAN");
        assert_eq!(cmd.syntax(), SyntaxClass::Extended);
        assert_eq!(cmd.get("SPEED"), Some("0.5"));
        assert_eq!(cmd.get("name"), Some("part fan"));
    }

    #[test]
    fn blank_and_comment_lines_have_no_command() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   \t").is_none());
        assert!(parse_line("; only a comment").is_none());
    }

    #[test]
    fn escaped_semicolon_is_not_a_comment() {
        let cmd = parse_line("M117 a\\;b ; c").unwrap();
        assert_eq!(cmd.raw_params(), "a\\;b");
    }

    #[test]
    fn lowercase_and_packed_classic() {
        let cmd = parse_line("g1x10y2").unwrap();
        assert_eq!(cmd.name(), "G1");
        assert_eq!(cmd.get("X"), Some("10"));
        assert_eq!(cmd.get("Y"), Some("2"));
    }

    #[test]
    fn line_number_and_checksum() {
        let cmd = parse_line("N42 G1 X5*71").unwrap();
        assert_eq!(cmd.name(), "G1");
        assert_eq!(cmd.get("X"), Some("5"));
        assert_eq!(cmd.raw_params(), "X5");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let cmd = parse_line("G1 X1 X2").unwrap();
        assert_eq!(cmd.get("X"), Some("2"));
        let cmd = parse_line("MY_MACRO A=1 a=3").unwrap();
        assert_eq!(cmd.get("A"), Some("3"));
    }

    #[test]
    fn malformed_extended_params_are_empty() {
        let cmd = parse_line("RESPOND hello world").unwrap();
        assert_eq!(cmd.name(), "RESPOND");
        assert!(cmd.params().is_empty());
        assert_eq!(cmd.raw_params(), "hello world");
    }

    #[test]
    fn decimal_classic_names() {
        assert!(is_classic_name("G28.1"));
        assert!(is_classic_name("T0"));
        assert!(!is_classic_name("G"));
        assert!(!is_classic_name("G1_HOME"));
        assert!(!is_classic_name("SET_FAN"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let a = parse_line("  M104 S200 T0 ").unwrap();
        let b = parse_line("  M104 S200 T0 ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn typed_accessors() {
        let cmd = parse_line("M26 S1024").unwrap();
        assert_eq!(cmd.get_parsed::<u64>("S").unwrap(), Some(1024));
        assert!(cmd.get_parsed::<u64>("P").unwrap().is_none());
        assert!(cmd.require("P").is_err());
        let cmd = parse_line("SDCARD_PRINT_FILE FILENAME=a.gcode INCLUDE=1").unwrap();
        assert!(cmd.flag("INCLUDE"));
        assert!(!cmd.flag("MISSING"));
    }
}
