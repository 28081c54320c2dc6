// Implementation comes from https://github.com/njsmith/posy/blob/main/src/vocab/rfc822ish.rs
// Licensed under MIT or Apache-2.0

use std::collections::HashMap;
use std::str::FromStr;

type Fields = HashMap<String, Vec<String>>;

/// A parsed METADATA/PKG-INFO style file: a series of (repeatable) header
/// fields followed by an optional free-form body.
pub(crate) struct RFC822ish {
    fields: Fields,
    #[allow(dead_code)]
    body: Option<String>,
}

// Allegedly, a METADATA file is formatted as an RFC822 email message.
// This is absolutely not true. The actual format is "whatever
// the Python stdlib module email.parser does". To probe its behavior, a
// convenient entry point is 'email.message_from_string'.
//
// Overall structure: A series of header lines, then an empty line, then
// the "message body" (= description field, in modern PKG-INFO/METADATA
// files).
//
// email.parser module is also extremely lenient of errors. We'll try to be a
// bit more strict -- we try to be lenient of mangled utf-8, because obviously
// someone must have messed that up in the history of PyPI, and aren't picky
// about stuff like trailing newlines. But we fail on oddities like an empty
// field name or a continuation line at the start of input, where email.parser
// would keep on trucking. Fingers crossed that it works out.
peg::parser! {
    grammar rfc822ish_parser() for str {
        // In real RFC822, only CRLF is legal. email.parser is more lenient.
        rule line_ending()
            = quiet!{"\r\n" / "\r" / "\n"}
              / expected!("end of line")

        rule field_name() -> &'input str
            = quiet!{$(['\x21'..='\x39' | '\x3b'..='\x7e']+)}
              / expected!("field name")

        // email.parser drops any " \t" after the colon, but preserves other
        // whitespace in the field value.
        rule field_separator()
            = ":" [' ' | '\t']*

        rule field_value_piece()
            = [^ '\r' | '\n']*

        rule continuation_line_ending()
            = quiet!{line_ending() [' ' | '\t']} / expected!("continuation line")

        // In real RFC822, continuation lines are folded together into a
        // single line, removing the newline characters. email.parser doesn't
        // do that though -- continuation lines just get embedded newlines.
        // (But you don't include any *trailing* newlines. Those are
        // discarded.)
        rule field_value() -> &'input str
            = $(field_value_piece() ** continuation_line_ending())

        rule field() -> (String, String)
            = n:field_name() field_separator() v:field_value()
                { (n.to_ascii_lowercase(), v.to_owned()) }

        rule fields() -> Vec<(String, String)>
            = field() ** line_ending()

        // I think in real RFC822, the body is mandatory? But in early
        // versions of the metadata spec, PKG-INFO/METADATA files didn't have
        // a body, and email.parser don't care, it does what it wants.
        rule trailing_body() -> String
            = line_ending() line_ending() b:$([_]*) { b.to_owned() }

        // The extra line_ending() is to handle the case where there's
        // no trailing body, and exactly one line ending at EOF. If
        // trailing_body matches then the input will be fully consumed by
        // then; if not, then we might have a stray trailing newline to
        // absorb.
        pub rule rfc822ish() -> RFC822ish
            = f:fields() body:(trailing_body()?) line_ending()?
                 {
                     let mut fields = Fields::new();
                     for (name, value) in f {
                         fields.entry(name).or_default().push(value)
                     };
                     RFC822ish { fields, body, }
                 }
    }
}

impl FromStr for RFC822ish {
    type Err = peg::error::ParseError<peg::str::LineCol>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        rfc822ish_parser::rfc822ish(s)
    }
}

impl RFC822ish {
    /// Removes and returns every value recorded for `key`.
    pub fn take_all(&mut self, key: &str) -> Vec<String> {
        match self.fields.remove(&key.to_ascii_lowercase()) {
            Some(vec) => vec,
            None => Vec::new(),
        }
    }

    /// Removes a key that may appear at most once.
    pub fn maybe_take(&mut self, key: &str) -> Result<Option<String>, String> {
        let mut values = self.take_all(key);
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Err(format!("multiple values for singleton key {key}")),
        }
    }

    /// Removes a key that must appear exactly once.
    pub fn take(&mut self, key: &str) -> Result<String, String> {
        match self.maybe_take(key)? {
            Some(result) => Ok(result),
            None => Err(format!("can't find required key {key}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic_parse() {
        let input = "Metadata-Version: 2.1\nName: trio\nVersion: 0.18.0\nRequires-Dist: attrs (>=19.2.0)\nRequires-Dist: idna\n\nThe description body.\n";
        let mut parsed = RFC822ish::from_str(input).unwrap();
        assert_eq!(parsed.take("Name").unwrap(), "trio");
        assert_eq!(
            parsed.take_all("Requires-Dist"),
            vec!["attrs (>=19.2.0)", "idna"]
        );
        assert_eq!(parsed.body.as_deref(), Some("The description body.\n"));
    }

    #[test]
    fn test_continuation_lines() {
        let input = "Name: foo\nSummary: one\n two\n";
        let mut parsed = RFC822ish::from_str(input).unwrap();
        assert_eq!(parsed.take("Summary").unwrap(), "one\n two");
    }

    #[test]
    fn test_duplicate_singleton_key() {
        let input = "Name: foo\nName: bar\n";
        let mut parsed = RFC822ish::from_str(input).unwrap();
        assert!(parsed.take("Name").is_err());
    }
}
