//! Profile option model.
//!
//! A profile is an ordered bag of directives: a name plus argument tokens,
//! parsed from line-oriented text with quoting, comments, and multiline
//! inline blocks (`<name>` ... `</name>`). Every component configures itself
//! by querying the list; each successful lookup marks the matched option as
//! touched so leftover directives can be reported after the handshake.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Hard cap on total profile size in bytes.
pub const MAX_PROFILE_SIZE: usize = 256 * 1024;

/// Hard cap on a single profile line in bytes.
pub const MAX_LINE_LEN: usize = 256;

/// Hard cap on argument tokens per directive.
pub const MAX_OPTION_ARGS: usize = 16;

/// Directives that are legitimately ignored by this core and excluded from
/// the unused-option audit.
const AUDIT_IGNORE: &[&str] = &[
    "dev",
    "dev-type",
    "nobind",
    "persist-key",
    "persist-tun",
    "resolv-retry",
    "verb",
    "mute",
    "mute-replay-warnings",
    "user",
    "group",
    "script-security",
    "explicit-exit-notify",
    "pull",
    "setenv",
    "auth-nocache",
];

/// Filter a string down to printable UTF-8, truncating to `max_len` bytes.
///
/// Applied to anything that carries user or peer data into a log line or
/// host-visible message.
pub fn utf8_printable(s: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_len));
    for c in s.chars() {
        if out.len() + c.len_utf8() > max_len {
            break;
        }
        if c == ' ' || (!c.is_control() && !c.is_whitespace()) || c == '\t' {
            out.push(if c == '\t' { ' ' } else { c });
        } else if c.is_whitespace() {
            out.push(' ');
        } else {
            out.push('?');
        }
    }
    out
}

/// A single parsed directive.
#[derive(Debug)]
pub struct ProfileOption {
    tokens: Vec<String>,
    /// Set when the body came from an inline block rather than line tokens.
    inline: bool,
    touched: AtomicBool,
}

impl ProfileOption {
    fn new(tokens: Vec<String>, inline: bool) -> Self {
        Self {
            tokens,
            inline,
            touched: AtomicBool::new(false),
        }
    }

    /// Directive name (first token).
    pub fn name(&self) -> &str {
        &self.tokens[0]
    }

    /// All tokens including the name.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Argument at `index` (0 = first argument after the name).
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.tokens.get(index + 1).map(String::as_str)
    }

    /// Whether this option came from an inline block.
    pub fn is_inline(&self) -> bool {
        self.inline
    }

    /// Mark the option as consumed.
    pub fn touch(&self) {
        self.touched.store(true, Ordering::Relaxed);
    }

    /// Whether any lookup has consumed this option.
    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::Relaxed)
    }

    /// Canonical single-line rendering (inline options render as blocks).
    pub fn render(&self) -> String {
        if self.inline {
            let mut s = String::new();
            let _ = writeln!(s, "<{}>", self.tokens[0]);
            s.push_str(&self.tokens[1]);
            if !self.tokens[1].ends_with('\n') {
                s.push('\n');
            }
            let _ = write!(s, "</{}>", self.tokens[0]);
            s
        } else {
            self.tokens
                .iter()
                .map(|t| quote_token(t))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

impl Clone for ProfileOption {
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            inline: self.inline,
            touched: AtomicBool::new(self.is_touched()),
        }
    }
}

fn quote_token(t: &str) -> String {
    if t.is_empty() || t.chars().any(|c| c.is_whitespace() || c == '"') {
        let mut s = String::with_capacity(t.len() + 2);
        s.push('"');
        for c in t.chars() {
            if c == '"' || c == '\\' {
                s.push('\\');
            }
            s.push(c);
        }
        s.push('"');
        s
    } else {
        t.to_string()
    }
}

/// An ordered list of profile options.
#[derive(Debug, Default, Clone)]
pub struct OptionList {
    options: Vec<ProfileOption>,
}

impl OptionList {
    /// Parse profile text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_inline(text, &HashMap::new())
    }

    /// Parse profile text with external inline-content overrides, equivalent
    /// to `<name>...</name>` blocks supplied out of band.
    pub fn parse_with_inline(text: &str, inline: &HashMap<String, String>) -> Result<Self> {
        if text.len() > MAX_PROFILE_SIZE {
            return Err(Error::options(format!(
                "profile too large: {} bytes (max {})",
                text.len(),
                MAX_PROFILE_SIZE
            )));
        }

        let mut options = Vec::new();
        let mut lines = text.lines().enumerate();

        while let Some((lineno, raw)) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if raw.len() > MAX_LINE_LEN {
                return Err(Error::options(format!(
                    "line {} too long: {} bytes (max {})",
                    lineno + 1,
                    raw.len(),
                    MAX_LINE_LEN
                )));
            }

            // Inline block open tag: <name>
            if let Some(name) = inline_open_tag(line) {
                let close = format!("</{name}>");
                let mut body = String::new();
                let mut closed = false;
                for (_, body_line) in lines.by_ref() {
                    if body_line.trim() == close {
                        closed = true;
                        break;
                    }
                    body.push_str(body_line);
                    body.push('\n');
                    if body.len() > MAX_PROFILE_SIZE {
                        return Err(Error::options(format!(
                            "inline block <{name}> exceeds profile size limit"
                        )));
                    }
                }
                if !closed {
                    return Err(Error::options(format!(
                        "inline block <{name}> not terminated"
                    )));
                }
                options.push(ProfileOption::new(vec![name.to_string(), body], true));
                continue;
            }

            let tokens = tokenize(line)
                .map_err(|e| Error::options(format!("line {}: {}", lineno + 1, e)))?;
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() > MAX_OPTION_ARGS + 1 {
                return Err(Error::options(format!(
                    "line {}: too many arguments for '{}'",
                    lineno + 1,
                    utf8_printable(&tokens[0], 64)
                )));
            }
            options.push(ProfileOption::new(tokens, false));
        }

        // Apply external inline overrides, replacing any parsed counterpart.
        for (name, body) in inline {
            options.retain(|o| o.name() != name);
            options.push(ProfileOption::new(
                vec![name.clone(), body.clone()],
                true,
            ));
        }

        Ok(Self { options })
    }

    /// Parse a comma-separated pushed option string (the payload of a
    /// `PUSH_REPLY`), e.g. `route 10.0.0.0 255.0.0.0,ping 8,ping-restart 60`.
    pub fn parse_pushed(csv: &str) -> Result<Self> {
        let mut options = Vec::new();
        for piece in csv.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let tokens = tokenize(piece).map_err(Error::options)?;
            if !tokens.is_empty() {
                options.push(ProfileOption::new(tokens, false));
            }
        }
        Ok(Self { options })
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Iterate options in order.
    pub fn iter(&self) -> impl Iterator<Item = &ProfileOption> {
        self.options.iter()
    }

    /// Whether a directive exists. Marks it touched.
    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// First directive with the given name. Marks it touched.
    pub fn find(&self, name: &str) -> Option<&ProfileOption> {
        let opt = self.options.iter().find(|o| o.name() == name)?;
        opt.touch();
        Some(opt)
    }

    /// All directives with the given name, in order. Marks them touched.
    pub fn find_all(&self, name: &str) -> Vec<&ProfileOption> {
        let found: Vec<_> = self.options.iter().filter(|o| o.name() == name).collect();
        for o in &found {
            o.touch();
        }
        found
    }

    /// Require a directive with an argument count in `min_args..=max_args`.
    pub fn get(&self, name: &str, min_args: usize, max_args: usize) -> Result<&ProfileOption> {
        let opt = self
            .find(name)
            .ok_or_else(|| Error::options(format!("option '{name}' not found")))?;
        let args = opt.tokens.len() - 1;
        if args < min_args || args > max_args {
            return Err(Error::options(format!(
                "option '{name}' takes {min_args}..={max_args} arguments, got {args}"
            )));
        }
        Ok(opt)
    }

    /// Optional single argument, printable-filtered to `max_len` bytes.
    pub fn get_optional(&self, name: &str, arg_index: usize, max_len: usize) -> Option<String> {
        self.find(name)
            .and_then(|o| o.arg(arg_index))
            .map(|s| utf8_printable(s, max_len))
    }

    /// Concatenated bodies of every directive with the given name. Used for
    /// inline blobs split across multiple blocks.
    pub fn cat(&self, name: &str) -> String {
        let mut out = String::new();
        for o in self.find_all(name) {
            if let Some(body) = o.arg(0) {
                out.push_str(body);
                if !body.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Parse a numeric argument with clamping; returns `default` when the
    /// directive is absent.
    pub fn get_num<T>(&self, name: &str, arg_index: usize, default: T, min: T, max: T) -> Result<T>
    where
        T: std::str::FromStr + PartialOrd + Copy,
    {
        match self.find(name) {
            None => Ok(default),
            Some(opt) => {
                let raw = opt.arg(arg_index).ok_or_else(|| {
                    Error::options(format!("option '{name}' missing argument {arg_index}"))
                })?;
                let value: T = raw.parse().map_err(|_| {
                    Error::options(format!(
                        "option '{name}': bad number '{}'",
                        utf8_printable(raw, 32)
                    ))
                })?;
                Ok(clamp(value, min, max))
            }
        }
    }

    /// Untouched directives that are not on the known-safe ignore list.
    pub fn unused(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|o| !o.is_touched() && !AUDIT_IGNORE.contains(&o.name()))
            .map(|o| o.name().to_string())
            .collect()
    }

    /// Canonical rendering of the full list.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for o in &self.options {
            out.push_str(&o.render());
            out.push('\n');
        }
        out
    }
}

fn clamp<T: PartialOrd>(v: T, min: T, max: T) -> T {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

fn inline_open_tag(line: &str) -> Option<&str> {
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty()
        || inner.starts_with('/')
        || !inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    Some(inner)
}

fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars().peekable();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' if in_token => {
                tokens.push(std::mem::take(&mut cur));
                in_token = false;
            }
            ' ' | '\t' => {}
            '"' | '\'' => {
                let quote = c;
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\\') if quote == '"' => match chars.next() {
                            Some(esc) => cur.push(esc),
                            None => return Err("dangling escape in quoted string".into()),
                        },
                        Some(q) if q == quote => break,
                        Some(other) => cur.push(other),
                        None => return Err("unterminated quoted string".into()),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(esc) => {
                    in_token = true;
                    cur.push(esc);
                }
                None => return Err("dangling escape".into()),
            },
            _ => {
                in_token = true;
                cur.push(c);
            }
        }
    }
    if in_token {
        tokens.push(cur);
    }
    Ok(tokens)
}

/// A profile: the base option list plus a pushed overlay installed after the
/// server's push reply. Overlay directives win on lookup.
#[derive(Debug, Default)]
pub struct Profile {
    base: OptionList,
    pushed: Option<OptionList>,
}

impl Profile {
    /// Wrap a parsed option list.
    pub fn new(base: OptionList) -> Self {
        Self { base, pushed: None }
    }

    /// The base (static) options.
    pub fn base(&self) -> &OptionList {
        &self.base
    }

    /// The pushed overlay, if installed.
    pub fn pushed(&self) -> Option<&OptionList> {
        self.pushed.as_ref()
    }

    /// Install the pushed overlay.
    pub fn set_pushed(&mut self, pushed: OptionList) {
        self.pushed = Some(pushed);
    }

    /// Lookup preferring the pushed overlay.
    pub fn find(&self, name: &str) -> Option<&ProfileOption> {
        self.pushed
            .as_ref()
            .and_then(|p| p.find(name))
            .or_else(|| self.base.find(name))
    }

    /// Numeric lookup preferring the pushed overlay.
    pub fn get_num<T>(&self, name: &str, arg_index: usize, default: T, min: T, max: T) -> Result<T>
    where
        T: std::str::FromStr + PartialOrd + Copy,
    {
        if let Some(p) = &self.pushed {
            if p.exists(name) {
                return p.get_num(name, arg_index, default, min, max);
            }
        }
        self.base.get_num(name, arg_index, default, min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = "\
client
remote vpn.example.com 1194 udp
# a comment
; another comment
cipher AES-256-GCM
auth-user-pass
verb 3
";

    #[test]
    fn test_parse_basic() {
        let opts = OptionList::parse(BASIC).unwrap();
        assert_eq!(opts.len(), 5);
        assert!(opts.exists("client"));
        assert!(opts.exists("auth-user-pass"));
        assert!(!opts.exists("nonexistent"));
    }

    #[test]
    fn test_get_arity() {
        let opts = OptionList::parse(BASIC).unwrap();
        let remote = opts.get("remote", 1, 3).unwrap();
        assert_eq!(remote.arg(0), Some("vpn.example.com"));
        assert_eq!(remote.arg(1), Some("1194"));
        assert_eq!(remote.arg(2), Some("udp"));

        assert!(opts.get("remote", 4, 5).is_err());
    }

    #[test]
    fn test_quoting() {
        let opts = OptionList::parse("auth-token \"my secret token\"\n").unwrap();
        let opt = opts.get("auth-token", 1, 1).unwrap();
        assert_eq!(opt.arg(0), Some("my secret token"));

        let opts = OptionList::parse("x \"escaped \\\" quote\"\n").unwrap();
        assert_eq!(opts.find("x").unwrap().arg(0), Some("escaped \" quote"));
    }

    #[test]
    fn test_inline_block() {
        let text = "client\n<ca>\n-----BEGIN CERT-----\nabc\n-----END CERT-----\n</ca>\n";
        let opts = OptionList::parse(text).unwrap();
        let ca = opts.find("ca").unwrap();
        assert!(ca.is_inline());
        assert!(ca.arg(0).unwrap().contains("BEGIN CERT"));
    }

    #[test]
    fn test_unterminated_inline_block() {
        let text = "client\n<ca>\nstuff\n";
        assert!(OptionList::parse(text).is_err());
    }

    #[test]
    fn test_inline_override() {
        let mut inline = HashMap::new();
        inline.insert("ca".to_string(), "override pem".to_string());
        let opts = OptionList::parse_with_inline("client\n", &inline).unwrap();
        assert_eq!(opts.find("ca").unwrap().arg(0), Some("override pem"));
    }

    #[test]
    fn test_size_limits() {
        let big = "x".repeat(MAX_PROFILE_SIZE + 1);
        assert!(OptionList::parse(&big).is_err());

        let long_line = format!("opt {}\n", "a".repeat(MAX_LINE_LEN));
        assert!(OptionList::parse(&long_line).is_err());
    }

    #[test]
    fn test_touched_and_unused() {
        let opts = OptionList::parse(BASIC).unwrap();
        opts.exists("client");
        opts.exists("remote");
        opts.exists("auth-user-pass");

        let unused = opts.unused();
        // "verb" is on the ignore list; only "cipher" should remain.
        assert_eq!(unused, vec!["cipher".to_string()]);
    }

    #[test]
    fn test_get_num_clamping() {
        let opts = OptionList::parse("reneg-sec 999999\nping 2\n").unwrap();
        assert_eq!(opts.get_num("reneg-sec", 0, 3600u64, 60, 86400).unwrap(), 86400);
        assert_eq!(opts.get_num("ping", 0, 8u64, 1, 3600).unwrap(), 2);
        assert_eq!(opts.get_num("absent", 0, 42u64, 1, 100).unwrap(), 42);
        assert!(opts
            .get_num("ping", 1, 8u64, 1, 3600)
            .is_err());
    }

    #[test]
    fn test_parse_pushed() {
        let pushed =
            OptionList::parse_pushed("route 10.0.0.0 255.0.0.0,ping 8,ping-restart 60,ifconfig 10.8.0.2 255.255.255.0")
                .unwrap();
        assert_eq!(pushed.len(), 4);
        assert_eq!(pushed.get_num("ping", 0, 0u64, 0, 3600).unwrap(), 8);
    }

    #[test]
    fn test_render_round_trip() {
        let opts = OptionList::parse(BASIC).unwrap();
        let rendered = opts.render();
        let reparsed = OptionList::parse(&rendered).unwrap();
        assert_eq!(reparsed.len(), opts.len());
        for (a, b) in opts.iter().zip(reparsed.iter()) {
            assert_eq!(a.tokens(), b.tokens());
        }
    }

    #[test]
    fn test_render_round_trip_with_quotes_and_inline() {
        let text = "auth-token \"spaced value\"\n<ca>\npem body\n</ca>\n";
        let opts = OptionList::parse(text).unwrap();
        let reparsed = OptionList::parse(&opts.render()).unwrap();
        assert_eq!(reparsed.find("auth-token").unwrap().arg(0), Some("spaced value"));
        assert_eq!(reparsed.find("ca").unwrap().arg(0), Some("pem body\n"));
    }

    #[test]
    fn test_profile_pushed_overlay() {
        let base = OptionList::parse("ping 10\nreneg-sec 3600\n").unwrap();
        let mut profile = Profile::new(base);
        assert_eq!(profile.get_num("ping", 0, 0u64, 0, 3600).unwrap(), 10);

        profile.set_pushed(OptionList::parse_pushed("ping 8").unwrap());
        assert_eq!(profile.get_num("ping", 0, 0u64, 0, 3600).unwrap(), 8);
        // Absent from overlay falls back to base.
        assert_eq!(profile.get_num("reneg-sec", 0, 0u64, 0, 86400).unwrap(), 3600);
    }

    #[test]
    fn test_utf8_printable() {
        assert_eq!(utf8_printable("hello world", 64), "hello world");
        assert_eq!(utf8_printable("a\x07b\nc", 64), "a?b c");
        assert_eq!(utf8_printable("abcdef", 3), "abc");
    }
}
