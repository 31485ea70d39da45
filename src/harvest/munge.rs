//! Name and tag munging for the local catalog.
//!
//! The local catalog only accepts lowercase alphanumeric names (plus `-` and
//! `_`) in URLs. Norwegian letters are spelled out instead of dropped, so
//! that e.g. "kjøre" and "kjære" stay distinct.

use std::sync::OnceLock;

use regex::Regex;

const MAX_NAME_LENGTH: usize = 100;
const MAX_TAG_LENGTH: usize = 100;

fn replace_norwegian(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'æ' | 'Æ' => out.push_str("ae"),
            'ø' | 'Ø' => out.push_str("oe"),
            'å' | 'Å' => out.push_str("aa"),
            _ => out.push(c),
        }
    }
    out
}

static NAME_DISALLOWED: OnceLock<Option<Regex>> = OnceLock::new();
static TAG_DISALLOWED: OnceLock<Option<Regex>> = OnceLock::new();

fn name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'
}

fn tag_char(c: char) -> bool {
    name_char(c) || c == '.'
}

/// Removes every run matched by `pattern`. Falls back to keeping the
/// `allowed` characters if the pattern fails to compile.
fn strip(
    input: &str,
    cell: &OnceLock<Option<Regex>>,
    pattern: &str,
    allowed: fn(char) -> bool,
) -> String {
    match cell.get_or_init(|| Regex::new(pattern).ok()) {
        Some(re) => re.replace_all(input, "").into_owned(),
        None => input.chars().filter(|c| allowed(*c)).collect(),
    }
}

fn strip_name(input: &str) -> String {
    strip(input, &NAME_DISALLOWED, r"[^a-z0-9\-_]+", name_char)
}

fn strip_tag(input: &str) -> String {
    strip(input, &TAG_DISALLOWED, r"[^a-z0-9\-_.]+", tag_char)
}

/// Organization name derived from a remote organization title.
pub fn munge_org_name(title: &str) -> String {
    let replaced = replace_norwegian(title).replace(' ', "-").to_lowercase();
    strip_name(&replaced)
}

/// Package name derived from a remote identifier.
pub fn munge_name(input: &str) -> String {
    let lowered = replace_norwegian(input.trim()).to_lowercase().replace(' ', "-");
    let mut name = strip_name(&lowered);
    name.truncate(MAX_NAME_LENGTH);
    name
}

/// Tag cleaned for the local catalog; may come back empty.
pub fn munge_tag(tag: &str) -> String {
    let lowered = replace_norwegian(tag.trim()).to_lowercase().replace(' ', "-");
    let mut tag = strip_tag(&lowered);
    tag.truncate(MAX_TAG_LENGTH);
    if tag.len() == 1 {
        tag.push('_');
    }
    tag
}
