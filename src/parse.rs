//! Line-oriented manifest reader. Classifies each line, decodes vis-escaped
//! names, and wires up the directory tree as it goes. The original text of
//! every line is kept so an unmodified hierarchy writes back byte-identical.

use std::io::{BufRead, BufReader, Read};

use crate::entry::{bytes_to_os, Entry, EntryId, EntryType};
use crate::hierarchy::DirectoryHierarchy;
use crate::keywords::KeyVal;
use crate::{vis, Error, Result};

/// Parse a manifest from a byte stream.
///
/// Stops at the first syntax error; an over-popping `..` is
/// [`Error::UnbalancedHierarchy`]. Unknown keywords are accepted here and
/// only rejected at check time.
pub fn parse_spec<R: Read>(r: R) -> Result<DirectoryHierarchy> {
    let reader = BufReader::new(r);
    let mut dh = DirectoryHierarchy::new();
    let mut stack: Vec<EntryId> = Vec::new();
    let mut cur_set: Option<EntryId> = None;
    let mut seen_signature = false;

    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.map_err(|e| Error::Parse {
            line: lineno,
            offset: 0,
            msg: e.to_string(),
        })?;
        let trimmed = line.trim();

        // Blank separator.
        if trimmed.is_empty() {
            let mut e = Entry::new(EntryType::Blank);
            e.raw_line = Some(line);
            dh.push(e);
            continue;
        }

        // Comment, or the one signature line.
        if trimmed.starts_with('#') {
            let etype = if !seen_signature && trimmed.starts_with("#mtree") {
                seen_signature = true;
                EntryType::Signature
            } else {
                EntryType::Comment
            };
            let mut e = Entry::new(etype);
            e.raw_name = line.clone();
            e.raw_line = Some(line);
            dh.push(e);
            continue;
        }

        let tokens = tokenize(trimmed);
        let name_tok = tokens[0].as_str();

        // Step-out.
        if name_tok == ".." {
            // Anything after the `..` is ignored.
            if stack.pop().is_none() {
                return Err(Error::UnbalancedHierarchy);
            }
            let mut e = Entry::new(EntryType::DotDot);
            e.name = "..".into();
            e.raw_name = "..".to_string();
            e.raw_line = Some(line);
            dh.push(e);
            continue;
        }

        // Directives.
        if name_tok.starts_with('/') {
            if name_tok != "/set" && name_tok != "/unset" {
                return Err(Error::Parse {
                    line: lineno,
                    offset: 0,
                    msg: format!("unknown special command {name_tok:?}"),
                });
            }
            let mut e = Entry::new(EntryType::Special);
            e.name = name_tok.into();
            e.raw_name = name_tok.to_string();
            e.keywords = tokens[1..].iter().map(|t| KeyVal::from_token(t)).collect();
            e.raw_line = Some(line);
            e.set = cur_set;
            let id = dh.push(e);
            cur_set = if name_tok == "/set" { Some(id) } else { None };
            continue;
        }

        // A path entry: Full if the name has a `/` past position 0.
        let etype = if name_tok.chars().skip(1).any(|c| c == '/') {
            EntryType::Full
        } else {
            EntryType::Relative
        };

        let decoded = vis::unvis(name_tok)?;
        let mut e = Entry::new(etype);
        e.name = bytes_to_os(decoded);
        e.raw_name = name_tok.to_string();
        e.keywords = tokens[1..].iter().map(|t| KeyVal::from_token(t)).collect();
        e.raw_line = Some(line);
        e.set = cur_set;

        match etype {
            EntryType::Full => {
                dh.push(e);
            }
            _ => {
                e.parent = stack.last().copied();
                let step_in = e.is_dir();
                let id = dh.push(e);
                if let Some(&pid) = stack.last() {
                    dh.entries[pid].children.push(id);
                }
                if step_in {
                    stack.push(id);
                }
            }
        }
    }

    Ok(dh)
}

/// Split on whitespace, honoring backslash escapes inside tokens so a
/// `\040`- or `\ `-encoded name survives as one token.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if !cur.is_empty() {
                    tokens.push(std::mem::take(&mut cur));
                }
            }
            '\\' => {
                cur.push('\\');
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}
