//! Bijective mangling of POSIX paths into names Dataverse accepts.
//!
//! Dataverse imposes strict limits on `directoryLabel` and `label` values:
//! directory names are reduced to a small ASCII subset, filenames reject a
//! handful of punctuation, and a leading `.`, `-` or space is silently
//! stripped server-side. Anything we cannot send verbatim is escaped as
//! `-<HEX>-` (the Unicode code point in hex), and components with a risky
//! leading character get a `_` prefix. `unmangle_path(mangle_path(p)) == p`
//! holds for every path made of valid Unicode scalars.

use crate::error::RemoteError;

/// Characters allowed verbatim in a directory component.
fn dirname_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ')
}

/// Characters allowed verbatim in a filename component: printable ASCII
/// minus the set Dataverse rejects in labels.
fn filename_safe(c: char) -> bool {
    matches!(c, ' '..='~') && !matches!(c, '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';' | '#')
}

/// Leading characters Dataverse strips from a name (plus `_`, which marks
/// our own prefix and must escape itself).
fn leading_needs_prefix(c: char) -> bool {
    matches!(c, '.' | '-' | ' ' | '_')
}

/// Quote one component against a safe set.
///
/// A component passes through untouched unless it contains an unsafe
/// character or a literal `-`. A literal `-` forces escape mode: otherwise
/// the decoder could not tell a literal `a-2D-b` from an escaped `a-b`.
fn quote(component: &str, safe: fn(char) -> bool) -> String {
    let needs_escape = component.chars().any(|c| !safe(c) || c == '-');
    let quoted = if needs_escape {
        let mut out = String::with_capacity(component.len());
        for c in component.chars() {
            if safe(c) && c != '-' {
                out.push(c);
            } else {
                out.push_str(&format!("-{:X}-", c as u32));
            }
        }
        out
    } else {
        component.to_string()
    };

    match quoted.chars().next() {
        Some(first) if leading_needs_prefix(first) => format!("_{quoted}"),
        _ => quoted,
    }
}

pub fn quote_dirname(component: &str) -> String {
    quote(component, dirname_safe)
}

pub fn quote_filename(component: &str) -> String {
    quote(component, filename_safe)
}

/// Reverse [`quote_dirname`]/[`quote_filename`].
///
/// Fails loudly on malformed escape pairs; a silent best-effort decode would
/// hand the host a path that never round-trips.
pub fn unquote(component: &str) -> Result<String, RemoteError> {
    let stripped = match component.strip_prefix('_') {
        Some(rest) if rest.chars().next().is_some_and(leading_needs_prefix) => rest,
        _ => component,
    };

    if !stripped.contains('-') {
        return Ok(stripped.to_string());
    }

    enum State {
        Plain,
        Hex(String),
    }

    let mut out = String::with_capacity(stripped.len());
    let mut state = State::Plain;
    for c in stripped.chars() {
        state = match state {
            State::Plain => {
                if c == '-' {
                    State::Hex(String::new())
                } else {
                    out.push(c);
                    State::Plain
                }
            }
            State::Hex(mut digits) => {
                if c == '-' {
                    let code = u32::from_str_radix(&digits, 16).map_err(|_| {
                        RemoteError::BadEncoding(format!(
                            "invalid hex escape '-{digits}-' in '{component}'"
                        ))
                    })?;
                    let decoded = char::from_u32(code).ok_or_else(|| {
                        RemoteError::BadEncoding(format!(
                            "escape '-{digits}-' in '{component}' is not a Unicode scalar"
                        ))
                    })?;
                    out.push(decoded);
                    State::Plain
                } else if c.is_ascii_hexdigit() {
                    digits.push(c);
                    State::Hex(digits)
                } else {
                    return Err(RemoteError::BadEncoding(format!(
                        "non-hex character '{c}' inside escape in '{component}'"
                    )));
                }
            }
        };
    }
    if matches!(state, State::Hex(_)) {
        return Err(RemoteError::BadEncoding(format!(
            "unterminated escape in '{component}'"
        )));
    }
    Ok(out)
}

/// Mangle a POSIX path: every parent component through the directory safe
/// set, the final component through the filename safe set.
pub fn mangle_path(path: &str) -> String {
    if path.is_empty() || path == "." {
        return path.to_string();
    }
    let components: Vec<&str> = path.split('/').collect();
    let last = components.len() - 1;
    components
        .iter()
        .enumerate()
        .map(|(i, comp)| {
            if i == last {
                quote_filename(comp)
            } else {
                quote_dirname(comp)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Reverse [`mangle_path`].
pub fn unmangle_path(path: &str) -> Result<String, RemoteError> {
    if path.is_empty() || path == "." {
        return Ok(path.to_string());
    }
    let mut parts = Vec::new();
    for comp in path.split('/') {
        parts.push(unquote(comp)?);
    }
    Ok(parts.join("/"))
}

/// Split a mangled path into Dataverse's `(directoryLabel, label)` pair.
/// A bare filename has no directory label.
pub fn split_label(mangled: &str) -> (Option<&str>, &str) {
    match mangled.rsplit_once('/') {
        Some((dir, name)) if !dir.is_empty() => (Some(dir), name),
        Some((_, name)) => (None, name),
        None => (None, mangled),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
