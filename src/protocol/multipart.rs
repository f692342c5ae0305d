//! MIME multipart response decoding.
//!
//! Replies from the events endpoint are either empty (204), one bare JSON
//! directive, or a `multipart/related` body mixing JSON directive parts with
//! binary audio parts. Audio parts are referenced from directive payloads by
//! `cid:` URL and are paired with their owning directive here, during
//! parsing; a directive never leaves this module with an unresolved
//! reference.
//!
//! The server occasionally drops the opening boundary line while still
//! closing the body properly. [`parse`] normalizes that shape before
//! splitting, so both forms decode identically.

use std::collections::HashMap;

use regex_lite::Regex;
use thiserror::Error;

use crate::protocol::directive::Directive;

/// Errors from multipart decoding.
///
/// A single bad JSON part is not an error: it is dropped with a logged
/// warning so one malformed directive cannot block the rest of the batch.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The multipart framing itself is broken: a part without a
    /// header/body separator, or a bare body that is not valid JSON.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// A directive references a `cid:` URL with no matching audio part.
    #[error("unresolved audio reference: {0}")]
    UnresolvedAudioReference(String),
}

impl From<ParseError> for crate::error::Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Malformed(_) => Self::invalid_argument(e),
            ParseError::UnresolvedAudioReference(_) => Self::data_loss(e),
        }
    }
}

/// Extracts the `boundary` parameter from a `Content-Type` response header.
#[must_use]
pub fn boundary_from_content_type(header: &str) -> Option<String> {
    let pattern = Regex::new(r"boundary=([^;]+)").ok()?;
    pattern
        .captures(header)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().trim_matches('"').to_owned())
}

/// Decodes a response body into directives, audio attached.
///
/// * Empty input yields an empty batch (a 204-style "no directives"
///   outcome).
/// * A body without the boundary delimiter is treated as one bare JSON
///   directive, the degenerate shape the synchronize-state call returns.
/// * Otherwise the body is split on the boundary; `application/json` parts
///   become directives, all other parts are audio keyed by their
///   `Content-ID`.
///
/// With `check_boundary` set, a body that ends with the boundary marker but
/// does not start with one gets a leading boundary line synthesized, a
/// known server quirk.
///
/// Directives are returned in arrival order, except that replace-all play
/// behavior hoists a directive to the front: the server contract is that it
/// subsumes everything else in the same response.
///
/// # Errors
///
/// Will return `Err` if the multipart framing is broken or a bare body is
/// not valid JSON. A directive whose audio reference cannot be resolved is
/// dropped with a logged error; it does not abort the remaining items.
pub fn parse(bytes: &[u8], boundary: &str, check_boundary: bool) -> Result<Vec<Directive>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let delimiter = format!("--{boundary}");
    let normalized;
    let mut body = bytes;

    if check_boundary {
        let trimmed = trim_ascii(bytes);
        if !trimmed.is_empty()
            && trimmed.ends_with(delimiter.as_bytes())
            && !trimmed.starts_with(delimiter.as_bytes())
        {
            debug!("synthesizing missing opening boundary");
            let mut patched = Vec::with_capacity(delimiter.len() + 2 + bytes.len());
            patched.extend_from_slice(delimiter.as_bytes());
            patched.extend_from_slice(b"\r\n");
            patched.extend_from_slice(bytes);
            normalized = patched;
            body = &normalized;
        }
    }

    if boundary.is_empty() || find(body, delimiter.as_bytes()).is_none() {
        // Degenerate single-JSON response shape.
        let text = String::from_utf8_lossy(body);
        let directive = Directive::from_json(text.trim())
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        return Ok(vec![directive]);
    }

    let mut directives = Vec::new();
    let mut audio: HashMap<String, Vec<u8>> = HashMap::new();

    for part in split_parts(body, delimiter.as_bytes()) {
        let (headers, data) = split_headers(part)?;

        if headers.to_ascii_lowercase().contains("application/json") {
            let text = String::from_utf8_lossy(data);
            match Directive::from_json(text.trim()) {
                Ok(directive) => directives.push(directive),
                // One bad directive must not block the rest of the batch.
                Err(e) => warn!("dropping undecodable directive part: {e}"),
            }
        } else if let Some(cid) = content_id(&headers) {
            audio.insert(cid, data.to_vec());
        } else {
            warn!("dropping non-JSON part without a Content-ID header");
        }
    }

    let mut resolved = Vec::with_capacity(directives.len());
    for mut directive in directives {
        if let Some(reference) = directive.audio_reference() {
            match audio.get(reference) {
                Some(bytes) => {
                    let bytes = bytes.clone();
                    directive.audio = Some(bytes);
                }
                None => {
                    error!(
                        "dropping {}:{}: {}",
                        directive.header.namespace,
                        directive.header.name,
                        ParseError::UnresolvedAudioReference(reference.to_owned())
                    );
                    continue;
                }
            }
        }
        resolved.push(directive);
    }

    // Replace-all subsumes the rest of the response, so it goes first
    // regardless of arrival order.
    resolved.sort_by_key(|directive| !directive.replaces_all());

    Ok(resolved)
}

/// Splits the body into content parts between boundary delimiters,
/// excluding the preamble and everything after the closing `--` marker.
fn split_parts<'a>(body: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = body;

    // Skip the preamble before the first delimiter.
    let Some(start) = find(rest, delimiter) else {
        return parts;
    };
    rest = &rest[start + delimiter.len()..];

    loop {
        // A delimiter immediately followed by `--` closes the stream.
        if rest.starts_with(b"--") {
            break;
        }

        match find(rest, delimiter) {
            Some(end) => {
                parts.push(strip_frame(&rest[..end]));
                rest = &rest[end + delimiter.len()..];
            }
            None => {
                // Unterminated final part. Keep it; the server sometimes
                // omits the closing marker along with the opening one.
                let part = strip_frame(rest);
                if !part.is_empty() {
                    parts.push(part);
                }
                break;
            }
        }
    }

    parts
}

/// Splits one part into its header block and body data.
fn split_headers(part: &[u8]) -> Result<(String, &[u8]), ParseError> {
    for separator in [b"\r\n\r\n".as_slice(), b"\n\n".as_slice()] {
        if let Some(at) = find(part, separator) {
            let headers = String::from_utf8_lossy(&part[..at]).into_owned();
            let data = &part[at + separator.len()..];
            return Ok((headers, data));
        }
    }

    Err(ParseError::Malformed(
        "part without header/body separator".to_owned(),
    ))
}

/// Extracts and normalizes the `Content-ID` header into `cid:<id>` form,
/// stripping the surrounding angle brackets.
fn content_id(headers: &str) -> Option<String> {
    let value = headers
        .lines()
        .find_map(|line| line.strip_prefix("Content-ID:"))?
        .trim();

    let pattern = Regex::new(r"<(.*?)>").ok()?;
    let inner = pattern
        .captures(value)
        .and_then(|captures| captures.get(1))
        .map_or(value, |m| m.as_str());

    Some(format!("cid:{inner}"))
}

/// Locates `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |at| at + 1);
    &bytes[start..end]
}

/// Strips the single CRLF frame around a part between boundary lines.
///
/// Exactly one line break on each side belongs to the boundary delimiter;
/// anything further is part content. Audio parts may legitimately end in
/// newline bytes.
fn strip_frame(mut part: &[u8]) -> &[u8] {
    if let Some(rest) = part.strip_prefix(b"\r\n") {
        part = rest;
    } else if let Some(rest) = part.strip_prefix(b"\n") {
        part = rest;
    }
    if let Some(rest) = part.strip_suffix(b"\r\n") {
        part = rest;
    } else if let Some(rest) = part.strip_suffix(b"\n") {
        part = rest;
    }
    part
}
