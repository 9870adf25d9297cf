//! Line-level mechanics: bracket sectioning, `Key = Value` parsing,
//! inline/standalone comment splitting (§4.5 rules 1-4).

use crate::error::{MeshError, Warning};

use super::{AttachedComment, RawInterface, RawPeer};
use crate::model::CommentPosition;

pub(super) struct Section {
    /// `None` for the preamble before the first `[...]` line.
    pub header: Option<String>,
    pub lines: Vec<Line>,
}

#[derive(Clone, Debug)]
pub(super) enum Line {
    Field { key: String, value: String, trailing_comment: Option<String> },
    Comment(String),
    Blank,
}

pub(super) fn comment_text(line: &Line) -> Option<String> {
    match line {
        Line::Comment(text) => Some(text.clone()),
        _ => None,
    }
}

fn classify(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    if trimmed.starts_with('#') {
        return Line::Comment(trimmed.trim_start_matches('#').trim().to_string());
    }
    if let Some(eq) = trimmed.find('=') {
        let key = trimmed[..eq].trim().to_string();
        let rest = trimmed[eq + 1..].trim();
        // Inline comment: `<value><whitespace>#<text>` (§6).
        if let Some(hash) = find_inline_comment(rest) {
            let value = rest[..hash].trim_end().to_string();
            let comment = rest[hash + 1..].trim().to_string();
            return Line::Field {
                key,
                value,
                trailing_comment: Some(comment),
            };
        }
        return Line::Field {
            key,
            value: rest.to_string(),
            trailing_comment: None,
        };
    }
    // A non-blank, non-comment, non-`key=value` line: treat as a comment
    // to avoid a hard parse failure; callers may still warn on it via the
    // unknown-field channel.
    Line::Comment(trimmed.to_string())
}

/// Finds a `#` that begins an inline comment, i.e. one preceded by
/// whitespace (so that base64 key material, which never contains `#`,
/// is unaffected either way).
fn find_inline_comment(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut prev_ws = true;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && prev_ws {
            return Some(i);
        }
        prev_ws = b.is_ascii_whitespace();
    }
    None
}

pub(super) fn split_sections(lines: &[&str]) -> Result<Vec<Section>, MeshError> {
    let mut sections = Vec::new();
    let mut current_header: Option<String> = None;
    let mut current_lines: Vec<Line> = Vec::new();

    for raw in lines {
        let trimmed = raw.trim();
        if trimmed.starts_with('[') {
            if !trimmed.ends_with(']') {
                return Err(MeshError::MalformedSection(format!("unterminated section header: {raw}")));
            }
            let header = trimmed[1..trimmed.len() - 1].trim().to_string();
            if header.is_empty() {
                return Err(MeshError::MalformedSection(format!("empty section header: {raw}")));
            }
            sections.push(Section {
                header: current_header.take(),
                lines: std::mem::take(&mut current_lines),
            });
            current_header = Some(header);
            continue;
        }
        current_lines.push(classify(raw));
    }
    sections.push(Section {
        header: current_header,
        lines: current_lines,
    });

    Ok(sections)
}

/// Walks a section's classified lines, attaching each comment to the
/// nearest field per §4.5 rule 4, and returns the list in file order.
fn attach_comments(lines: &[Line]) -> Vec<AttachedComment> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if let Line::Comment(text) = &lines[i] {
            // Look ahead past this run of comments for the next field.
            let mut j = i;
            while j < lines.len() && matches!(lines[j], Line::Comment(_)) {
                j += 1;
            }
            let next_field_key = lines.get(j).and_then(|l| match l {
                Line::Field { key, .. } => Some(key.clone()),
                _ => None,
            });
            let preceded_by_blank = i == 0 || matches!(lines[i - 1], Line::Blank);
            let position = if !preceded_by_blank {
                // Immediately after a field with no blank line: `after`.
                CommentPosition::After
            } else if next_field_key.is_some() {
                CommentPosition::Before
            } else {
                CommentPosition::Standalone
            };
            out.push(AttachedComment {
                text: text.clone(),
                position,
                field_key: next_field_key,
            });
        }
        i += 1;
    }
    out
}

/// Single-valued `[Interface]` keys: WireGuard accepts each at most once.
/// `Address`, `DNS`, `PostUp`, `PostDown` are deliberately absent — those
/// are the multi-valued/repeatable fields (§4.5 rule 3).
const INTERFACE_SINGLE_VALUED: &[&str] = &["PrivateKey", "ListenPort", "MTU", "Table", "FwMark"];

/// Single-valued `[Peer]` keys.
const PEER_SINGLE_VALUED: &[&str] = &["PublicKey", "PresharedKey", "Endpoint", "PersistentKeepalive"];

pub(super) fn parse_interface(lines: &[Line]) -> Result<(RawInterface, Vec<Warning>), MeshError> {
    let mut iface = RawInterface::default();
    let mut warnings = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    iface.comments = attach_comments(lines);

    for line in lines {
        if let Line::Field { key, value, trailing_comment } = line {
            if let Some(text) = trailing_comment {
                iface.comments.push(AttachedComment {
                    text: text.clone(),
                    position: CommentPosition::Inline,
                    field_key: Some(key.clone()),
                });
            }
            if let Some(&canonical) = INTERFACE_SINGLE_VALUED.iter().find(|k| **k == key.as_str()) {
                if seen.contains(&canonical) {
                    return Err(MeshError::DuplicateField {
                        section: "Interface".to_string(),
                        field: canonical.to_string(),
                    });
                }
                seen.push(canonical);
            }
            match key.as_str() {
                "PrivateKey" => iface.private_key = Some(value.clone()),
                "Address" => iface.address.extend(super::split_multivalue(value)),
                "ListenPort" => iface.listen_port = Some(value.clone()),
                "DNS" => iface.dns.extend(super::split_multivalue(value)),
                "MTU" => iface.mtu = Some(value.clone()),
                "Table" => iface.table = Some(value.clone()),
                "FwMark" => iface.fwmark = Some(value.clone()),
                "PostUp" => iface.post_up.push(value.clone()),
                "PostDown" => iface.post_down.push(value.clone()),
                other => {
                    iface.unknown_fields.push((other.to_string(), value.clone()));
                    warnings.push(Warning::UnknownField {
                        section: "Interface".to_string(),
                        key: other.to_string(),
                    });
                }
            }
        }
    }

    Ok((iface, warnings))
}

pub(super) fn parse_peer(lines: &[Line]) -> Result<(RawPeer, Vec<Warning>), MeshError> {
    let mut peer = RawPeer::default();
    let mut warnings = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    peer.comments = attach_comments(lines);

    for line in lines {
        if let Line::Field { key, value, trailing_comment } = line {
            if let Some(text) = trailing_comment {
                peer.comments.push(AttachedComment {
                    text: text.clone(),
                    position: CommentPosition::Inline,
                    field_key: Some(key.clone()),
                });
            }
            if let Some(&canonical) = PEER_SINGLE_VALUED.iter().find(|k| **k == key.as_str()) {
                if seen.contains(&canonical) {
                    return Err(MeshError::DuplicateField {
                        section: "Peer".to_string(),
                        field: canonical.to_string(),
                    });
                }
                seen.push(canonical);
            }
            match key.as_str() {
                "PublicKey" => peer.public_key = Some(value.clone()),
                "PresharedKey" => peer.preshared_key = Some(value.clone()),
                "AllowedIPs" => peer.allowed_ips.extend(super::split_multivalue(value)),
                "Endpoint" => peer.endpoint = Some(value.clone()),
                "PersistentKeepalive" => peer.persistent_keepalive = Some(value.clone()),
                other => {
                    peer.unknown_fields.push((other.to_string(), value.clone()));
                    warnings.push(Warning::UnknownField {
                        section: "Peer".to_string(),
                        key: other.to_string(),
                    });
                }
            }
        }
    }

    Ok((peer, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;

    #[test]
    fn empty_section_header_is_malformed() {
        let lines: Vec<&str> = "[]\nPrivateKey = x".lines().collect();
        let err = split_sections(&lines).unwrap_err();
        assert!(matches!(err, MeshError::MalformedSection(_)));
    }

    #[test]
    fn unterminated_section_header_is_malformed() {
        let lines: Vec<&str> = "[Interface\nPrivateKey = x".lines().collect();
        let err = split_sections(&lines).unwrap_err();
        assert!(matches!(err, MeshError::MalformedSection(_)));
    }

    #[test]
    fn duplicate_private_key_is_rejected() {
        let lines = vec![
            classify("PrivateKey = aGVsbG8="),
            classify("PrivateKey = d29ybGQ="),
        ];
        let err = parse_interface(&lines).unwrap_err();
        assert!(matches!(
            err,
            MeshError::DuplicateField { field, .. } if field == "PrivateKey"
        ));
    }

    #[test]
    fn repeated_address_is_not_a_duplicate_field() {
        let lines = vec![classify("Address = 10.0.0.1/32"), classify("Address = fd00::1/128")];
        let (iface, warnings) = parse_interface(&lines).unwrap();
        assert_eq!(iface.address, vec!["10.0.0.1/32", "fd00::1/128"]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn duplicate_public_key_in_peer_is_rejected() {
        let lines = vec![
            classify("PublicKey = aGVsbG8="),
            classify("PublicKey = d29ybGQ="),
        ];
        let err = parse_peer(&lines).unwrap_err();
        assert!(matches!(
            err,
            MeshError::DuplicateField { field, .. } if field == "PublicKey"
        ));
    }
}
