use thiserror::Error;

/// Ordered, case-insensitive multimap of RFC 5322 header fields.
///
/// Fields keep their original bytes, folding included, so a message that is
/// only routed (not modified) reaches the next hop byte-identical. Lookups
/// compare names ASCII-case-insensitively; insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    /// Complete field as it appears on the wire: name, colon, value with any
    /// folding, terminating CRLF.
    raw: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("header line {0} is not a field or a continuation")]
    MalformedLine(usize),
    #[error("header field name on line {0} is empty or not ASCII")]
    BadFieldName(usize),
}

fn raw_field(name: &str, value: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(name.len() + value.len() + 4);
    raw.extend_from_slice(name.as_bytes());
    raw.extend_from_slice(b": ");
    raw.extend_from_slice(value.as_bytes());
    raw.extend_from_slice(b"\r\n");
    raw
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Insert a field at the top of the header, where trace and
    /// check-generated fields go.
    pub fn prepend(&mut self, name: impl Into<String>, value: &str) {
        let name = name.into();
        let raw = raw_field(&name, value);
        self.fields.insert(0, Field { name, raw });
    }

    pub fn append(&mut self, name: impl Into<String>, value: &str) {
        let name = name.into();
        let raw = raw_field(&name, value);
        self.fields.push(Field { name, raw });
    }

    /// Insert all of `other`'s fields at the top, preserving their order.
    pub fn prepend_all(&mut self, other: &Header) {
        for field in other.fields.iter().rev() {
            self.fields.insert(0, field.clone());
        }
    }

    /// Add all of `other`'s fields at the bottom, preserving their order.
    pub fn append_all(&mut self, other: &Header) {
        self.fields.extend(other.fields.iter().cloned());
    }

    /// Replace every field named `name` with a single field, inserted where
    /// the first occurrence was (or appended if there was none).
    pub fn replace(&mut self, name: &str, value: &str) {
        let raw = raw_field(name, value);
        let field = Field {
            name: name.to_string(),
            raw,
        };
        match self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name)) {
            Some(at) => {
                self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
                self.fields.insert(at.min(self.fields.len()), field);
            }
            None => self.fields.push(field),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Unfolded values of every field named `name`, in order.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.unfolded_value())
            .collect()
    }

    pub fn first(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.unfolded_value())
    }

    /// (name, unfolded value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, String)> {
        self.fields
            .iter()
            .map(|f| (f.name.as_str(), f.unfolded_value()))
    }

    /// Canonical serialized form: every field's raw bytes followed by the
    /// empty line terminating the header block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fields.iter().map(|f| f.raw.len()).sum::<usize>() + 2);
        for field in &self.fields {
            out.extend_from_slice(&field.raw);
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a header block. Stops at the first empty line; bare-LF input is
    /// normalized to CRLF. Folded continuation lines attach to the preceding
    /// field.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderParseError> {
        let mut fields: Vec<Field> = Vec::new();

        for (lineno, line) in split_lines(data).enumerate() {
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // continuation of the previous field
                let Some(last) = fields.last_mut() else {
                    return Err(HeaderParseError::MalformedLine(lineno + 1));
                };
                last.raw.extend_from_slice(line);
                last.raw.extend_from_slice(b"\r\n");
                continue;
            }
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or(HeaderParseError::MalformedLine(lineno + 1))?;
            let name = std::str::from_utf8(&line[..colon])
                .map_err(|_| HeaderParseError::BadFieldName(lineno + 1))?
                .trim_end();
            if name.is_empty() || !name.is_ascii() {
                return Err(HeaderParseError::BadFieldName(lineno + 1));
            }
            let mut raw = line.to_vec();
            raw.extend_from_slice(b"\r\n");
            fields.push(Field {
                name: name.to_string(),
                raw,
            });
        }

        Ok(Self { fields })
    }
}

impl Field {
    /// Value with the leading whitespace trimmed and folding collapsed.
    fn unfolded_value(&self) -> String {
        let colon = self.raw.iter().position(|&b| b == b':').unwrap_or(0);
        let value = &self.raw[colon + 1..];
        let mut out = String::new();
        for line in split_lines(value) {
            let piece = String::from_utf8_lossy(line);
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(piece);
        }
        out
    }
}

/// Iterate lines without their CRLF/LF terminators.
fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n').map(|line| {
        if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &[u8] = b"From: alice@example.org\r\n\
        To: bob@example.com,\r\n\tcarol@example.com\r\n\
        Subject: Hello\r\n\
        \r\n\
        body text\r\n";

    #[test]
    fn parse_preserves_order_and_folding() {
        let header = Header::parse(SAMPLE).unwrap();
        assert_eq!(header.field_count(), 3);
        assert_eq!(
            header.iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>(),
            ["From", "To", "Subject"]
        );
        assert_eq!(
            header.first("to").unwrap(),
            "bob@example.com, carol@example.com"
        );
        // raw folding bytes survive re-serialization
        let out = header.to_bytes();
        assert!(out.windows(2).any(|w| w == b"\n\t"));
    }

    #[test]
    fn serialization_terminates_with_empty_line() {
        let header = Header::parse(SAMPLE).unwrap();
        assert!(header.to_bytes().ends_with(b"Subject: Hello\r\n\r\n"));
    }

    #[test]
    fn parse_tolerates_bare_lf() {
        let header = Header::parse(b"From: a@b\nSubject: x\n\n").unwrap();
        assert_eq!(header.first("subject").unwrap(), "x");
        assert!(header.to_bytes().starts_with(b"From: a@b\r\n"));
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let mut header = Header::new();
        header.append("X-Spam", "yes");
        header.append("x-spam", "maybe");
        assert_eq!(header.values("X-SPAM"), ["yes", "maybe"]);
        assert!(header.contains("x-Spam"));
    }

    #[test]
    fn prepend_all_keeps_relative_order() {
        let mut header = Header::new();
        header.append("Subject", "test");
        let mut added = Header::new();
        added.append("X-First", "1");
        added.append("X-Second", "2");
        header.prepend_all(&added);
        assert_eq!(
            header.iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>(),
            ["X-First", "X-Second", "Subject"]
        );
    }

    #[test]
    fn replace_collapses_duplicates_in_place() {
        let mut header = Header::new();
        header.append("Received", "hop1");
        header.append("X-Loop", "a");
        header.append("X-Loop", "b");
        header.replace("X-Loop", "c");
        assert_eq!(header.values("X-Loop"), ["c"]);
        assert_eq!(header.field_count(), 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Header::parse(b"no colon here\r\n\r\n").is_err());
        assert!(Header::parse(b"\tcontinuation without field\r\n").is_err());
    }
}
