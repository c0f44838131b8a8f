use std::borrow::Cow;
use std::io::{self, Write};

/// CSV formatting options.
#[derive(Debug, Clone, Copy)]
pub struct CsvParams {
    pub delimiter: char,
    /// Separates the `key=value` pairs of the late tags column.
    pub late_delimiter: char,
}

impl Default for CsvParams {
    fn default() -> Self {
        Self {
            delimiter: ';',
            late_delimiter: ',',
        }
    }
}

impl CsvParams {
    /// Escape a string for CSV formatting.
    ///
    /// See <https://www.ietf.org/rfc/rfc4180.txt>.
    pub fn escape_string<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if s.contains([self.delimiter, '"', '\n', '\r']) {
            let escaped = s.replace('"', "\"\"");
            Cow::Owned(format!("\"{escaped}\""))
        } else {
            Cow::Borrowed(s)
        }
    }

    /// Escape a key or a value of the late tags column.
    pub fn escape_string_late<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if s.contains([self.late_delimiter, '=']) {
            let mut escaped = String::with_capacity(s.len() + 2);
            for c in s.chars() {
                if c == self.late_delimiter || c == '=' {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            Cow::Owned(escaped)
        } else {
            Cow::Borrowed(s)
        }
    }

    /// Writes one line, escaping every field.
    pub fn write_line<W: Write, S: AsRef<str>>(&self, out: &mut W, fields: impl IntoIterator<Item = S>) -> io::Result<()> {
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                write!(out, "{}", self.delimiter)?;
            }
            out.write_all(self.escape_string(field.as_ref()).as_bytes())?;
        }
        out.write_all(b"\n")
    }

    /// Splits a header line written by [`write_line`](Self::write_line), undoing the escaping.
    pub fn split_header(&self, line: &str) -> Vec<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut quoted = false;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '"' if quoted => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        quoted = false;
                    }
                }
                '"' if field.is_empty() => quoted = true,
                c if c == self.delimiter && !quoted => fields.push(std::mem::take(&mut field)),
                c => field.push(c),
            }
        }
        fields.push(field);
        fields
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::CsvParams;

    #[test]
    fn csv_escape() {
        let helper = CsvParams {
            delimiter: ',',
            late_delimiter: ':',
        };
        assert_eq!("abcdefg", helper.escape_string("abcdefg"));
        assert_eq!("\"abcd\"\"efg\"", helper.escape_string("abcd\"efg"));
        assert_eq!("\"abcd,efg\"", helper.escape_string("abcd,efg"));
        assert_eq!("abcd;efg", helper.escape_string("abcd;efg"));
        assert_eq!("\"two\nlines\"", helper.escape_string("two\nlines"));
        assert_eq!("", helper.escape_string(""));

        let helper = CsvParams::default();
        assert_eq!("\"abcd;efg\"", helper.escape_string("abcd;efg"));
        assert_eq!("abcd,efg", helper.escape_string("abcd,efg"));
    }

    #[test]
    fn late_escape() {
        let helper = CsvParams::default();
        assert_eq!("plain", helper.escape_string_late("plain"));
        assert_eq!("EPYC\\,AMD", helper.escape_string_late("EPYC,AMD"));
        assert_eq!(" \\= a \\= b ", helper.escape_string_late(" = a = b "));
    }

    #[test]
    fn lines() {
        let helper = CsvParams::default();
        let mut out = Vec::new();
        helper.write_line(&mut out, ["timestamp", "name", "value"]).unwrap();
        helper.write_line(&mut out, ["0", "petits;pois", ""]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "timestamp;name;value\n0;\"petits;pois\";\n");
        assert_eq!(
            helper.split_header("timestamp;name;value;host\n"),
            vec!["timestamp", "name", "value", "host"]
        );
    }

    #[test]
    fn quoted_header_fields() {
        let helper = CsvParams::default();
        let mut out = Vec::new();
        helper.write_line(&mut out, ["name", "rack;row", "say \"hi\"", ""]).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(line, "name;\"rack;row\";\"say \"\"hi\"\"\";\n");
        assert_eq!(helper.split_header(&line), vec!["name", "rack;row", "say \"hi\"", ""]);
    }
}
