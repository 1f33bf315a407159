#![forbid(unsafe_code)]

//! Entity escaping for canonical output.
//!
//! Per the C14N spec:
//! - Text nodes: `&` → `&amp;`, `<` → `&lt;`, `>` → `&gt;`, `\r` → `&#xD;`
//! - Attribute values: additionally `"` → `&quot;`, `\t` → `&#x9;`, `\n` → `&#xA;`
//! - PI data: `\r` → `&#xD;`

use std::io::{self, Write};

/// Write text node content with C14N escaping.
pub fn write_text(out: &mut dyn Write, s: &str) -> io::Result<()> {
    for ch in s.chars() {
        match ch {
            '&' => out.write_all(b"&amp;")?,
            '<' => out.write_all(b"&lt;")?,
            '>' => out.write_all(b"&gt;")?,
            '\r' => out.write_all(b"&#xD;")?,
            _ => write_char(out, ch)?,
        }
    }
    Ok(())
}

/// Write an attribute value with C14N escaping.
pub fn write_attr_value(out: &mut dyn Write, s: &str) -> io::Result<()> {
    for ch in s.chars() {
        match ch {
            '&' => out.write_all(b"&amp;")?,
            '<' => out.write_all(b"&lt;")?,
            '"' => out.write_all(b"&quot;")?,
            '\t' => out.write_all(b"&#x9;")?,
            '\n' => out.write_all(b"&#xA;")?,
            '\r' => out.write_all(b"&#xD;")?,
            _ => write_char(out, ch)?,
        }
    }
    Ok(())
}

/// Write processing instruction data (`\r` is the only escape).
pub fn write_pi_data(out: &mut dyn Write, s: &str) -> io::Result<()> {
    for ch in s.chars() {
        match ch {
            '\r' => out.write_all(b"&#xD;")?,
            _ => write_char(out, ch)?,
        }
    }
    Ok(())
}

fn write_char(out: &mut dyn Write, ch: char) -> io::Result<()> {
    let mut buf = [0u8; 4];
    out.write_all(ch.encode_utf8(&mut buf).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> String {
        let mut out = Vec::new();
        write_text(&mut out, s).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn attr(s: &str) -> String {
        let mut out = Vec::new();
        write_attr_value(&mut out, s).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_text_escaping() {
        assert_eq!(text("hello"), "hello");
        assert_eq!(text("a&b<c>d"), "a&amp;b&lt;c&gt;d");
        assert_eq!(text("line\rend"), "line&#xD;end");
    }

    #[test]
    fn test_attr_escaping() {
        assert_eq!(attr("hello"), "hello");
        assert_eq!(attr("a&b\"c"), "a&amp;b&quot;c");
        assert_eq!(attr("a\tb\nc\rd"), "a&#x9;b&#xA;c&#xD;d");
    }
}
