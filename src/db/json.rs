//! JSON escaping and row serialization for `QueryResult.data_json` — spec §4.3, §6.3.
//!
//! The original design threads `input`/`output`/`output_size` through a single
//! escape routine and signals failure with `-1`; here the same contract is
//! expressed against a `&mut [u8]` slice, returning `None` on the same
//! failure conditions (no room for the escaped text plus its terminator). A
//! null `input` pointer has no counterpart: `&str` can't be null, so that
//! half of the original null-safety invariant is enforced by the type system
//! instead of a runtime check.

/// Escapes `input` into `output` as JSON-safe bytes followed by a NUL
/// terminator. Returns the number of bytes written, excluding the
/// terminator, or `None` if `output` is empty or too small to hold the
/// escaped text plus terminator.
pub fn json_escape(input: &str, output: &mut [u8]) -> Option<usize> {
    if output.is_empty() {
        return None;
    }

    let mut escaped = Vec::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'"' => escaped.extend_from_slice(b"\\\""),
            b'\\' => escaped.extend_from_slice(b"\\\\"),
            b'\n' => escaped.extend_from_slice(b"\\n"),
            b'\r' => escaped.extend_from_slice(b"\\r"),
            b'\t' => escaped.extend_from_slice(b"\\t"),
            _ => escaped.push(b),
        }
    }

    if escaped.len() + 1 > output.len() {
        return None;
    }

    output[..escaped.len()].copy_from_slice(&escaped);
    output[escaped.len()] = 0;
    Some(escaped.len())
}

/// Escapes `input` into an owned `String`, sized generously so it never hits
/// the `None` case above. Used by the row serializer, which doesn't have a
/// caller-supplied buffer to respect.
fn escape_to_string(input: &str) -> String {
    let mut buf = vec![0u8; input.len() * 2 + 1];
    let n = json_escape(input, &mut buf).expect("buffer sized for worst-case escaping");
    String::from_utf8(buf[..n].to_vec()).expect("escaping only touches ASCII bytes, preserving UTF-8 validity")
}

/// One result-set cell as reported by a driver adapter: `Null` for a
/// driver-signalled NULL, `Numeric` for a driver-reported numeric type
/// (emitted unquoted, verbatim), `Text` for anything else (quoted, escaped).
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Numeric(String),
    Text(String),
}

fn cell_to_json(value: &CellValue, out: &mut String) {
    match value {
        CellValue::Null => out.push_str("null"),
        CellValue::Numeric(n) => out.push_str(n),
        CellValue::Text(t) => {
            out.push('"');
            out.push_str(&escape_to_string(t));
            out.push('"');
        }
    }
}

fn row_to_json_object(columns: &[String], values: &[CellValue], out: &mut String) {
    out.push('{');
    for (i, (name, value)) in columns.iter().zip(values.iter()).enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&escape_to_string(name));
        out.push_str("\":");
        cell_to_json(value, out);
    }
    out.push('}');
}

/// Serializes a result set into the `data_json` array described in spec
/// §6.3. Empty row sets produce the literal string `"[]"`.
pub fn rows_to_json_array(columns: &[String], rows: &[Vec<CellValue>]) -> String {
    if rows.is_empty() {
        return "[]".to_string();
    }

    let mut out = String::from("[");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        row_to_json_object(columns, row, &mut out);
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_special_characters_at_exact_fit() {
        let input = "Test\n\"Quote\"\t\\Slash";
        let mut buf = [0u8; 32];
        let n = json_escape(input, &mut buf).unwrap();
        assert_eq!(n, 24);
        assert_eq!(&buf[..n], br#"Test\n\"Quote\"\t\\Slash"#);
    }

    #[test]
    fn fails_when_buffer_has_no_room_for_terminator() {
        let mut buf = [0u8; 4];
        assert_eq!(json_escape("test", &mut buf), None);
    }

    #[test]
    fn fails_on_empty_output_buffer() {
        let mut buf: [u8; 0] = [];
        assert_eq!(json_escape("anything", &mut buf), None);
    }

    #[test]
    fn escape_round_trips_through_json_parsing() {
        let input = "hello \"world\"\n\t\\back\r\u{1F600}";
        let escaped = escape_to_string(input);
        let quoted = format!("\"{escaped}\"");
        let parsed: String = serde_json::from_str(&quoted).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn empty_result_set_is_literal_empty_array() {
        assert_eq!(rows_to_json_array(&["a".to_string()], &[]), "[]");
    }

    #[test]
    fn null_cell_becomes_json_null() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![vec![CellValue::Numeric("1".to_string()), CellValue::Null]];
        let json = rows_to_json_array(&columns, &rows);
        assert_eq!(json, r#"[{"id":1,"name":null}]"#);
    }

    #[test]
    fn two_rows_two_columns_with_mixed_cells() {
        let columns = vec!["id".to_string(), "label".to_string()];
        let rows = vec![
            vec![CellValue::Numeric("1".to_string()), CellValue::Text("a".to_string())],
            vec![CellValue::Numeric("2".to_string()), CellValue::Null],
        ];
        let json = rows_to_json_array(&columns, &rows);
        assert!(json.contains("null"));
        assert_eq!(json, r#"[{"id":1,"label":"a"},{"id":2,"label":null}]"#);
    }
}
