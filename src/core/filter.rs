//! Purpose: Check that a filter expression only touches indexed fields.
//! Exports: `check_filter`.
//! Role: Light lexical scan ahead of handing the expression to SQLite.
//! Invariants: Bare identifiers must be indexed fields, SQL keywords, or function names.
//! Invariants: Literals and comments are skipped; statement separators are refused.
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::TableSchema;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "null", "like", "glob", "regexp", "match", "between",
    "escape", "collate", "nocase", "rtrim", "binary", "case", "when", "then", "else", "end",
    "cast", "as", "true", "false", "exists", "distinct", "isnull", "notnull", "integer", "real",
    "text", "blob", "numeric", "current_date", "current_time", "current_timestamp",
];

pub fn check_filter(schema: &TableSchema, filter: &str) -> Result<(), Error> {
    let chars: Vec<char> = filter.chars().collect();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '\'' => pos = skip_quoted(&chars, pos, '\'', filter)?,
            '"' | '`' => {
                let end = skip_quoted(&chars, pos, c, filter)?;
                let name: String = chars[pos + 1..end - 1].iter().collect();
                check_field(schema, &name.replace(&format!("{c}{c}"), &c.to_string()))?;
                pos = end;
            }
            '[' => {
                let end = find(&chars, pos + 1, ']')
                    .ok_or_else(|| unterminated(filter))?;
                let name: String = chars[pos + 1..end].iter().collect();
                check_field(schema, &name)?;
                pos = end + 1;
            }
            '-' if chars.get(pos + 1) == Some(&'-') => {
                pos = find(&chars, pos, '\n').map_or(chars.len(), |end| end + 1);
            }
            '/' if chars.get(pos + 1) == Some(&'*') => {
                pos = skip_block_comment(&chars, pos).ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("unterminated comment in filter `{filter}`"))
                        .with_hint("Close it with `*/`.")
                })?;
            }
            ';' => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("filter must be a single expression")
                    .with_hint(format!("Remove ';' from `{filter}`.")));
            }
            c if c.is_ascii_digit() || (c == '.' && next_is_digit(&chars, pos)) => {
                pos = skip_number(&chars, pos);
            }
            c if c == '_' || c.is_alphabetic() => {
                let start = pos;
                while pos < chars.len() && (chars[pos] == '_' || chars[pos].is_alphanumeric()) {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                // x'0A' blob literal
                if word.eq_ignore_ascii_case("x") && chars.get(pos) == Some(&'\'') {
                    pos = skip_quoted(&chars, pos, '\'', filter)?;
                    continue;
                }
                if schema.index(&word).is_some() {
                    continue;
                }
                if KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw)) {
                    continue;
                }
                if next_non_space(&chars, pos) == Some('(') {
                    continue;
                }
                return Err(unindexed(schema, &word));
            }
            '?' | ':' | '@' | '$' => {
                // placeholders: ?, ?NNN, :name, @name, $name
                pos += 1;
                while pos < chars.len() && (chars[pos] == '_' || chars[pos].is_alphanumeric()) {
                    pos += 1;
                }
            }
            _ => pos += 1,
        }
    }
    Ok(())
}

fn check_field(schema: &TableSchema, name: &str) -> Result<(), Error> {
    if schema.index(name).is_some() {
        Ok(())
    } else {
        Err(unindexed(schema, name))
    }
}

fn unindexed(schema: &TableSchema, field: &str) -> Error {
    let indexed: Vec<&str> = schema.indices().iter().map(|spec| spec.field()).collect();
    Error::new(ErrorKind::UnindexedField)
        .with_message(format!("field '{field}' is not indexed"))
        .with_hint(if indexed.is_empty() {
            "This table has no indexed fields; add one with ensure_table().".to_string()
        } else {
            format!("Indexed fields: {}. Add more with ensure_table().", indexed.join(", "))
        })
        .with_table(schema.name())
}

fn unterminated(filter: &str) -> Error {
    Error::new(ErrorKind::Usage).with_message(format!("unterminated literal in filter `{filter}`"))
}

/// Returns the position just past the closing quote; doubled quotes are escapes.
fn skip_quoted(chars: &[char], start: usize, quote: char, filter: &str) -> Result<usize, Error> {
    let mut pos = start + 1;
    while pos < chars.len() {
        if chars[pos] == quote {
            if chars.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return Ok(pos + 1);
        }
        pos += 1;
    }
    Err(unterminated(filter))
}

fn skip_number(chars: &[char], mut pos: usize) -> usize {
    if chars[pos] == '0' && matches!(chars.get(pos + 1), Some('x' | 'X')) {
        pos += 2;
        while pos < chars.len() && chars[pos].is_ascii_hexdigit() {
            pos += 1;
        }
        return pos;
    }
    while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
        pos += 1;
    }
    if matches!(chars.get(pos), Some('e' | 'E')) {
        pos += 1;
        if matches!(chars.get(pos), Some('+' | '-')) {
            pos += 1;
        }
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    pos
}

/// Returns the position just past the `*/` closing a comment opened at `start`.
fn skip_block_comment(chars: &[char], start: usize) -> Option<usize> {
    let mut pos = start + 2;
    while pos + 1 < chars.len() {
        if chars[pos] == '*' && chars[pos + 1] == '/' {
            return Some(pos + 2);
        }
        pos += 1;
    }
    None
}

fn find(chars: &[char], from: usize, target: char) -> Option<usize> {
    chars[from..].iter().position(|c| *c == target).map(|idx| from + idx)
}

fn next_is_digit(chars: &[char], pos: usize) -> bool {
    chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit())
}

fn next_non_space(chars: &[char], pos: usize) -> Option<char> {
    chars[pos..].iter().copied().find(|c| !c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::check_filter;
    use crate::core::error::ErrorKind;
    use crate::core::schema::{IndexSpec, TableSchema};

    fn schema() -> TableSchema {
        TableSchema::new(
            "items",
            vec![IndexSpec::unique("id"), IndexSpec::optional("mt")],
        )
    }

    #[test]
    fn accepts_expressions_over_indexed_fields() {
        for filter in [
            "id == 3",
            "mt > ? AND mt < ?",
            "ID = 1 or MT is null",
            "id IN (1, 2, 3)",
            "lower(id) LIKE 'foo%'",
            "mt BETWEEN 1.5e3 AND .5",
            "\"mt\" = 0x1F",
            "id = 'value with mt_other inside'",
            "id = 'it''s'",
            "id = x'00ff'",
            "id = ?2 OR id = :name",
        ] {
            check_filter(&schema(), filter).unwrap_or_else(|err| panic!("{filter}: {err}"));
        }
    }

    #[test]
    fn rejects_unindexed_fields() {
        for filter in ["value == 42", "id = 1 AND value > ?", "[value] = 1", "`_ob` LIKE '%'", "_id = 1"] {
            let err = check_filter(&schema(), filter).expect_err(filter);
            assert_eq!(err.kind(), ErrorKind::UnindexedField, "{filter}");
        }
    }

    #[test]
    fn comments_are_not_identifiers() {
        for filter in [
            "id = 1 -- by value",
            "id = 1 -- note\n AND mt > 2",
            "id = /* the key */ 1",
            "mt > 1 /* upper */ AND mt < 9",
        ] {
            check_filter(&schema(), filter).unwrap_or_else(|err| panic!("{filter}: {err}"));
        }
        let err = check_filter(&schema(), "id = 1 -- note\n AND value > 2").expect_err("after comment");
        assert_eq!(err.kind(), ErrorKind::UnindexedField);
        let err = check_filter(&schema(), "id = 1 /* open").expect_err("unterminated");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn rejects_statement_separators_and_broken_literals() {
        let err = check_filter(&schema(), "id = 1; DROP TABLE items").expect_err("separator");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = check_filter(&schema(), "id = 'open").expect_err("unterminated");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
