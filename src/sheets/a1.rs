// A1 notation helpers. Columns are 1-based everywhere in this crate, the way
// the Sheets UI counts them.

use crate::error::StoreError;

/// 1 → "A", 26 → "Z", 27 → "AA".
pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push(b'A' + rem as u8);
        index = (index - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// "AA" → 27. `None` for anything that isn't all ASCII letters.
pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0usize, |acc, c| {
        c.is_ascii_alphabetic()
            .then(|| acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1))
    })
}

/// `'title'!` prefix; quotes are doubled inside the title.
pub fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

pub fn cell(title: &str, col: usize, row: usize) -> String {
    format!("{}!{}{}", quote_title(title), column_letter(col), row)
}

pub fn span(title: &str, start_col: usize, start_row: usize, end_col: usize, end_row: usize) -> String {
    format!(
        "{}!{}{}:{}{}",
        quote_title(title),
        column_letter(start_col),
        start_row,
        column_letter(end_col),
        end_row
    )
}

/// Whole columns from `start_row` down, e.g. `'목록'!F2:F`.
pub fn open_column(title: &str, start_col: usize, end_col: usize, start_row: usize) -> String {
    format!(
        "{}!{}{}:{}",
        quote_title(title),
        column_letter(start_col),
        start_row,
        column_letter(end_col)
    )
}

/// A parsed range. Row bounds are `None` for open ranges like `A2:F`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A1Range {
    pub title: String,
    pub start_col: usize,
    pub start_row: usize,
    pub end_col: usize,
    pub end_row: Option<usize>,
}

impl A1Range {
    pub fn parse(range: &str) -> Result<Self, StoreError> {
        let bad = || StoreError::Range(range.to_string());
        let (title, cells) = range.rsplit_once('!').ok_or_else(bad)?;
        let title = title
            .strip_prefix('\'')
            .and_then(|t| t.strip_suffix('\''))
            .map(|t| t.replace("''", "'"))
            .unwrap_or_else(|| title.to_string());

        let (start, end) = match cells.split_once(':') {
            Some((s, e)) => (s, Some(e)),
            None => (cells, None),
        };
        let (start_col, start_row) = split_cell(start).ok_or_else(bad)?;
        let start_row = start_row.unwrap_or(1);
        let (end_col, end_row) = match end {
            Some(e) => split_cell(e).ok_or_else(bad)?,
            None => (start_col, Some(start_row)),
        };

        Ok(A1Range {
            title,
            start_col,
            start_row,
            end_col,
            end_row,
        })
    }
}

fn split_cell(cell: &str) -> Option<(usize, Option<usize>)> {
    let digits_at = cell.find(|c: char| c.is_ascii_digit()).unwrap_or(cell.len());
    let (letters, digits) = cell.split_at(digits_at);
    let col = column_index(letters)?;
    let row = if digits.is_empty() {
        None
    } else {
        Some(digits.parse().ok()?)
    };
    Some((col, row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_letters_both_ways() {
        for (i, l) in [(1, "A"), (8, "H"), (16, "P"), (26, "Z"), (27, "AA"), (52, "AZ"), (703, "AAA")] {
            assert_eq!(column_letter(i), l);
            assert_eq!(column_index(l), Some(i));
        }
        assert_eq!(column_letter(0), "");
        assert_eq!(column_index("A1"), None);
    }

    #[test]
    fn test_range_builders_quote_titles() {
        assert_eq!(cell("밸류업공시목록", 11, 5), "'밸류업공시목록'!K5");
        assert_eq!(span("Summary", 1, 12, 8, 14), "'Summary'!A12:H14");
        assert_eq!(open_column("it's", 6, 6, 2), "'it''s'!F2:F");
    }

    #[test]
    fn test_parse_ranges() {
        let r = A1Range::parse("'it''s'!B3:D5").unwrap();
        assert_eq!(r, A1Range { title: "it's".into(), start_col: 2, start_row: 3, end_col: 4, end_row: Some(5) });

        let open = A1Range::parse("'목록'!F2:F").unwrap();
        assert_eq!((open.start_col, open.start_row, open.end_col, open.end_row), (6, 2, 6, None));

        let single = A1Range::parse("Summary!B7").unwrap();
        assert_eq!((single.start_col, single.start_row, single.end_col, single.end_row), (2, 7, 2, Some(7)));

        assert!(A1Range::parse("no-bang").is_err());
    }
}
