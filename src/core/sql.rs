//! Purpose: Split a simple SELECT statement into the parts a read request needs.
//! Exports: `Query`, `parse_sql`.
//! Role: Lets read requests carry `query` instead of table/columns/filter/group-by.
//! Invariants: Keywords are matched case-insensitively outside quotes and parentheses.
use super::error::{Error, ErrorKind};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: String,
    pub group_by: String,
    pub limit: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Limit,
}

pub fn parse_sql(sql: &str) -> Result<Query, Error> {
    let sql = sql.trim().trim_end_matches(';').trim();
    let words = top_level_words(sql)?;

    let mut marks: Vec<(Clause, usize, usize)> = Vec::new();
    let mut iter = words.iter().peekable();
    while let Some(&(start, end)) = iter.next() {
        let word = sql[start..end].to_ascii_lowercase();
        let clause = match word.as_str() {
            "select" => Clause::Select,
            "from" => Clause::From,
            "where" => Clause::Where,
            "limit" => Clause::Limit,
            "group" => match iter.peek() {
                Some(&&(by_start, by_end)) if sql[by_start..by_end].eq_ignore_ascii_case("by") => {
                    iter.next();
                    marks.push((Clause::GroupBy, start, by_end));
                    continue;
                }
                _ => continue,
            },
            "order" | "having" | "join" | "union" => {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message(format!("unsupported SQL clause '{}'", word.to_uppercase())));
            }
            _ => continue,
        };
        marks.push((clause, start, end));
    }

    if marks.first().map(|mark| mark.0) != Some(Clause::Select) || marks[0].1 != 0 {
        return Err(bad_sql("query must start with SELECT"));
    }
    for window in marks.windows(2) {
        if clause_rank(window[1].0) <= clause_rank(window[0].0) {
            return Err(bad_sql("clauses are out of order or repeated"));
        }
    }

    let mut query = Query::default();
    for (position, &(clause, _, keyword_end)) in marks.iter().enumerate() {
        let body_end = marks
            .get(position + 1)
            .map(|next| next.1)
            .unwrap_or(sql.len());
        let body = sql[keyword_end..body_end].trim();
        match clause {
            Clause::Select => query.columns = split_columns(body)?,
            Clause::From => query.table = unquote(body).to_string(),
            Clause::Where => query.filter = body.to_string(),
            Clause::GroupBy => query.group_by = body.to_string(),
            Clause::Limit => {
                let limit = body
                    .parse::<u64>()
                    .map_err(|_| bad_sql(&format!("invalid LIMIT '{body}'")))?;
                query.limit = Some(limit);
            }
        }
    }

    if query.table.is_empty() {
        return Err(bad_sql("missing table in FROM clause"));
    }
    Ok(query)
}

fn clause_rank(clause: Clause) -> u8 {
    match clause {
        Clause::Select => 0,
        Clause::From => 1,
        Clause::Where => 2,
        Clause::GroupBy => 3,
        Clause::Limit => 4,
    }
}

fn bad_sql(message: &str) -> Error {
    Error::new(ErrorKind::BadRequest).with_message(format!("bad SQL query: {message}"))
}

/// Byte ranges of bare words outside quotes and parentheses.
fn top_level_words(sql: &str) -> Result<Vec<(usize, usize)>, Error> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut word_start: Option<usize> = None;

    for (offset, ch) in sql.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        let is_word = ch.is_ascii_alphanumeric() || ch == '_';
        if is_word && depth == 0 {
            word_start.get_or_insert(offset);
            continue;
        }
        if let Some(start) = word_start.take() {
            words.push((start, offset));
        }
        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| bad_sql("unbalanced parentheses"))?;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(bad_sql("unterminated quote"));
    }
    if depth != 0 {
        return Err(bad_sql("unbalanced parentheses"));
    }
    if let Some(start) = word_start {
        words.push((start, sql.len()));
    }
    Ok(words)
}

fn split_columns(body: &str) -> Result<Vec<String>, Error> {
    if body.is_empty() {
        return Err(bad_sql("no columns selected"));
    }
    if body == "*" {
        return Ok(Vec::new());
    }
    let mut columns = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (offset, ch) in body.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                columns.push(unquote(body[start..offset].trim()).to_string());
                start = offset + 1;
            }
            _ => {}
        }
    }
    columns.push(unquote(body[start..].trim()).to_string());
    if columns.iter().any(String::is_empty) {
        return Err(bad_sql("empty column name"));
    }
    Ok(columns)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '`'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
