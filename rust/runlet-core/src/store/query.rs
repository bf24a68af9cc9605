//! Query-string compiler.
//!
//! Translates Bleve-style query strings (`+key:"greet" tags:prod -code:debug`)
//! into a SQL filter and a relevance expression over the `procedures` table.

use rusqlite::types::Value as SqlValue;

use super::error::{StoreError, StoreResult};

/// Query used when the caller supplies an empty query string.
pub const MATCH_ALL: &str = "*";

/// Default sort order: best matches first.
pub const DEFAULT_SORT: &str = "-_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Key,
    Tags,
    Code,
    Any,
}

impl Field {
    fn parse(name: &str) -> StoreResult<Self> {
        match name {
            "key" | "_id" => Ok(Self::Key),
            "tags" | "tag" => Ok(Self::Tags),
            "code" => Ok(Self::Code),
            other => Err(StoreError::QuerySyntax(format!("unknown field '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Text {
    Term(String),
    Phrase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    occur: Occur,
    field: Field,
    text: Text,
}

/// A clause lowered to SQL: a boolean condition and a score contribution.
#[derive(Debug, Default)]
struct Lowered {
    condition: String,
    condition_params: Vec<SqlValue>,
    score: String,
    score_params: Vec<SqlValue>,
}

impl Lowered {
    fn match_all() -> Self {
        Self {
            condition: "1".into(),
            score: "1.0".into(),
            ..Self::default()
        }
    }

    fn exact(condition: String, param: String) -> Self {
        Self {
            score: format!("(CASE WHEN {condition} THEN 1.0 ELSE 0.0 END)"),
            score_params: vec![SqlValue::Text(param.clone())],
            condition,
            condition_params: vec![SqlValue::Text(param)],
        }
    }

    fn full_text(expression: String) -> Self {
        Self {
            condition: "p.rowid IN (SELECT rowid FROM procedures_fts WHERE procedures_fts MATCH ?)"
                .into(),
            condition_params: vec![SqlValue::Text(expression.clone())],
            score: "COALESCE((SELECT -bm25(procedures_fts) FROM procedures_fts \
                    WHERE procedures_fts MATCH ? AND procedures_fts.rowid = p.rowid), 0.0)"
                .into(),
            score_params: vec![SqlValue::Text(expression)],
        }
    }
}

/// SQL fragments for a compiled query.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub where_sql: String,
    pub where_params: Vec<SqlValue>,
    pub score_sql: String,
    pub score_params: Vec<SqlValue>,
}

/// Compile a query string into SQL fragments.
pub(crate) fn compile(query: &str) -> StoreResult<CompiledQuery> {
    let clauses = parse(query)?;

    let mut musts = Vec::new();
    let mut shoulds = Vec::new();
    let mut must_nots = Vec::new();
    for clause in &clauses {
        let lowered = lower(clause)?;
        match clause.occur {
            Occur::Must => musts.push(lowered),
            Occur::Should => shoulds.push(lowered),
            Occur::MustNot => must_nots.push(lowered),
        }
    }

    let mut conditions = Vec::new();
    let mut where_params = Vec::new();
    for lowered in &musts {
        conditions.push(lowered.condition.clone());
        where_params.extend(lowered.condition_params.iter().cloned());
    }
    if musts.is_empty() && !shoulds.is_empty() {
        let any = shoulds
            .iter()
            .map(|l| l.condition.as_str())
            .collect::<Vec<_>>()
            .join(" OR ");
        conditions.push(format!("({any})"));
        for lowered in &shoulds {
            where_params.extend(lowered.condition_params.iter().cloned());
        }
    }
    for lowered in &must_nots {
        conditions.push(format!("NOT ({})", lowered.condition));
        where_params.extend(lowered.condition_params.iter().cloned());
    }

    let mut scores = Vec::new();
    let mut score_params = Vec::new();
    for lowered in musts.iter().chain(&shoulds) {
        scores.push(lowered.score.clone());
        score_params.extend(lowered.score_params.iter().cloned());
    }

    Ok(CompiledQuery {
        where_sql: if conditions.is_empty() {
            "1".into()
        } else {
            conditions.join(" AND ")
        },
        where_params,
        score_sql: if scores.is_empty() {
            "1.0".into()
        } else {
            scores.join(" + ")
        },
        score_params,
    })
}

/// Build an `ORDER BY` list from Bleve-style sort fields.
pub(crate) fn order_by(sort: &[String]) -> StoreResult<String> {
    let default = [DEFAULT_SORT.to_string()];
    let sort = if sort.is_empty() { &default[..] } else { sort };

    let mut terms = Vec::with_capacity(sort.len() + 1);
    let mut by_key = false;
    for field in sort {
        let field = field.trim();
        let (descending, name) = match field.strip_prefix('-') {
            Some(name) => (true, name),
            None => (false, field.strip_prefix('+').unwrap_or(field)),
        };
        let column = match name {
            "_score" => "score",
            "_id" | "key" => {
                by_key = true;
                "p.key"
            }
            "code" => "p.code",
            other => {
                return Err(StoreError::QuerySyntax(format!(
                    "cannot sort by unknown field '{other}'"
                )));
            }
        };
        terms.push(format!("{column} {}", if descending { "DESC" } else { "ASC" }));
    }
    if !by_key {
        terms.push("p.key ASC".into());
    }
    Ok(terms.join(", "))
}

fn lower(clause: &Clause) -> StoreResult<Lowered> {
    match (clause.field, &clause.text) {
        (Field::Key | Field::Any, Text::Term(term)) if term == "*" => Ok(Lowered::match_all()),
        (Field::Key, Text::Term(term)) if has_wildcard(term) => {
            Ok(Lowered::exact("p.key GLOB ?".into(), glob_pattern(term)))
        }
        (Field::Key, Text::Term(value) | Text::Phrase(value)) => {
            Ok(Lowered::exact("p.key = ?".into(), value.clone()))
        }
        (Field::Tags, Text::Term(term)) if has_wildcard(term) => Ok(Lowered::exact(
            "EXISTS (SELECT 1 FROM json_each(p.tags) WHERE json_each.value GLOB ?)".into(),
            glob_pattern(term),
        )),
        (Field::Tags, Text::Term(value) | Text::Phrase(value)) => Ok(Lowered::exact(
            "EXISTS (SELECT 1 FROM json_each(p.tags) WHERE json_each.value = ?)".into(),
            value.clone(),
        )),
        (Field::Code | Field::Any, text) => {
            let column = if clause.field == Field::Code { "code : " } else { "" };
            match text {
                Text::Phrase(phrase) => Ok(Lowered::full_text(format!(
                    "{column}{}",
                    fts_quote(phrase)
                ))),
                Text::Term(term) => {
                    let (stem, prefix) = match term.strip_suffix('*') {
                        Some(stem) => (stem, true),
                        None => (term.as_str(), false),
                    };
                    if has_wildcard(stem) {
                        return Err(StoreError::QuerySyntax(format!(
                            "full-text terms only support a trailing '*': {term}"
                        )));
                    }
                    if stem.is_empty() {
                        return Ok(Lowered::match_all());
                    }
                    let suffix = if prefix { " *" } else { "" };
                    Ok(Lowered::full_text(format!(
                        "{column}{}{suffix}",
                        fts_quote(stem)
                    )))
                }
            }
        }
    }
}

fn has_wildcard(term: &str) -> bool {
    term.contains(['*', '?'])
}

/// Escape GLOB metacharacters other than `*` and `?`.
fn glob_pattern(term: &str) -> String {
    term.replace('[', "[[]")
}

fn fts_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn parse(query: &str) -> StoreResult<Vec<Clause>> {
    let chars: Vec<char> = query.chars().collect();
    let mut pos = 0;
    let mut clauses = Vec::new();

    loop {
        skip_whitespace(&chars, &mut pos);
        let Some(&c) = chars.get(pos) else {
            break;
        };

        let occur = match c {
            '+' => Occur::Must,
            '-' => Occur::MustNot,
            _ => Occur::Should,
        };
        if occur != Occur::Should {
            pos += 1;
            if chars.get(pos).is_none_or(|c| c.is_whitespace()) {
                return Err(StoreError::QuerySyntax(format!(
                    "operator '{c}' must be followed by a clause"
                )));
            }
        }

        let clause = if is_quote(chars[pos]) {
            Clause {
                occur,
                field: Field::Any,
                text: Text::Phrase(read_quoted(&chars, &mut pos)?),
            }
        } else {
            let word = read_bare(&chars, &mut pos, true)?;
            if chars.get(pos) == Some(&':') {
                pos += 1;
                let field = Field::parse(&word)?;
                skip_whitespace(&chars, &mut pos);
                let text = match chars.get(pos) {
                    None => {
                        return Err(StoreError::QuerySyntax(format!(
                            "missing value for field '{word}'"
                        )));
                    }
                    Some(&c) if is_quote(c) => Text::Phrase(read_quoted(&chars, &mut pos)?),
                    Some(_) => Text::Term(read_bare(&chars, &mut pos, false)?),
                };
                Clause { occur, field, text }
            } else {
                Clause {
                    occur,
                    field: Field::Any,
                    text: Text::Term(word),
                }
            }
        };

        if let Text::Term(term) = &clause.text {
            if term.starts_with(['>', '<', '=']) {
                return Err(StoreError::QuerySyntax(format!(
                    "range queries are not supported: {term}"
                )));
            }
        }
        clauses.push(clause);
    }

    Ok(clauses)
}

fn skip_whitespace(chars: &[char], pos: &mut usize) {
    while chars.get(*pos).is_some_and(|c| c.is_whitespace()) {
        *pos += 1;
    }
}

fn is_quote(c: char) -> bool {
    c == '"' || c == '\''
}

fn read_bare(chars: &[char], pos: &mut usize, stop_at_colon: bool) -> StoreResult<String> {
    let mut out = String::new();
    while let Some(&c) = chars.get(*pos) {
        if c.is_whitespace() || (stop_at_colon && c == ':') {
            break;
        }
        *pos += 1;
        if c == '\\' {
            match chars.get(*pos) {
                Some(&escaped) => {
                    out.push(escaped);
                    *pos += 1;
                }
                None => {
                    return Err(StoreError::QuerySyntax("dangling escape".into()));
                }
            }
        } else {
            out.push(c);
        }
    }
    if out.is_empty() {
        return Err(StoreError::QuerySyntax(format!("empty term at offset {pos}")));
    }
    Ok(out)
}

fn read_quoted(chars: &[char], pos: &mut usize) -> StoreResult<String> {
    let quote = chars[*pos];
    let start = *pos;
    *pos += 1;
    let mut out = String::new();
    loop {
        match chars.get(*pos) {
            None => {
                return Err(StoreError::QuerySyntax(format!(
                    "unterminated phrase starting at offset {start}"
                )));
            }
            Some(&'\\') => {
                let Some(&escaped) = chars.get(*pos + 1) else {
                    return Err(StoreError::QuerySyntax("dangling escape".into()));
                };
                out.push(escaped);
                *pos += 2;
            }
            Some(&c) if c == quote => {
                *pos += 1;
                break;
            }
            Some(&c) => {
                out.push(c);
                *pos += 1;
            }
        }
    }
    if out.is_empty() {
        return Err(StoreError::QuerySyntax(format!(
            "empty phrase at offset {start}"
        )));
    }
    Ok(out)
}

/// Quote a procedure key for use in a `key:` clause.
pub fn quote_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    out.push('"');
    for c in key.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(occur: Occur, field: Field, text: &str) -> Clause {
        Clause {
            occur,
            field,
            text: Text::Term(text.into()),
        }
    }

    #[test]
    fn parses_operators_fields_and_phrases() {
        let clauses = parse(r#"+key: 'greet' tags:prod -code:"debug mode" hello"#).unwrap();
        assert_eq!(
            clauses,
            vec![
                Clause {
                    occur: Occur::Must,
                    field: Field::Key,
                    text: Text::Phrase("greet".into()),
                },
                term(Occur::Should, Field::Tags, "prod"),
                Clause {
                    occur: Occur::MustNot,
                    field: Field::Code,
                    text: Text::Phrase("debug mode".into()),
                },
                term(Occur::Should, Field::Any, "hello"),
            ]
        );
    }

    #[test]
    fn escapes_inside_phrases_and_terms() {
        let clauses = parse(r#"key:"a\"b" key:c\ d"#).unwrap();
        assert_eq!(clauses[0].text, Text::Phrase("a\"b".into()));
        assert_eq!(clauses[1].text, Text::Term("c d".into()));
        let quoted = parse(&format!("key:{}", quote_key("x\"y"))).unwrap();
        assert_eq!(quoted[0].text, Text::Phrase("x\"y".into()));
    }

    #[test]
    fn rejects_malformed_queries() {
        for query in [
            "key:\"open",
            "colour:red",
            "+",
            "key:",
            "key:\"\"",
            "size:>5",
            "code:he*llo",
            "trailing\\",
        ] {
            let err = parse(query).and_then(|clauses| {
                clauses.iter().try_for_each(|c| lower(c).map(|_| ()))
            });
            assert!(
                matches!(err, Err(StoreError::QuerySyntax(_))),
                "expected syntax error for {query:?}"
            );
        }
    }

    #[test]
    fn should_clauses_only_filter_without_musts() {
        let compiled = compile("alpha beta").unwrap();
        assert!(compiled.where_sql.contains(" OR "));
        assert_eq!(compiled.where_params.len(), 2);

        let compiled = compile("+key:a beta").unwrap();
        assert_eq!(compiled.where_sql, "p.key = ?");
        assert_eq!(compiled.where_params.len(), 1);
        // The should clause still contributes to the score.
        assert_eq!(compiled.score_params.len(), 2);
    }

    #[test]
    fn match_all_and_negation() {
        let compiled = compile("*").unwrap();
        assert_eq!(compiled.where_sql, "1");

        let compiled = compile("-tags:draft").unwrap();
        assert!(compiled.where_sql.starts_with("NOT ("));
        assert_eq!(compiled.score_sql, "1.0");
    }

    #[test]
    fn wildcards_use_glob_on_exact_fields() {
        let compiled = compile("key:report-*").unwrap();
        assert_eq!(compiled.where_sql, "p.key GLOB ?");
        assert_eq!(compiled.where_params, vec![SqlValue::Text("report-*".into())]);

        let compiled = compile("code:fetc*").unwrap();
        assert_eq!(
            compiled.where_params,
            vec![SqlValue::Text("code : \"fetc\" *".into())]
        );
    }

    #[test]
    fn sort_fields() {
        assert_eq!(order_by(&[]).unwrap(), "score DESC, p.key ASC");
        assert_eq!(
            order_by(&["key".into(), "-_score".into()]).unwrap(),
            "p.key ASC, score DESC"
        );
        assert!(order_by(&["-size".into()]).is_err());
    }
}
