//! Index relocation
//!
//! `pg_dump` emits all `CREATE INDEX` statements in a block of their own,
//! far from the tables they belong to, and the order inside that block is
//! not stable across dumps. This pass moves every index statement whose
//! table is defined in the dump to directly after that table's
//! `CREATE TABLE ... );`, keeping the indexes' relative order:
//!
//! ```text
//! CREATE TABLE public.users (
//!     id bigint NOT NULL
//! );
//!
//! CREATE INDEX index_users_on_id ON public.users USING btree (id);
//! CREATE UNIQUE INDEX index_users_on_email ON public.users USING btree (email);
//!
//! CREATE TABLE public.accounts (
//! ```
//!
//! Indexes on tables the dump never creates stay where they are.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::dump::{DumpBuffer, DumpError, SpanEdit};
use crate::pipeline::DumpPass;

/// A plain or double-quoted identifier, optionally schema-qualified.
const QUALIFIED_NAME: &str =
    r#"(?:"[^"\n]+"|[A-Za-z_][\w$]*)(?:\.(?:"[^"\n]+"|[A-Za-z_][\w$]*))?"#;

fn create_table_pattern() -> &'static Regex {
    static CREATE_TABLE: OnceLock<Regex> = OnceLock::new();
    CREATE_TABLE.get_or_init(|| {
        Regex::new(&format!(
            r"(?m)^CREATE (?:(?:UNLOGGED|TEMP|TEMPORARY) )?TABLE (?:IF NOT EXISTS )?(?P<table>{QUALIFIED_NAME}) \("
        ))
        .expect("valid regex")
    })
}

/// The line closing a `CREATE TABLE` statement.
fn table_end_pattern() -> &'static Regex {
    static TABLE_END: OnceLock<Regex> = OnceLock::new();
    TABLE_END.get_or_init(|| Regex::new(r"(?m)\);[ \t]*\r?$").expect("valid regex"))
}

fn create_index_pattern() -> &'static Regex {
    static CREATE_INDEX: OnceLock<Regex> = OnceLock::new();
    CREATE_INDEX.get_or_init(|| {
        Regex::new(&format!(
            r#"(?m)^CREATE (?:UNIQUE )?INDEX (?:CONCURRENTLY )?(?:IF NOT EXISTS )?(?:(?:"[^"\n]+"|[A-Za-z_][\w$]*) )?ON (?:ONLY )?(?P<table>{QUALIFIED_NAME})[ \t]*(?:USING |\()[^\n]*;[ \t]*\r?$"#
        ))
        .expect("valid regex")
    })
}

/// Schema-qualified table name. `schema` is None for unqualified references.
///
/// Unquoted parts are folded to lower case and quotes are stripped, so
/// `"public"."users"`, `public.users` and `PUBLIC.users` share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Parse a name as written in SQL, e.g. `waysact."Call Events"`.
    pub fn parse(text: &str) -> Self {
        let (first, rest) = split_identifier(text);
        match rest.strip_prefix('.') {
            Some(rest) => {
                let (second, _) = split_identifier(rest);
                Self::qualified(first, second)
            }
            None => Self::unqualified(first),
        }
    }

    /// Key used to pair indexes with tables. Never the bare local name when a
    /// schema is present.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split one identifier off the front of `text`, returning it normalized
/// together with the unparsed remainder.
fn split_identifier(text: &str) -> (String, &str) {
    if let Some(quoted) = text.strip_prefix('"') {
        match quoted.find('"') {
            Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
            None => (quoted.to_string(), ""),
        }
    } else {
        let end = text.find('.').unwrap_or(text.len());
        (text[..end].to_ascii_lowercase(), &text[end..])
    }
}

/// A `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: TableName,
    /// From `CREATE` through the newline ending the `);` line.
    pub span: Range<usize>,
    /// Line terminator used by the `);` line, reused for inserted lines.
    pub newline: &'static str,
}

/// A single-line `CREATE [UNIQUE] INDEX ... ON table ...;` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatement {
    pub table: TableName,
    /// The statement text, without trailing whitespace or line terminator.
    pub statement: Range<usize>,
    /// Offset just past the newline ending the statement line.
    pub line_end: usize,
}

/// Find every `CREATE TABLE` in dump order.
///
/// A table whose closing `);` cannot be found is skipped.
pub fn find_tables(dump: &DumpBuffer) -> Vec<TableDefinition> {
    let text = dump.as_str();
    let mut tables: Vec<TableDefinition> = Vec::new();

    for caps in create_table_pattern().captures_iter(text) {
        let (Some(whole), Some(table)) = (caps.get(0), caps.name("table")) else {
            continue;
        };
        // Skip statements nested in a table we already consumed.
        if tables
            .last()
            .is_some_and(|t| whole.start() < t.span.end)
        {
            continue;
        }
        let Some(close) = table_end_pattern().find_at(text, whole.end()) else {
            debug!(table = table.as_str(), "CREATE TABLE without closing );");
            continue;
        };
        tables.push(TableDefinition {
            name: TableName::parse(table.as_str()),
            span: whole.start()..dump.line_end(close.start()),
            newline: dump.line_terminator(close.start()),
        });
    }

    tables
}

/// Whether `offset` falls inside one of `tables`, which must be in dump order.
fn inside_table(tables: &[TableDefinition], offset: usize) -> bool {
    let after = tables.partition_point(|t| t.span.start <= offset);
    after > 0 && tables[after - 1].span.contains(&offset)
}

/// Find every index statement outside a table definition, in dump order.
pub fn find_indexes(dump: &DumpBuffer, tables: &[TableDefinition]) -> Vec<IndexStatement> {
    let mut indexes = Vec::new();

    for caps in create_index_pattern().captures_iter(dump.as_str()) {
        let (Some(whole), Some(table)) = (caps.get(0), caps.name("table")) else {
            continue;
        };
        if inside_table(tables, whole.start()) {
            continue;
        }
        let statement_len = whole.as_str().trim_end().len();
        indexes.push(IndexStatement {
            table: TableName::parse(table.as_str()),
            statement: whole.start()..whole.start() + statement_len,
            line_end: dump.line_end(whole.start()),
        });
    }

    indexes
}

/// Deletion ranges for the indexes being moved, keyed by start offset.
///
/// Consecutive moved statements separated only by blank lines are removed as
/// one run. A run takes the blank lines above it; a run at the top of the
/// dump has none and takes the blank lines below it instead.
fn removals(dump: &DumpBuffer, moved: &[&IndexStatement]) -> HashMap<usize, usize> {
    let text = dump.as_str();
    let mut ranges = HashMap::new();
    let mut rest = moved;

    while let Some(first) = rest.first() {
        let mut last = 0;
        while last + 1 < rest.len()
            && text[rest[last].line_end..rest[last + 1].statement.start]
                .trim()
                .is_empty()
        {
            last += 1;
        }

        let start = dump.blank_lines_before(first.statement.start);
        let end = if start == 0 {
            dump.blank_lines_after(rest[last].line_end)
        } else {
            rest[last].line_end
        };
        ranges.insert(start, end);
        rest = &rest[last + 1..];
    }

    ranges
}

/// Pass that moves index statements next to their tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexRelocator;

impl DumpPass for IndexRelocator {
    fn name(&self) -> &'static str {
        "indexes_after_tables"
    }

    fn description(&self) -> &'static str {
        "Move CREATE INDEX statements directly after their CREATE TABLE"
    }

    fn plan(&self, dump: &DumpBuffer) -> Result<Vec<SpanEdit>, DumpError> {
        let tables = find_tables(dump);
        let indexes = find_indexes(dump, &tables);
        if indexes.is_empty() {
            return Ok(vec![]);
        }

        // First definition wins for a repeated key.
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (i, table) in tables.iter().enumerate() {
            by_key.entry(table.name.key()).or_insert(i);
        }

        let mut grouped: Vec<Vec<&IndexStatement>> = vec![Vec::new(); tables.len()];
        let mut moved = Vec::new();
        for index in &indexes {
            match by_key.get(&index.table.key()) {
                Some(&i) => {
                    grouped[i].push(index);
                    moved.push(index);
                }
                None => debug!(
                    table = %index.table,
                    "index target has no CREATE TABLE in this dump, leaving it in place"
                ),
            }
        }
        let removed = removals(dump, &moved);

        let text = dump.as_str();
        let mut edits = Vec::new();
        for (table, group) in tables.iter().zip(&grouped) {
            if group.is_empty() {
                continue;
            }

            let newline = table.newline;
            let mut block = String::new();
            if !text[..table.span.end].ends_with('\n') {
                block.push_str(newline);
            }
            block.push_str(newline);
            for index in group {
                block.push_str(&text[index.statement.clone()]);
                block.push_str(newline);
            }

            // The last index needs a blank line before whatever survives
            // after the table, unless one is already there.
            let mut next = table.span.end;
            while let Some(&end) = removed.get(&next) {
                next = end;
            }
            if next < text.len() && !dump.is_blank_line(next) {
                block.push_str(newline);
            }

            edits.push(SpanEdit::insert(table.span.end, block));
            debug!(table = %table.name, indexes = group.len(), "placed indexes after table");
        }
        edits.extend(
            removed
                .into_iter()
                .map(|(start, end)| SpanEdit::delete(start..end)),
        );

        Ok(edits)
    }
}

/// Move index statements in `dump_text` to follow their tables.
pub fn relocate(dump_text: &str) -> Result<String, DumpError> {
    let dump = DumpBuffer::new(dump_text);
    let edits = IndexRelocator.plan(&dump)?;
    Ok(dump.apply(edits)?.into_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERLEAVED: &str = "CREATE TABLE waysact.call_events (
    id BIGSERIAL
);

CREATE TABLE waysact.other (
    id BIGSERIAL
);

CREATE INDEX foo ON waysact.call_events (id);

CREATE INDEX \"bar\" ON waysact.call_events (id);
";

    const RELOCATED: &str = "CREATE TABLE waysact.call_events (
    id BIGSERIAL
);

CREATE INDEX foo ON waysact.call_events (id);
CREATE INDEX \"bar\" ON waysact.call_events (id);

CREATE TABLE waysact.other (
    id BIGSERIAL
);
";

    #[test]
    fn test_indexes_follow_their_table() {
        assert_eq!(relocate(INTERLEAVED).unwrap(), RELOCATED);
    }

    #[test]
    fn test_relocation_is_idempotent() {
        assert_eq!(relocate(RELOCATED).unwrap(), RELOCATED);
    }

    #[test]
    fn test_find_tables_spans() {
        let dump = DumpBuffer::new(INTERLEAVED);
        let tables = find_tables(&dump);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, TableName::qualified("waysact", "call_events"));
        assert_eq!(
            &INTERLEAVED[tables[0].span.clone()],
            "CREATE TABLE waysact.call_events (\n    id BIGSERIAL\n);\n"
        );
        assert_eq!(tables[1].name.key(), "waysact.other");
    }

    #[test]
    fn test_find_indexes_statement_and_line() {
        let dump = DumpBuffer::new(INTERLEAVED);
        let tables = find_tables(&dump);
        let indexes = find_indexes(&dump, &tables);
        assert_eq!(indexes.len(), 2);
        assert_eq!(
            &INTERLEAVED[indexes[1].statement.clone()],
            "CREATE INDEX \"bar\" ON waysact.call_events (id);"
        );
        assert_eq!(indexes[1].line_end, INTERLEAVED.len());
    }

    #[test]
    fn test_index_inside_table_is_ignored() {
        let dump = DumpBuffer::new(
            "CREATE TABLE public.a (\nCREATE INDEX x ON public.b (id);\n);\n\n\
             CREATE TABLE public.b (\n    id bigint\n);\n\n\
             CREATE INDEX y ON public.b (id);\n",
        );
        let tables = find_tables(&dump);
        let indexes = find_indexes(&dump, &tables);
        assert_eq!(indexes.len(), 1);
        assert!(dump.as_str()[indexes[0].statement.clone()].starts_with("CREATE INDEX y"));
    }

    #[test]
    fn test_same_local_name_in_different_schemas() {
        let dump = "CREATE TABLE a.items (
    id bigint
);

CREATE TABLE b.items (
    id bigint
);

CREATE INDEX idx_b ON b.items USING btree (id);

CREATE INDEX idx_a ON a.items USING btree (id);
";
        let expected = "CREATE TABLE a.items (
    id bigint
);

CREATE INDEX idx_a ON a.items USING btree (id);

CREATE TABLE b.items (
    id bigint
);

CREATE INDEX idx_b ON b.items USING btree (id);
";
        assert_eq!(relocate(dump).unwrap(), expected);
    }

    #[test]
    fn test_index_on_unknown_table_stays_in_place() {
        let dump = "CREATE TABLE public.users (
    id bigint
);

CREATE INDEX idx_orders ON public.orders USING btree (id);

CREATE INDEX idx_users ON public.users USING btree (id);
";
        let expected = "CREATE TABLE public.users (
    id bigint
);

CREATE INDEX idx_users ON public.users USING btree (id);

CREATE INDEX idx_orders ON public.orders USING btree (id);
";
        assert_eq!(relocate(dump).unwrap(), expected);
    }

    #[test]
    fn test_unique_and_only_indexes() {
        let dump = "CREATE TABLE public.events (
    id bigint,
    created_at timestamp
)
PARTITION BY RANGE (created_at);

CREATE TABLE public.users (
    email text
);

CREATE UNIQUE INDEX index_users_on_email ON public.users USING btree (email);

CREATE INDEX index_events_on_id ON ONLY public.events USING btree (id);
";
        let expected = "CREATE TABLE public.events (
    id bigint,
    created_at timestamp
)
PARTITION BY RANGE (created_at);

CREATE INDEX index_events_on_id ON ONLY public.events USING btree (id);

CREATE TABLE public.users (
    email text
);

CREATE UNIQUE INDEX index_users_on_email ON public.users USING btree (email);
";
        assert_eq!(relocate(dump).unwrap(), expected);
    }

    #[test]
    fn test_quoted_names_match_unquoted() {
        let dump = "CREATE TABLE \"public\".\"users\" (
    id bigint
);

CREATE TABLE public.accounts (
    id bigint
);

CREATE INDEX idx ON public.users (id);
";
        let expected = "CREATE TABLE \"public\".\"users\" (
    id bigint
);

CREATE INDEX idx ON public.users (id);

CREATE TABLE public.accounts (
    id bigint
);
";
        assert_eq!(relocate(dump).unwrap(), expected);
    }

    #[test]
    fn test_table_at_end_without_newline() {
        let dump = "CREATE INDEX idx ON public.t (id);\n\nCREATE TABLE public.t (\n    id bigint\n);";
        assert_eq!(
            relocate(dump).unwrap(),
            "CREATE TABLE public.t (\n    id bigint\n);\n\nCREATE INDEX idx ON public.t (id);\n"
        );
    }

    #[test]
    fn test_index_at_top_of_dump_leaves_no_leading_blank() {
        let dump = "CREATE INDEX i ON a.t (id);\n\nCREATE TABLE a.t (\n    id int\n);\n";
        let out = relocate(dump).unwrap();
        assert_eq!(
            out,
            "CREATE TABLE a.t (\n    id int\n);\n\nCREATE INDEX i ON a.t (id);\n"
        );
        assert_eq!(relocate(&out).unwrap(), out);
    }

    #[test]
    fn test_table_directly_followed_by_table() {
        let dump = "CREATE TABLE a.t (
    id int
);
CREATE TABLE a.u (
    id int
);

CREATE INDEX i ON a.t (id);
";
        let expected = "CREATE TABLE a.t (
    id int
);

CREATE INDEX i ON a.t (id);

CREATE TABLE a.u (
    id int
);
";
        let out = relocate(dump).unwrap();
        assert_eq!(out, expected);
        assert_eq!(relocate(&out).unwrap(), out);
    }

    #[test]
    fn test_index_directly_after_table_moves_with_separator() {
        let dump = "CREATE TABLE a.t (\n    id int\n);\nCREATE INDEX i ON a.t (id);\nSET x = 1;\n";
        assert_eq!(
            relocate(dump).unwrap(),
            "CREATE TABLE a.t (\n    id int\n);\n\nCREATE INDEX i ON a.t (id);\n\nSET x = 1;\n"
        );
    }

    #[test]
    fn test_crlf_dump_keeps_crlf() {
        let dump = "CREATE TABLE a.t (\r\n    id int\r\n);\r\n\r\n\
                    CREATE TABLE a.u (\r\n    id int\r\n);\r\n\r\n\
                    CREATE INDEX i ON a.t (id);\r\n";
        let expected = "CREATE TABLE a.t (\r\n    id int\r\n);\r\n\r\n\
                        CREATE INDEX i ON a.t (id);\r\n\r\n\
                        CREATE TABLE a.u (\r\n    id int\r\n);\r\n";
        let out = relocate(dump).unwrap();
        assert_eq!(out, expected);
        assert_eq!(relocate(&out).unwrap(), out);
    }

    #[test]
    fn test_extra_blank_lines_after_table_are_kept() {
        let dump = "CREATE TABLE a.t (\n    id int\n);\n\n\nSET x = 1;\n\nCREATE INDEX i ON a.t (id);\n";
        let expected = "CREATE TABLE a.t (\n    id int\n);\n\nCREATE INDEX i ON a.t (id);\n\n\nSET x = 1;\n";
        let out = relocate(dump).unwrap();
        assert_eq!(out, expected);
        assert_eq!(relocate(&out).unwrap(), out);
    }

    #[test]
    fn test_tables_without_indexes_untouched() {
        let dump = "CREATE TABLE public.a (\n    id bigint\n);\n\n\nCREATE VIEW public.v AS SELECT 1;\n";
        assert_eq!(relocate(dump).unwrap(), dump);
    }

    #[test]
    fn test_following_statement_keeps_separation() {
        let dump = "CREATE TABLE public.a (
    id bigint
);

CREATE VIEW public.v AS SELECT 1;

CREATE INDEX idx ON public.a (id);

ALTER TABLE ONLY public.a ADD CONSTRAINT a_pkey PRIMARY KEY (id);
";
        let expected = "CREATE TABLE public.a (
    id bigint
);

CREATE INDEX idx ON public.a (id);

CREATE VIEW public.v AS SELECT 1;

ALTER TABLE ONLY public.a ADD CONSTRAINT a_pkey PRIMARY KEY (id);
";
        assert_eq!(relocate(dump).unwrap(), expected);
    }

    #[test]
    fn test_table_name_parse() {
        assert_eq!(
            TableName::parse("waysact.call_events"),
            TableName::qualified("waysact", "call_events")
        );
        assert_eq!(
            TableName::parse("\"My Schema\".\"Odd.Name\""),
            TableName::qualified("My Schema", "Odd.Name")
        );
        assert_eq!(TableName::parse("Users"), TableName::unqualified("users"));
        assert_eq!(TableName::parse("a.b").key(), "a.b");
    }
}
