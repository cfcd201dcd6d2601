//! `schema_migrations` seed block normalization
//!
//! Rails appends the applied migration versions to the dump as a single
//! `INSERT INTO "schema_migrations" (version) VALUES ...;` statement whose row
//! order depends on the database's physical row order. This pass rewrites the
//! block in a fixed order and with leading commas:
//!
//! ```text
//! INSERT INTO "schema_migrations" (version) VALUES
//!  ('20220202235304')
//! ,('20220221045523')
//! ;
//! ```
//!
//! so adding a migration changes exactly one line of the diff.

use std::ops::Range;
use std::sync::OnceLock;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use tracing::debug;

use crate::config::MigrationsOrder;
use crate::dump::{DumpBuffer, DumpError, SpanEdit};
use crate::pipeline::DumpPass;

/// Header line through the terminating `;`. The body is validated separately.
fn block_pattern() -> &'static Regex {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    BLOCK.get_or_init(|| {
        Regex::new(
            r#"(?m)^(?P<header>INSERT INTO (?:"?public"?\.)?"?schema_migrations"? \(version\) VALUES[ \t]*\r?\n)(?P<body>[^;]*);"#,
        )
        .expect("valid regex")
    })
}

/// One `('version')` tuple.
fn value_pattern() -> &'static Regex {
    static VALUE: OnceLock<Regex> = OnceLock::new();
    VALUE.get_or_init(|| Regex::new(r"\('([^'\n]*)'\)").expect("valid regex"))
}

/// A single applied migration version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationVersion {
    /// The literal between the quotes, e.g. `20220309184009`.
    pub literal: String,
    /// Position in the block as dumped, starting at 0.
    pub ordinal: usize,
}

/// A located `schema_migrations` INSERT statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationsBlock {
    /// From the start of `INSERT` through the terminating `;`.
    pub span: Range<usize>,
    /// The `INSERT INTO ... VALUES` line, newline included.
    pub header: String,
    pub versions: Vec<MigrationVersion>,
}

impl MigrationsBlock {
    /// Find the first well-formed block in the dump.
    ///
    /// Returns `None` when there is no block, when it holds no versions, or
    /// when its body contains anything besides `('...')` tuples, commas and
    /// whitespace. A trailing comma after the last tuple is accepted.
    pub fn find(dump: &DumpBuffer) -> Option<MigrationsBlock> {
        let caps = block_pattern().captures(dump.as_str())?;
        let whole = caps.get(0)?;
        let header = caps.name("header")?.as_str();
        let body = caps.name("body")?.as_str();

        let versions: Vec<MigrationVersion> = value_pattern()
            .captures_iter(body)
            .enumerate()
            .filter_map(|(ordinal, c)| {
                c.get(1).map(|m| MigrationVersion {
                    literal: m.as_str().to_string(),
                    ordinal,
                })
            })
            .collect();

        if versions.is_empty() {
            debug!("schema_migrations block has no versions, leaving it alone");
            return None;
        }

        let leftover = value_pattern().replace_all(body, "");
        if !leftover
            .chars()
            .all(|c| c == ',' || c.is_ascii_whitespace())
        {
            debug!("schema_migrations block has unexpected content, leaving it alone");
            return None;
        }

        Some(MigrationsBlock {
            span: whole.range(),
            header: header.to_string(),
            versions,
        })
    }

    /// Render the block with `versions` in the given order. Value lines use
    /// the header's line terminator.
    pub fn render(&self, versions: &[MigrationVersion]) -> String {
        let newline = if self.header.ends_with("\r\n") {
            "\r\n"
        } else {
            "\n"
        };
        let mut out = self.header.clone();
        for (i, version) in versions.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            out.push_str("('");
            out.push_str(&version.literal);
            out.push_str("')");
            out.push_str(newline);
        }
        out.push(';');
        out
    }
}

/// Return `versions` reordered according to `order`.
///
/// `Off` keeps the dumped order. `Ascending` is a stable sort on the literal.
/// `Jumbled` shuffles the ascending order with a generator seeded from the
/// versions themselves, so the result depends only on which versions are
/// present.
pub fn order_versions(
    versions: &[MigrationVersion],
    order: MigrationsOrder,
) -> Vec<MigrationVersion> {
    let mut ordered = versions.to_vec();
    match order {
        MigrationsOrder::Off => {}
        MigrationsOrder::Ascending => {
            ordered.sort_by(|a, b| a.literal.cmp(&b.literal));
        }
        MigrationsOrder::Jumbled => {
            ordered.sort_by(|a, b| a.literal.cmp(&b.literal));
            let mut rng = StdRng::seed_from_u64(jumble_seed(&ordered));
            ordered.shuffle(&mut rng);
        }
    }
    ordered
}

/// 64-bit FNV-1a over the sorted literals, mixed with their count.
fn jumble_seed(sorted: &[MigrationVersion]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for version in sorted {
        for byte in version.literal.bytes().chain(std::iter::once(0)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash ^ sorted.len() as u64
}

/// Pass that rewrites the `schema_migrations` block in a stable order.
#[derive(Debug, Clone, Copy)]
pub struct MigrationsNormalizer {
    order: MigrationsOrder,
}

impl MigrationsNormalizer {
    pub fn new(order: MigrationsOrder) -> Self {
        Self { order }
    }
}

impl DumpPass for MigrationsNormalizer {
    fn name(&self) -> &'static str {
        "order_schema_migrations_values"
    }

    fn description(&self) -> &'static str {
        "Reorder the schema_migrations seed block and use one version per line"
    }

    fn plan(&self, dump: &DumpBuffer) -> Result<Vec<SpanEdit>, DumpError> {
        if !self.order.is_enabled() {
            return Ok(vec![]);
        }
        let Some(block) = MigrationsBlock::find(dump) else {
            debug!("no schema_migrations block found");
            return Ok(vec![]);
        };

        let ordered = order_versions(&block.versions, self.order);
        let rendered = block.render(&ordered);
        debug!(
            versions = ordered.len(),
            order = %self.order,
            "rendered schema_migrations block"
        );

        if rendered == dump.as_str()[block.span.clone()] {
            return Ok(vec![]);
        }
        Ok(vec![SpanEdit::replace(block.span, rendered)])
    }
}

/// Normalize the `schema_migrations` block of `dump_text`.
///
/// Text without a recognizable block is returned unchanged.
pub fn normalize(dump_text: &str, order: MigrationsOrder) -> Result<String, DumpError> {
    let dump = DumpBuffer::new(dump_text);
    let edits = MigrationsNormalizer::new(order).plan(&dump)?;
    Ok(dump.apply(edits)?.into_string())
}
