//! Clean pipeline: runs the enabled passes over a dump.
//!
//! The [`CleanPipeline`] owns the list of passes selected by
//! [`CleanOptions`] and applies them in a fixed order: the
//! `schema_migrations` normalization first, then index relocation. Each pass
//! plans its edits against the output of the previous one, so offsets never
//! cross pass boundaries.

use tracing::debug;

use crate::config::CleanOptions;
use crate::dump::{DumpBuffer, DumpError, SpanEdit};
use crate::indexes::IndexRelocator;
use crate::migrations::MigrationsNormalizer;

/// One rewriting pass over the whole dump.
///
/// A pass only inspects the buffer and returns the edits it wants; the
/// pipeline applies them. Returning no edits means "nothing to do".
pub trait DumpPass {
    /// Name of the option that enables this pass.
    fn name(&self) -> &'static str;

    /// One-line summary for logs and `--list-passes`.
    fn description(&self) -> &'static str;

    /// Plan the edits for `dump`. Offsets refer to `dump` as given.
    fn plan(&self, dump: &DumpBuffer) -> Result<Vec<SpanEdit>, DumpError>;
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub pass: &'static str,
    pub edits: usize,
    /// Whether the text differs after the pass. A pass may plan edits that
    /// reproduce the same text (e.g. indexes already in place).
    pub changed: bool,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanOutcome {
    pub text: String,
    pub passes: Vec<PassReport>,
}

impl CleanOutcome {
    /// True if any pass changed the text.
    pub fn changed(&self) -> bool {
        self.passes.iter().any(|p| p.changed)
    }
}

/// The enabled passes, in execution order.
pub struct CleanPipeline {
    passes: Vec<Box<dyn DumpPass>>,
}

impl CleanPipeline {
    /// Build the pipeline for `options`.
    pub fn new(options: &CleanOptions) -> Self {
        let mut passes: Vec<Box<dyn DumpPass>> = Vec::new();
        if options.order_schema_migrations_values.is_enabled() {
            passes.push(Box::new(MigrationsNormalizer::new(
                options.order_schema_migrations_values,
            )));
        }
        if options.indexes_after_tables {
            passes.push(Box::new(IndexRelocator));
        }
        Self { passes }
    }

    /// Names of the passes that will run, in order.
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every enabled pass over `dump_text`.
    ///
    /// Any error aborts the whole run; no partially cleaned text is returned.
    pub fn run(&self, dump_text: &str) -> Result<CleanOutcome, DumpError> {
        let mut dump = DumpBuffer::new(dump_text);
        let mut reports = Vec::with_capacity(self.passes.len());

        for pass in &self.passes {
            let edits = pass.plan(&dump)?;
            let edit_count = edits.len();
            let next = dump.apply(edits)?;
            let changed = next != dump;
            debug!(pass = pass.name(), edits = edit_count, changed, "pass finished");

            reports.push(PassReport {
                pass: pass.name(),
                edits: edit_count,
                changed,
            });
            dump = next;
        }

        Ok(CleanOutcome {
            text: dump.into_string(),
            passes: reports,
        })
    }
}

/// Clean `dump_text` with `options` and return the rewritten text.
pub fn clean_dump(dump_text: &str, options: &CleanOptions) -> Result<String, DumpError> {
    CleanPipeline::new(options).run(dump_text).map(|o| o.text)
}

/// Every pass the tool knows about, enabled or not.
pub fn available_passes() -> Vec<Box<dyn DumpPass>> {
    vec![
        Box::new(MigrationsNormalizer::new(
            crate::config::MigrationsOrder::Ascending,
        )),
        Box::new(IndexRelocator),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationsOrder;

    const DUMP: &str = "CREATE TABLE public.a (
    id bigint
);

CREATE TABLE public.b (
    id bigint
);

CREATE INDEX idx_a ON public.a USING btree (id);

INSERT INTO \"schema_migrations\" (version) VALUES
('2'),
('1'),
;
";

    fn options(order: MigrationsOrder, indexes: bool) -> CleanOptions {
        CleanOptions {
            order_schema_migrations_values: order,
            indexes_after_tables: indexes,
        }
    }

    #[test]
    fn test_no_passes_enabled_returns_input() {
        let outcome = CleanPipeline::new(&CleanOptions::default()).run(DUMP).unwrap();
        assert_eq!(outcome.text, DUMP);
        assert!(outcome.passes.is_empty());
        assert!(!outcome.changed());
    }

    #[test]
    fn test_pass_order_is_fixed() {
        let pipeline = CleanPipeline::new(&options(MigrationsOrder::Jumbled, true));
        assert_eq!(
            pipeline.pass_names(),
            vec!["order_schema_migrations_values", "indexes_after_tables"]
        );
    }

    #[test]
    fn test_both_passes() {
        let outcome = CleanPipeline::new(&options(MigrationsOrder::Ascending, true))
            .run(DUMP)
            .unwrap();
        assert_eq!(
            outcome.text,
            "CREATE TABLE public.a (
    id bigint
);

CREATE INDEX idx_a ON public.a USING btree (id);

CREATE TABLE public.b (
    id bigint
);

INSERT INTO \"schema_migrations\" (version) VALUES
 ('1')
,('2')
;
"
        );
        assert!(outcome.passes.iter().all(|p| p.changed));
    }

    #[test]
    fn test_passes_do_not_interfere() {
        let migrations = options(MigrationsOrder::Ascending, false);
        let indexes = options(MigrationsOrder::Off, true);

        let migrations_only = clean_dump(DUMP, &migrations).unwrap();
        let indexes_only = clean_dump(DUMP, &indexes).unwrap();
        let both = clean_dump(DUMP, &options(MigrationsOrder::Ascending, true)).unwrap();

        assert_eq!(clean_dump(&indexes_only, &migrations).unwrap(), both);
        assert_eq!(clean_dump(&migrations_only, &indexes).unwrap(), both);
    }

    #[test]
    fn test_clean_output_reports_unchanged() {
        let opts = options(MigrationsOrder::Ascending, true);
        let once = clean_dump(DUMP, &opts).unwrap();
        let outcome = CleanPipeline::new(&opts).run(&once).unwrap();
        assert_eq!(outcome.text, once);
        assert!(!outcome.changed());
    }

    #[test]
    fn test_available_passes_cover_options() {
        let names: Vec<_> = available_passes().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["order_schema_migrations_values", "indexes_after_tables"]
        );
    }
}
