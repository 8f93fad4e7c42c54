//! Batch orchestration: resolve each entry, run every configured enricher
//! against it, notify downstream caches and record completion.
//!
//! Items are independent. A bounded pool of worker threads pulls entries
//! from a shared cursor; the only shared mutable state is the checkpoint
//! and the running tally.

use std::collections::HashSet;
use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::checkpoint::Checkpoint;
use crate::domain::{BatchEntry, EnrichmentSource, TaxonId, TaxonRef, collapse_whitespace};
use crate::enrichers::{Enricher, EnrichmentOutcome, run_enricher};
use crate::error::{EnrichError, ErrorClass};
use crate::notify::{CacheInvalidator, NoopInvalidator};
use crate::store::{TaxonQuery, TaxonStore};
use crate::taxonomy::{Resolver, TaxonomyAuthority};

pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_millis(800);

/// One unit of batch work. A line that cannot be parsed is still an item,
/// so it is reported and checkpointed like any other terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchLine {
    Entry(BatchEntry),
    Invalid { raw: String, reason: String },
}

impl BatchLine {
    pub fn key(&self) -> String {
        match self {
            BatchLine::Entry(entry) => entry.key(),
            BatchLine::Invalid { raw, .. } => raw.clone(),
        }
    }
}

impl From<BatchEntry> for BatchLine {
    fn from(entry: BatchEntry) -> Self {
        BatchLine::Entry(entry)
    }
}

/// Parses newline-delimited batch input. Blank lines and `#` comments are
/// ignored; repeated keys are kept once, in first-seen order.
pub fn parse_batch(content: &str) -> Vec<BatchLine> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parsed = match trimmed.parse::<BatchEntry>() {
            Ok(entry) => BatchLine::Entry(entry),
            Err(err) => {
                tracing::warn!(line = number + 1, raw = trimmed, error = %err, "invalid batch line");
                BatchLine::Invalid {
                    raw: collapse_whitespace(trimmed),
                    reason: err.to_string(),
                }
            }
        };
        if seen.insert(parsed.key()) {
            lines.push(parsed);
        }
    }
    lines
}

pub fn read_batch_file(path: &Utf8Path) -> Result<Vec<BatchLine>, EnrichError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| EnrichError::Filesystem(format!("read {path}: {err}")))?;
    Ok(parse_batch(&content))
}

/// Stored taxa selected by `query`, as `id:` items.
pub fn backfill_lines(
    store: &dyn TaxonStore,
    query: &TaxonQuery,
) -> Result<Vec<BatchLine>, EnrichError> {
    Ok(store
        .list_taxa(query)?
        .into_iter()
        .map(|id| BatchLine::Entry(BatchEntry::Id(id)))
        .collect())
}

/// What to do with an item whose failure will not go away on retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    #[default]
    MarkDone,
    Retry,
}

/// How entries become taxa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolveMode {
    /// Names go through the taxonomy authority; `id:` entries are looked up.
    #[default]
    Authority,
    /// Everything is looked up in the local store.
    StoredOnly,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub terminal_policy: TerminalPolicy,
    pub failure_delay: Duration,
    pub resolve_mode: ResolveMode,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            terminal_policy: TerminalPolicy::MarkDone,
            failure_delay: DEFAULT_FAILURE_DELAY,
            resolve_mode: ResolveMode::Authority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ok,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ok => "ok",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source: EnrichmentSource,
    #[serde(flatten)]
    pub outcome: EnrichmentOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub key: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxon_id: Option<TaxonId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<SourceOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checkpointed: bool,
}

impl ItemReport {
    fn skipped(key: String) -> Self {
        Self {
            key,
            status: ItemStatus::Skipped,
            taxon_id: None,
            outcomes: Vec::new(),
            error: None,
            checkpointed: true,
        }
    }

    pub fn outcome(&self, source: EnrichmentSource) -> Option<&EnrichmentOutcome> {
        self.outcomes
            .iter()
            .find(|entry| entry.source == source)
            .map(|entry| &entry.outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn item(&self, key: &str) -> Option<&ItemReport> {
        self.items.iter().find(|item| item.key == key)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub index: usize,
    pub total: usize,
    pub key: String,
    pub status: ItemStatus,
    pub elapsed: Duration,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
struct Tally {
    ok: usize,
    failed: usize,
    skipped: usize,
}

impl Tally {
    fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Ok => self.ok += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
        }
    }
}

pub struct Pipeline<A: TaxonomyAuthority> {
    resolver: Resolver<A>,
    enrichers: Vec<Box<dyn Enricher>>,
    invalidator: Box<dyn CacheInvalidator>,
    options: BatchOptions,
}

impl<A: TaxonomyAuthority> Pipeline<A> {
    pub fn new(resolver: Resolver<A>, options: BatchOptions) -> Self {
        Self {
            resolver,
            enrichers: Vec::new(),
            invalidator: Box::new(NoopInvalidator),
            options,
        }
    }

    pub fn with_enricher(mut self, enricher: Box<dyn Enricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn with_invalidator(mut self, invalidator: Box<dyn CacheInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    pub fn sources(&self) -> Vec<EnrichmentSource> {
        self.enrichers.iter().map(|enricher| enricher.source()).collect()
    }

    /// Processes every entry not already in the checkpoint. Never fails as a
    /// whole; per-item errors end up in the report.
    pub fn run(
        &self,
        lines: &[BatchLine],
        checkpoint: Option<&Checkpoint>,
        sink: &dyn ProgressSink,
    ) -> BatchReport {
        let total = lines.len();
        let workers = self.options.concurrency.clamp(1, total.max(1));
        let cursor = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(total));
        let tally = Mutex::new(Tally::default());

        tracing::info!(total, workers, sources = ?self.sources(), "batch started");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(line) = lines.get(index) else {
                            break;
                        };
                        let started = Instant::now();
                        let report = self.process(line, checkpoint);
                        let status = report.status;

                        if let Ok(mut tally) = tally.lock() {
                            tally.record(status);
                            tracing::info!(
                                key = %report.key,
                                status = status.as_str(),
                                ok = tally.ok,
                                failed = tally.failed,
                                skipped = tally.skipped,
                                "item finished"
                            );
                        }
                        sink.event(ProgressEvent {
                            index,
                            total,
                            key: report.key.clone(),
                            status,
                            elapsed: started.elapsed(),
                        });
                        if let Ok(mut results) = results.lock() {
                            results.push((index, report));
                        }

                        if status == ItemStatus::Failed && !self.options.failure_delay.is_zero() {
                            thread::sleep(self.options.failure_delay);
                        }
                    }
                });
            }
        });

        let mut indexed = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        indexed.sort_by_key(|(index, _)| *index);
        let items = indexed.into_iter().map(|(_, report)| report).collect::<Vec<_>>();

        let mut report = BatchReport {
            total,
            items,
            ..BatchReport::default()
        };
        for item in &report.items {
            match item.status {
                ItemStatus::Ok => report.ok += 1,
                ItemStatus::Failed => report.failed += 1,
                ItemStatus::Skipped => report.skipped += 1,
            }
        }
        tracing::info!(
            total = report.total,
            ok = report.ok,
            failed = report.failed,
            skipped = report.skipped,
            "batch finished"
        );
        report
    }

    fn resolve(&self, entry: &BatchEntry) -> Result<TaxonRef, EnrichError> {
        match (self.options.resolve_mode, entry) {
            (ResolveMode::Authority, BatchEntry::Name(name)) => {
                Ok(self.resolver.resolve(name)?.taxon)
            }
            _ => self.resolver.lookup(entry),
        }
    }

    /// Runs one item end to end.
    pub fn process(&self, line: &BatchLine, checkpoint: Option<&Checkpoint>) -> ItemReport {
        let key = line.key();
        if checkpoint.is_some_and(|cp| cp.is_done(&key)) {
            tracing::debug!(%key, "already done; skipping");
            return ItemReport::skipped(key);
        }

        let entry = match line {
            BatchLine::Entry(entry) => entry,
            BatchLine::Invalid { reason, .. } => {
                let err = EnrichError::InvalidBatchEntry(reason.clone());
                return self.resolution_failed(key, err, checkpoint);
            }
        };
        let taxon = match self.resolve(entry) {
            Ok(taxon) => taxon,
            Err(err) => return self.resolution_failed(key, err, checkpoint),
        };

        let outcomes = self
            .enrichers
            .iter()
            .map(|enricher| SourceOutcome {
                source: enricher.source(),
                outcome: run_enricher(enricher.as_ref(), &taxon),
            })
            .collect::<Vec<_>>();
        for entry in &outcomes {
            tracing::info!(
                taxon_id = %taxon.id,
                source = %entry.source,
                outcome = %entry.outcome,
                "source outcome"
            );
        }

        self.invalidator.invalidate(taxon.id);
        let checkpointed = mark(checkpoint, &key);

        ItemReport {
            key,
            status: ItemStatus::Ok,
            taxon_id: Some(taxon.id),
            outcomes,
            error: None,
            checkpointed,
        }
    }

    fn resolution_failed(
        &self,
        key: String,
        err: EnrichError,
        checkpoint: Option<&Checkpoint>,
    ) -> ItemReport {
        let class = err.class();
        tracing::error!(%key, error = %err, terminal = class == ErrorClass::Terminal, "item failed");

        let checkpointed = match (class, self.options.terminal_policy) {
            (ErrorClass::Terminal, TerminalPolicy::MarkDone) => mark(checkpoint, &key),
            _ => false,
        };
        ItemReport {
            key,
            status: ItemStatus::Failed,
            taxon_id: None,
            outcomes: Vec::new(),
            error: Some(err.to_string()),
            checkpointed,
        }
    }
}

fn mark(checkpoint: Option<&Checkpoint>, key: &str) -> bool {
    let Some(checkpoint) = checkpoint else {
        return false;
    };
    match checkpoint.mark_done(key) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(%key, error = %err, "failed to update checkpoint");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_skips_comments_and_duplicates() {
        let input = "# leopards\nPanthera  pardus\n\n  Panthera pardus \nid:7\nLynx lynx\n";
        let lines = parse_batch(input);
        assert_eq!(
            lines,
            vec![
                BatchEntry::Name("Panthera pardus".to_string()).into(),
                BatchEntry::Id(TaxonId::new(7)).into(),
                BatchEntry::Name("Lynx lynx".to_string()).into(),
            ]
        );
    }

    #[test]
    fn bad_id_line_becomes_an_invalid_item() {
        let lines = parse_batch("Panthera pardus\nid:abc\nLynx lynx\n");
        assert_eq!(lines.len(), 3);
        assert_matches_invalid(&lines[1], "id:abc");
        assert_eq!(lines[2].key(), "Lynx lynx");
    }

    fn assert_matches_invalid(line: &BatchLine, expected_raw: &str) {
        match line {
            BatchLine::Invalid { raw, reason } => {
                assert_eq!(raw, expected_raw);
                assert!(reason.contains("invalid taxon id"));
            }
            other => panic!("expected an invalid line, got {other:?}"),
        }
    }
}
