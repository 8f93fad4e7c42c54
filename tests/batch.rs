use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;

use taxon_enricher::batch::{
    BatchOptions, ItemStatus, Pipeline, ProgressEvent, ProgressSink, ResolveMode, SilentProgress,
    TerminalPolicy, backfill_lines, parse_batch,
};
use taxon_enricher::checkpoint::Checkpoint;
use taxon_enricher::domain::{EnrichmentSource, Rank, TaxonId, TaxonRef};
use taxon_enricher::enrichers::{Enricher, EnrichmentOutcome};
use taxon_enricher::error::EnrichError;
use taxon_enricher::fetch::FetchError;
use taxon_enricher::notify::CacheInvalidator;
use taxon_enricher::store::{NewMedia, SharedStore, SqliteStore, TaxonQuery, TaxonStore};
use taxon_enricher::taxonomy::{NameMatch, Resolver, TaxonDetail, TaxonomyAuthority, VernacularName};

/// Accepts any name except the two sentinel genera and builds a minimal
/// kingdom > genus > species lineage for it.
#[derive(Default)]
struct MockAuthority {
    names: Mutex<Vec<String>>,
}

impl TaxonomyAuthority for MockAuthority {
    fn match_name(&self, name: &str) -> Result<NameMatch, EnrichError> {
        if name.starts_with("Nonexistus") {
            return Err(EnrichError::NoMatch(name.to_string()));
        }
        if name.starts_with("Flakus") {
            return Err(EnrichError::upstream(
                "GBIF",
                FetchError::Transient {
                    attempts: 3,
                    cause: "server returned status 503".to_string(),
                },
            ));
        }
        let mut names = self.names.lock().unwrap();
        let key = match names.iter().position(|known| known == name) {
            Some(index) => index,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        Ok(NameMatch {
            key: key as i64 + 1,
            rank: Some("species".to_string()),
            canonical_name: name.to_string(),
        })
    }

    fn detail(&self, key: i64) -> Result<TaxonDetail, EnrichError> {
        let name = self.names.lock().unwrap()[(key - 1) as usize].clone();
        let genus = name.split_whitespace().next().unwrap_or_default().to_string();
        Ok(TaxonDetail {
            key,
            rank: Some("species".to_string()),
            canonical_name: name,
            kingdom: Some("Animalia".to_string()),
            genus: Some(genus),
            ..TaxonDetail::default()
        })
    }

    fn vernacular_names(&self, _name: &str) -> Result<Vec<VernacularName>, EnrichError> {
        Ok(Vec::new())
    }
}

struct RecordingEnricher {
    source: EnrichmentSource,
    fail: bool,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Enricher for RecordingEnricher {
    fn source(&self) -> EnrichmentSource {
        self.source
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        self.seen.lock().unwrap().push(taxon.canonical_name.clone());
        if self.fail {
            return Err(EnrichError::upstream(
                "iNaturalist",
                FetchError::Rejected {
                    url: "https://api.inaturalist.org/v1/observations".to_string(),
                    status: 422,
                },
            ));
        }
        Ok(EnrichmentOutcome::Added)
    }
}

struct PanickingEnricher;

impl Enricher for PanickingEnricher {
    fn source(&self) -> EnrichmentSource {
        EnrichmentSource::Description
    }

    fn enrich(&self, taxon: &TaxonRef) -> Result<EnrichmentOutcome, EnrichError> {
        panic!("malformed page for {}", taxon.canonical_name);
    }
}

#[derive(Default)]
struct RecordingInvalidator {
    taxa: Arc<Mutex<Vec<TaxonId>>>,
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, taxon: TaxonId) {
        self.taxa.lock().unwrap().push(taxon);
    }
}

#[derive(Default)]
struct CountingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for CountingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn options(concurrency: usize, terminal_policy: TerminalPolicy) -> BatchOptions {
    BatchOptions {
        concurrency,
        terminal_policy,
        failure_delay: Duration::ZERO,
        resolve_mode: ResolveMode::Authority,
    }
}

fn pipeline(options: BatchOptions) -> (Pipeline<MockAuthority>, Arc<Mutex<Vec<String>>>) {
    let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
    let authority = MockAuthority::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(Resolver::new(authority, store), options).with_enricher(Box::new(
        RecordingEnricher {
            source: EnrichmentSource::Status,
            fail: false,
            seen: seen.clone(),
        },
    ));
    (pipeline, seen)
}

fn checkpoint_in(dir: &tempfile::TempDir) -> Checkpoint {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("checkpoint.json")).unwrap();
    Checkpoint::load(path).unwrap()
}

#[test]
fn resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    checkpoint.mark_done("Cus cus").unwrap();

    let entries = parse_batch("Aus aus\nBus bus\nCus cus\nDus dus\nEus eus\n");
    let (pipeline, seen) = pipeline(options(1, TerminalPolicy::MarkDone));
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Aus aus", "Bus bus", "Dus dus", "Eus eus"]
    );
    assert_eq!(report.total, 5);
    assert_eq!(report.ok, 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.item("Cus cus").unwrap().status, ItemStatus::Skipped);
    for key in ["Aus aus", "Bus bus", "Cus cus", "Dus dus", "Eus eus"] {
        assert!(checkpoint.is_done(key), "{key} should be done");
    }
}

#[test]
fn concurrent_workers_process_each_item_once() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let names = ["Aus aus", "Bus bus", "Cus cus", "Dus dus", "Eus eus", "Fus fus"];
    let entries = parse_batch(&names.join("\n"));

    let (pipeline, seen) = pipeline(options(3, TerminalPolicy::MarkDone));
    let sink = CountingSink::default();
    let report = pipeline.run(&entries, Some(&checkpoint), &sink);

    let seen = seen.lock().unwrap().iter().cloned().collect::<BTreeSet<_>>();
    assert_eq!(seen, names.iter().map(|n| n.to_string()).collect());
    assert_eq!(report.ok, 6);
    assert_eq!(sink.events.lock().unwrap().len(), 6);
    let keys = report.items.iter().map(|item| item.key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, names);

    let reloaded = Checkpoint::load(checkpoint.path().to_owned()).unwrap();
    assert_eq!(reloaded.len(), 6);
}

#[test]
fn failing_source_does_not_fail_the_item() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let invalidated = Arc::new(Mutex::new(Vec::new()));

    let (mut pipeline, _) = pipeline(options(1, TerminalPolicy::MarkDone));
    for (source, fail) in [
        (EnrichmentSource::Media, false),
        (EnrichmentSource::Description, false),
        (EnrichmentSource::Occurrence, true),
    ] {
        pipeline = pipeline.with_enricher(Box::new(RecordingEnricher {
            source,
            fail,
            seen: seen.clone(),
        }));
    }
    let pipeline = pipeline.with_invalidator(Box::new(RecordingInvalidator {
        taxa: invalidated.clone(),
    }));

    let entries = parse_batch("Panthera pardus");
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);
    let item = &report.items[0];

    assert_eq!(item.status, ItemStatus::Ok);
    assert_eq!(item.outcomes.len(), 4);
    let added = item
        .outcomes
        .iter()
        .filter(|entry| entry.outcome == EnrichmentOutcome::Added)
        .count();
    assert_eq!(added, 3);
    assert!(item.outcome(EnrichmentSource::Occurrence).unwrap().is_failed());
    assert!(item.checkpointed);
    assert!(checkpoint.is_done("Panthera pardus"));
    assert_eq!(*invalidated.lock().unwrap(), vec![item.taxon_id.unwrap()]);
}

#[test]
fn terminal_failures_are_marked_done_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let entries = parse_batch("Nonexistus fakeus\nFlakus networkus\nAus aus");

    let (pipeline, _) = pipeline(options(1, TerminalPolicy::MarkDone));
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);

    assert_eq!(report.failed, 2);
    assert_eq!(report.ok, 1);
    assert!(report.has_failures());
    assert!(checkpoint.is_done("Nonexistus fakeus"));
    assert!(!checkpoint.is_done("Flakus networkus"));
    assert!(checkpoint.is_done("Aus aus"));
    assert!(report.item("Nonexistus fakeus").unwrap().error.is_some());
}

#[test]
fn retry_policy_leaves_terminal_failures_unmarked() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let entries = parse_batch("Nonexistus fakeus");

    let (pipeline, _) = pipeline(options(1, TerminalPolicy::Retry));
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);

    assert_eq!(report.failed, 1);
    assert!(!report.items[0].checkpointed);
    assert!(!checkpoint.is_done("Nonexistus fakeus"));
}

#[test]
fn stored_only_mode_never_calls_the_authority() {
    let (pipeline, seen) = pipeline(BatchOptions {
        resolve_mode: ResolveMode::StoredOnly,
        ..options(1, TerminalPolicy::Retry)
    });
    let entries = parse_batch("Aus aus\nid:42");
    let report = pipeline.run(&entries, None, &SilentProgress);

    assert_eq!(report.failed, 2);
    assert!(seen.lock().unwrap().is_empty());
    assert!(
        report.items[1]
            .error
            .as_deref()
            .unwrap()
            .contains("id:42")
    );
}

#[test]
fn bad_line_fails_alone_and_the_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let entries = parse_batch("Panthera pardus\nid:abc\nLynx lynx\n");

    let (pipeline, seen) = pipeline(options(1, TerminalPolicy::MarkDone));
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);

    assert_eq!(report.total, 3);
    assert_eq!(report.ok, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(*seen.lock().unwrap(), vec!["Panthera pardus", "Lynx lynx"]);
    let bad = report.item("id:abc").unwrap();
    assert_eq!(bad.status, ItemStatus::Failed);
    assert!(bad.error.as_deref().unwrap().contains("invalid taxon id"));
    assert!(checkpoint.is_done("id:abc"));
}

#[test]
fn bad_line_stays_unmarked_under_retry() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let entries = parse_batch("id:abc\nAus aus");

    let (pipeline, _) = pipeline(options(1, TerminalPolicy::Retry));
    let report = pipeline.run(&entries, Some(&checkpoint), &SilentProgress);

    assert_eq!(report.failed, 1);
    assert_eq!(report.ok, 1);
    assert!(!checkpoint.is_done("id:abc"));
    assert!(checkpoint.is_done("Aus aus"));
}

#[test]
fn panicking_source_is_recorded_as_failed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (pipeline, _) = pipeline(options(1, TerminalPolicy::MarkDone));
    let pipeline = pipeline
        .with_enricher(Box::new(PanickingEnricher))
        .with_enricher(Box::new(RecordingEnricher {
            source: EnrichmentSource::Media,
            fail: false,
            seen: seen.clone(),
        }));

    let report = pipeline.run(&parse_batch("Panthera pardus"), None, &SilentProgress);
    let item = &report.items[0];

    assert_eq!(item.status, ItemStatus::Ok);
    match item.outcome(EnrichmentSource::Description).unwrap() {
        EnrichmentOutcome::Failed(message) => assert!(message.contains("panicked")),
        other => panic!("expected a failed outcome, got {other:?}"),
    }
    assert_eq!(*seen.lock().unwrap(), vec!["Panthera pardus"]);
}

#[test]
fn backfill_covers_stored_taxa_missing_a_source() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_in(&dir);
    let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());
    let genus = store.ensure_taxon("Panthera", Rank::Genus, None).unwrap();
    let leo = store.ensure_taxon("Panthera leo", Rank::Species, Some(genus)).unwrap();
    let onca = store.ensure_taxon("Panthera onca", Rank::Species, Some(genus)).unwrap();
    let pardus = store.ensure_taxon("Panthera pardus", Rank::Species, Some(genus)).unwrap();
    store
        .insert_media(
            onca,
            &NewMedia {
                url: "https://upload.wikimedia.org/jaguar.jpg".to_string(),
                thumb_url: None,
                title: "Jaguar".to_string(),
                author: "Unknown".to_string(),
                license: "CC BY-SA 4.0".to_string(),
                source: "commons".to_string(),
            },
        )
        .unwrap();

    let query = TaxonQuery {
        rank: Some(Rank::Species),
        missing: Some(EnrichmentSource::Media),
        ..TaxonQuery::default()
    };
    let lines = backfill_lines(store.as_ref(), &query).unwrap();
    let keys = lines.iter().map(|line| line.key()).collect::<Vec<_>>();
    assert_eq!(keys, vec![format!("id:{leo}"), format!("id:{pardus}")]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(
        Resolver::new(MockAuthority::default(), store.clone()),
        BatchOptions {
            resolve_mode: ResolveMode::StoredOnly,
            ..options(2, TerminalPolicy::Retry)
        },
    )
    .with_enricher(Box::new(RecordingEnricher {
        source: EnrichmentSource::Media,
        fail: false,
        seen: seen.clone(),
    }));
    let report = pipeline.run(&lines, Some(&checkpoint), &SilentProgress);

    assert_eq!(report.ok, 2);
    let seen = seen.lock().unwrap().iter().cloned().collect::<BTreeSet<_>>();
    assert_eq!(
        seen,
        BTreeSet::from(["Panthera leo".to_string(), "Panthera pardus".to_string()])
    );
    for key in &keys {
        assert!(checkpoint.is_done(key), "{key} should be done");
    }
    let rerun = pipeline.run(&lines, Some(&checkpoint), &SilentProgress);
    assert_eq!(rerun.skipped, 2);
}
