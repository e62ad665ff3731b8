use chrono::NaiveDate;
use tracker_core::{
    parse_anchor_str, AggregateSource, CategoryPercentages, CategoryTotals, OwnershipMapping,
    PeriodKey, SourceError,
};
use tracker_rollup::{
    run_rollup, GraphAggregateSource, OwnershipSync, ResolutionError, RollupConfig, RollupError,
    RollupOrchestrator,
};
use tracker_storage::{GraphStore, NewOrganization, ReportStore, StorageError, SummaryStore};

fn anchor(raw: &str) -> NaiveDate {
    parse_anchor_str(raw).expect("valid anchor")
}

fn month(raw: &str) -> PeriodKey {
    raw.parse().expect("valid period")
}

fn month_periods(store: &GraphStore, domain_key: &str) -> Vec<PeriodKey> {
    store
        .known_periods(domain_key)
        .expect("known periods")
        .into_iter()
        .filter(PeriodKey::is_month)
        .collect()
}

fn busy() -> StorageError {
    StorageError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    ))
}

struct Fixture {
    graph: GraphStore,
    reports: ReportStore,
}

impl Fixture {
    fn new() -> Self {
        Self {
            graph: GraphStore::open_in_memory().expect("open graph"),
            reports: ReportStore::open_in_memory().expect("open reports"),
        }
    }

    fn domain(&self, name: &str) -> String {
        self.graph.upsert_domain(name).expect("domain")
    }

    fn counts(&self, domain: &str, period: &PeriodKey, totals: CategoryTotals) {
        self.reports
            .record(domain, period, &totals)
            .expect("record counts");
    }

    fn run(&self, raw_anchor: &str) -> tracker_rollup::RollupReport {
        run_rollup(
            &self.graph,
            &self.reports,
            anchor(raw_anchor),
            RollupConfig::default(),
        )
        .expect("run rollup")
    }
}

/// Fails every write that touches `domain_key`, optionally only for one period.
struct FlakyStore<'a> {
    inner: &'a GraphStore,
    domain_key: String,
    period: Option<PeriodKey>,
}

impl FlakyStore<'_> {
    fn trips(&self, domain_key: &str, period: &PeriodKey) -> bool {
        domain_key == self.domain_key && self.period.map_or(true, |target| target == *period)
    }
}

impl SummaryStore for FlakyStore<'_> {
    fn create_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        if self.trips(domain_key, period) {
            return Err(busy());
        }
        self.inner
            .create_snapshot(domain_key, period, totals, percentages)
    }

    fn upsert_current_period(
        &self,
        domain_key: &str,
        period: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        if self.trips(domain_key, period) {
            return Err(busy());
        }
        self.inner
            .upsert_current_period(domain_key, period, totals, percentages)
    }

    fn roll_window(
        &self,
        domain_key: &str,
        period_to_remove: &PeriodKey,
        period_to_add: &PeriodKey,
        totals: &CategoryTotals,
        percentages: &CategoryPercentages,
    ) -> Result<String, StorageError> {
        if self.trips(domain_key, period_to_add) {
            return Err(busy());
        }
        self.inner
            .roll_window(domain_key, period_to_remove, period_to_add, totals, percentages)
    }

    fn remove_edge_and_snapshot(
        &self,
        domain_key: &str,
        period: &PeriodKey,
    ) -> Result<bool, StorageError> {
        if self.trips(domain_key, period) {
            return Err(busy());
        }
        self.inner.remove_edge_and_snapshot(domain_key, period)
    }
}

/// Source whose edge read fails for one domain.
struct UnreadableEdges<'a> {
    inner: GraphAggregateSource<'a>,
    domain_key: String,
}

impl AggregateSource for UnreadableEdges<'_> {
    fn counts_for(&self, domain: &str, period: &PeriodKey) -> Result<CategoryTotals, SourceError> {
        self.inner.counts_for(domain, period)
    }

    fn known_periods(&self, domain_key: &str) -> Result<Vec<PeriodKey>, SourceError> {
        if domain_key == self.domain_key {
            return Err(SourceError::new("edge collection unavailable"));
        }
        self.inner.known_periods(domain_key)
    }
}

#[test]
fn scenario_a_first_run_initializes_thirteen_months_and_thirty_days() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.counts("a.gc.ca", &month("2020-06-01"), CategoryTotals::new(1, 2, 3, 4));

    let report = fx.run("2021-01-15");

    assert_eq!(report.initialized, 1);
    assert!(report.failures.is_empty());
    let months = month_periods(&fx.graph, &key);
    assert_eq!(months.len(), 13);
    assert_eq!(months[0], month("2020-01-01"));
    assert_eq!(months[12], month("2021-01-01"));
    assert!(fx
        .graph
        .known_periods(&key)
        .expect("periods")
        .contains(&PeriodKey::ThirtyDays));
    assert_eq!(fx.graph.summary_document_count().expect("docs"), 14);

    let june = fx
        .graph
        .summary_for(&key, &month("2020-06-01"))
        .expect("load")
        .expect("june present");
    assert_eq!(june.total_messages, 10);
    assert_eq!(june.category_percentages.pass_spf_only, 40.0);

    let empty = fx
        .graph
        .summary_for(&key, &month("2020-07-01"))
        .expect("load")
        .expect("july present");
    assert_eq!(empty.total_messages, 0);
    assert_eq!(empty.category_percentages, CategoryPercentages::default());
}

#[test]
fn scenario_b_same_month_refreshes_current_and_thirty_days_only() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.run("2021-01-15");

    fx.counts("a.gc.ca", &month("2021-01-01"), CategoryTotals::new(8, 2, 0, 0));
    fx.counts("a.gc.ca", &PeriodKey::ThirtyDays, CategoryTotals::new(5, 0, 0, 0));
    fx.counts("a.gc.ca", &month("2020-06-01"), CategoryTotals::new(99, 0, 0, 0));

    let report = fx.run("2021-01-20");

    assert_eq!(report.refreshed, 1);
    assert_eq!(fx.graph.summary_edge_count(&key).expect("edges"), 14);
    let current = fx
        .graph
        .summary_for(&key, &month("2021-01-01"))
        .expect("load")
        .expect("present");
    assert_eq!(current.category_percentages.pass, 80.0);
    let trailing = fx
        .graph
        .summary_for(&key, &PeriodKey::ThirtyDays)
        .expect("load")
        .expect("present");
    assert_eq!(trailing.total_messages, 5);
    let history = fx
        .graph
        .summary_for(&key, &month("2020-06-01"))
        .expect("load")
        .expect("present");
    assert_eq!(history.total_messages, 0, "history must not be recomputed");
}

#[test]
fn scenario_c_new_month_rolls_the_window() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.run("2021-01-15");
    fx.counts("a.gc.ca", &month("2021-02-01"), CategoryTotals::new(0, 4, 0, 0));

    let report = fx.run("2021-02-10");

    assert_eq!(report.rolled, 1);
    let months = month_periods(&fx.graph, &key);
    assert_eq!(months.len(), 13);
    assert!(!months.contains(&month("2020-01-01")));
    assert_eq!(months[0], month("2020-02-01"));
    assert_eq!(months[12], month("2021-02-01"));
    assert_eq!(fx.graph.summary_document_count().expect("docs"), 14);

    let added = fx
        .graph
        .summary_for(&key, &month("2021-02-01"))
        .expect("load")
        .expect("present");
    assert_eq!(added.category_percentages.fail, 100.0);

    // the next run in the same month is a plain refresh
    let report = fx.run("2021-02-28");
    assert_eq!(report.refreshed, 1);
    assert_eq!(month_periods(&fx.graph, &key).len(), 13);
}

#[test]
fn scenario_d_percentages_for_one_two_three_four() {
    let fx = Fixture::new();
    let key = fx.domain("d.gc.ca");
    fx.counts("d.gc.ca", &PeriodKey::ThirtyDays, CategoryTotals::new(1, 2, 3, 4));

    fx.run("2021-01-15");

    let summary = fx
        .graph
        .summary_for(&key, &PeriodKey::ThirtyDays)
        .expect("load")
        .expect("present");
    assert_eq!(summary.total_messages, 10);
    let pct = summary.category_percentages;
    assert_eq!(
        (pct.pass, pct.fail, pct.pass_dkim_only, pct.pass_spf_only),
        (10.0, 20.0, 30.0, 40.0)
    );
}

#[test]
fn scenario_e_unresolvable_domain_is_skipped_and_sync_continues() {
    let graph = GraphStore::open_in_memory().expect("open graph");
    let known = graph.upsert_domain("canada.ca").expect("domain");
    let cse = graph
        .upsert_organization(&NewOrganization {
            acronym_en: "CSE".to_string(),
            acronym_fr: "CST".to_string(),
            name_en: None,
            name_fr: None,
        })
        .expect("org");
    graph
        .upsert_organization(&NewOrganization {
            acronym_en: "CSE-CST".to_string(),
            acronym_fr: "CSE-CST".to_string(),
            name_en: None,
            name_fr: None,
        })
        .expect("org");

    let mapping = OwnershipMapping::parse_json(
        r#"{"CSE-CST": ["test.gc.ca"], "CST": ["canada.ca"]}"#,
    )
    .expect("mapping");
    let report = OwnershipSync::new().sync(&graph, &mapping);

    assert_eq!(report.pairs_seen, 2);
    assert_eq!(report.upserted, 1);
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(
        report.unresolved[0].reason,
        ResolutionError::UnknownDomain("test.gc.ca".to_string())
    );
    assert_eq!(graph.ownership_edge_count().expect("count"), 1);
    assert_eq!(graph.owner_of(&known).expect("owner"), Some(cse));
}

#[test]
fn repeated_runs_never_duplicate_edges() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");

    for raw in ["2021-01-15", "2021-01-15", "2021-01-31", "2021-02-01", "2021-02-01"] {
        let report = fx.run(raw);
        assert!(report.failures.is_empty());
    }

    assert_eq!(fx.graph.summary_edge_count(&key).expect("edges"), 14);
    assert_eq!(fx.graph.summary_document_count().expect("docs"), 14);
}

#[test]
fn one_failing_domain_does_not_abort_the_batch() {
    let fx = Fixture::new();
    let bad = fx.domain("bad.gc.ca");
    let good = fx.domain("good.gc.ca");
    let domains = fx.graph.list_domains().expect("domains");

    let store = FlakyStore {
        inner: &fx.graph,
        domain_key: bad.clone(),
        period: None,
    };
    let source = GraphAggregateSource::new(&fx.reports, &fx.graph);
    let report = RollupOrchestrator::new(RollupConfig::default()).run(
        &source,
        &store,
        &domains,
        anchor("2021-01-15"),
    );

    assert_eq!(report.domains_processed, 2);
    assert_eq!(report.initialized, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].domain, "bad.gc.ca");
    assert_eq!(report.failures[0].period, Some(month("2020-01-01")));
    assert!(report.failures[0].error.contains("database is locked"));
    assert_eq!(fx.graph.summary_edge_count(&good).expect("edges"), 14);
    assert_eq!(fx.graph.summary_edge_count(&bad).expect("edges"), 0);
}

#[test]
fn interrupted_initialization_resumes_from_the_prefix() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    let domains = fx.graph.list_domains().expect("domains");
    let source = GraphAggregateSource::new(&fx.reports, &fx.graph);

    let store = FlakyStore {
        inner: &fx.graph,
        domain_key: key.clone(),
        period: Some(month("2020-06-01")),
    };
    let report = RollupOrchestrator::new(RollupConfig::default()).run(
        &source,
        &store,
        &domains,
        anchor("2021-01-15"),
    );
    assert_eq!(report.failures.len(), 1);
    assert_eq!(
        month_periods(&fx.graph, &key),
        vec![
            month("2020-01-01"),
            month("2020-02-01"),
            month("2020-03-01"),
            month("2020-04-01"),
            month("2020-05-01"),
        ]
    );

    let report = fx.run("2021-01-16");
    assert_eq!(report.resumed, 1);
    assert_eq!(month_periods(&fx.graph, &key).len(), 13);
    assert_eq!(fx.graph.summary_edge_count(&key).expect("edges"), 14);
}

#[test]
fn unreadable_edges_are_not_mistaken_for_an_empty_domain() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.run("2021-01-15");
    let domains = fx.graph.list_domains().expect("domains");

    let source = UnreadableEdges {
        inner: GraphAggregateSource::new(&fx.reports, &fx.graph),
        domain_key: key.clone(),
    };
    let report = RollupOrchestrator::new(RollupConfig::default()).run(
        &source,
        &fx.graph,
        &domains,
        anchor("2021-02-10"),
    );

    assert_eq!(report.initialized, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].period, None);
    // window untouched; the next healthy run performs the roll
    assert_eq!(month_periods(&fx.graph, &key)[0], month("2020-01-01"));
    assert_eq!(fx.run("2021-02-10").rolled, 1);
}

#[test]
fn skipped_months_catch_up_in_one_run() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.run("2021-01-15");

    let report = fx.run("2021-04-02");

    assert_eq!(report.rolled, 1);
    let months = month_periods(&fx.graph, &key);
    assert_eq!(months.len(), 13);
    assert_eq!(months[0], month("2020-04-01"));
    assert_eq!(months[12], month("2021-04-01"));
    assert_eq!(fx.graph.summary_document_count().expect("docs"), 14);
}

#[test]
fn domain_filter_limits_the_run() {
    let fx = Fixture::new();
    let a = fx.domain("a.gc.ca");
    let b = fx.domain("b.gc.ca");

    let report = run_rollup(
        &fx.graph,
        &fx.reports,
        anchor("2021-01-15"),
        RollupConfig {
            only_domains: vec!["B.GC.CA".to_string()],
        },
    )
    .expect("run rollup");

    assert_eq!(report.domains_processed, 1);
    assert_eq!(fx.graph.summary_edge_count(&a).expect("edges"), 0);
    assert_eq!(fx.graph.summary_edge_count(&b).expect("edges"), 14);
}

#[test]
fn on_disk_graph_keeps_state_between_invocations() {
    let dir = tempfile::tempdir().expect("temp dir");
    let graph_path = dir.path().join("graph.sqlite");
    let reports_path = dir.path().join("reports.sqlite");

    {
        let graph = GraphStore::open(&graph_path).expect("open graph");
        let reports = ReportStore::open(&reports_path).expect("open reports");
        graph.upsert_domain("a.gc.ca").expect("domain");
        run_rollup(&graph, &reports, anchor("2021-01-15"), RollupConfig::default())
            .expect("first run");
    }

    let graph = GraphStore::open(&graph_path).expect("reopen graph");
    let reports = ReportStore::open(&reports_path).expect("reopen reports");
    let report = run_rollup(&graph, &reports, anchor("2021-02-10"), RollupConfig::default())
        .expect("second run");
    assert_eq!(report.rolled, 1);
    let json = serde_json::to_value(&report).expect("serialize report");
    assert_eq!(json["anchor"], "2021-02-10");
}

#[test]
fn extra_stale_month_is_dropped_and_current_month_refreshed() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    fx.run("2021-01-15");
    fx.graph
        .create_snapshot(
            &key,
            &month("2019-12-01"),
            &CategoryTotals::default(),
            &CategoryPercentages::default(),
        )
        .expect("extra edge");
    assert_eq!(month_periods(&fx.graph, &key).len(), 14);

    fx.counts("a.gc.ca", &month("2021-01-01"), CategoryTotals::new(3, 1, 0, 0));
    let report = fx.run("2021-01-20");

    assert!(report.failures.is_empty());
    assert_eq!(report.rolled, 1);
    let months = month_periods(&fx.graph, &key);
    assert_eq!(months.len(), 13);
    assert_eq!(months[0], month("2020-01-01"));
    assert_eq!(fx.graph.summary_document_count().expect("docs"), 14);
    let current = fx
        .graph
        .summary_for(&key, &month("2021-01-01"))
        .expect("load")
        .expect("present");
    assert_eq!(current.total_messages, 4);
    assert_eq!(current.category_percentages.pass, 75.0);
}

#[test]
fn anchor_too_early_for_a_full_window_writes_nothing() {
    let fx = Fixture::new();
    let key = fx.domain("a.gc.ca");
    let early = NaiveDate::from_ymd_opt(0, 3, 15).expect("date");

    let result = run_rollup(&fx.graph, &fx.reports, early, RollupConfig::default());

    assert!(matches!(result, Err(RollupError::Validation(_))));
    assert_eq!(fx.graph.summary_edge_count(&key).expect("edges"), 0);
}
