use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracker_core::{
    check_anchor, derive, normalize_domain, periods, AggregateSource, CategoryPercentages, CategoryTotals,
    MonthKey, PeriodKey, SourceError, ValidationError,
};
use tracker_storage::{DomainRecord, GraphStore, ReportStore, StorageError, SummaryStore};

pub mod ownership;

pub use ownership::{OwnershipReport, OwnershipSync, ResolutionError, UnresolvedPair};

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Where a domain sits in its summary lifecycle, judged from its edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Uninitialized,
    Initializing,
    SteadyState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Full history: every expected month, then `thirtyDays`.
    Initialize { months: Vec<PeriodKey> },
    /// A previous initialization stopped part way.
    Resume { missing: Vec<PeriodKey> },
    /// Window unchanged; only the current month is recomputed.
    Refresh { current: PeriodKey },
    /// Window advanced. Stale months are paired oldest-first with missing
    /// ones; leftovers on either side are created or removed on their own.
    /// `current` is refreshed when no pair or creation writes it.
    Roll {
        pairs: Vec<(PeriodKey, PeriodKey)>,
        create: Vec<PeriodKey>,
        remove: Vec<PeriodKey>,
        current: PeriodKey,
    },
}

impl Transition {
    /// The state the domain was detected in before this run touched it.
    pub fn state(&self) -> DomainState {
        match self {
            Transition::Initialize { .. } => DomainState::Uninitialized,
            Transition::Resume { .. } => DomainState::Initializing,
            Transition::Refresh { .. } | Transition::Roll { .. } => DomainState::SteadyState,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Transition::Initialize { .. } => "initialize",
            Transition::Resume { .. } => "resume",
            Transition::Refresh { .. } => "refresh",
            Transition::Roll { .. } => "roll",
        }
    }
}

/// Decides what a domain needs given the anchor and the periods it already has.
pub fn plan_transition(anchor: NaiveDate, known: &[PeriodKey]) -> Transition {
    let expected = periods(anchor);
    let mut actual = known
        .iter()
        .copied()
        .filter(PeriodKey::is_month)
        .collect::<Vec<_>>();
    actual.sort();
    actual.dedup();

    if actual.is_empty() {
        return Transition::Initialize { months: expected };
    }

    if actual == expected {
        return Transition::Refresh {
            current: PeriodKey::Month(MonthKey::containing(anchor)),
        };
    }

    let expected_set = expected.iter().copied().collect::<BTreeSet<_>>();
    let actual_set = actual.iter().copied().collect::<BTreeSet<_>>();
    let stale = actual
        .iter()
        .copied()
        .filter(|period| !expected_set.contains(period))
        .collect::<Vec<_>>();
    let missing = expected
        .iter()
        .copied()
        .filter(|period| !actual_set.contains(period))
        .collect::<Vec<_>>();

    if stale.is_empty() {
        return Transition::Resume { missing };
    }

    let paired = stale.len().min(missing.len());
    Transition::Roll {
        pairs: stale
            .iter()
            .copied()
            .zip(missing.iter().copied())
            .collect(),
        create: missing[paired..].to_vec(),
        remove: stale[paired..].to_vec(),
        current: PeriodKey::Month(MonthKey::containing(anchor)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RollupConfig {
    /// Restrict the run to these domain names; empty means every domain.
    pub only_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainFailure {
    pub domain: String,
    pub period: Option<PeriodKey>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub anchor: NaiveDate,
    pub domains_processed: usize,
    pub initialized: usize,
    pub resumed: usize,
    pub refreshed: usize,
    pub rolled: usize,
    pub failures: Vec<DomainFailure>,
}

impl RollupReport {
    fn new(anchor: NaiveDate) -> Self {
        Self {
            anchor,
            domains_processed: 0,
            initialized: 0,
            resumed: 0,
            refreshed: 0,
            rolled: 0,
            failures: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.domains_processed - self.failures.len()
    }
}

#[derive(Debug)]
struct StepError {
    period: Option<PeriodKey>,
    error: RollupError,
}

trait AtPeriod<T> {
    fn at(self, period: Option<&PeriodKey>) -> Result<T, StepError>;
}

impl<T, E: Into<RollupError>> AtPeriod<T> for Result<T, E> {
    fn at(self, period: Option<&PeriodKey>) -> Result<T, StepError> {
        self.map_err(|err| StepError {
            period: period.copied(),
            error: err.into(),
        })
    }
}

/// Reads counts from the report store and known periods from the graph.
pub struct GraphAggregateSource<'a> {
    reports: &'a ReportStore,
    graph: &'a GraphStore,
}

impl<'a> GraphAggregateSource<'a> {
    pub fn new(reports: &'a ReportStore, graph: &'a GraphStore) -> Self {
        Self { reports, graph }
    }
}

impl AggregateSource for GraphAggregateSource<'_> {
    fn counts_for(&self, domain: &str, period: &PeriodKey) -> Result<CategoryTotals, SourceError> {
        self.reports.counts_for(domain, period)
    }

    fn known_periods(&self, domain_key: &str) -> Result<Vec<PeriodKey>, SourceError> {
        self.graph
            .known_periods(domain_key)
            .map_err(|err| SourceError::new(format!("known periods for {domain_key}: {err}")))
    }
}

pub struct RollupOrchestrator {
    config: RollupConfig,
}

impl RollupOrchestrator {
    pub fn new(config: RollupConfig) -> Self {
        Self { config }
    }

    /// Processes every selected domain independently. A failing domain is
    /// logged and recorded in the report; the run carries on with the next one.
    pub fn run<A, S>(
        &self,
        source: &A,
        store: &S,
        domains: &[DomainRecord],
        anchor: NaiveDate,
    ) -> RollupReport
    where
        A: AggregateSource,
        S: SummaryStore,
    {
        let selected = self
            .config
            .only_domains
            .iter()
            .map(|name| normalize_domain(name))
            .collect::<BTreeSet<_>>();

        let mut report = RollupReport::new(anchor);
        info!(event = "rollup_start", anchor = %anchor, domains = domains.len());

        for domain in domains {
            if !selected.is_empty() && !selected.contains(&domain.domain) {
                continue;
            }
            report.domains_processed += 1;

            match self.process_domain(source, store, domain, anchor) {
                Ok(transition) => match transition.state() {
                    DomainState::Uninitialized => report.initialized += 1,
                    DomainState::Initializing => report.resumed += 1,
                    DomainState::SteadyState => {
                        if matches!(transition, Transition::Roll { .. }) {
                            report.rolled += 1;
                        } else {
                            report.refreshed += 1;
                        }
                    }
                },
                Err(step) => {
                    let period = step.period.map(|period| period.to_string());
                    error!(
                        event = "rollup_domain_failed",
                        domain = %domain.domain,
                        period = period.as_deref().unwrap_or("-"),
                        error = %step.error
                    );
                    report.failures.push(DomainFailure {
                        domain: domain.domain.clone(),
                        period: step.period,
                        error: step.error.to_string(),
                    });
                }
            }
        }

        info!(
            event = "rollup_finish",
            anchor = %anchor,
            processed = report.domains_processed,
            initialized = report.initialized,
            resumed = report.resumed,
            refreshed = report.refreshed,
            rolled = report.rolled,
            failed = report.failures.len()
        );
        report
    }

    fn process_domain<A, S>(
        &self,
        source: &A,
        store: &S,
        domain: &DomainRecord,
        anchor: NaiveDate,
    ) -> Result<Transition, StepError>
    where
        A: AggregateSource,
        S: SummaryStore,
    {
        // A failed read must not look like an empty (uninitialized) domain.
        let known = source.known_periods(&domain.key).at(None)?;
        let transition = plan_transition(anchor, &known);
        debug!(
            event = "rollup_plan",
            domain = %domain.domain,
            known = known.len(),
            transition = transition.label()
        );

        match &transition {
            Transition::Initialize { months } => {
                for period in months.iter().chain(std::iter::once(&PeriodKey::ThirtyDays)) {
                    let (totals, percentages) = fetch(source, domain, period)?;
                    store
                        .create_snapshot(&domain.key, period, &totals, &percentages)
                        .at(Some(period))?;
                }
            }
            Transition::Resume { missing } => {
                warn!(
                    event = "rollup_resume",
                    domain = %domain.domain,
                    missing = missing.len()
                );
                for period in missing {
                    let (totals, percentages) = fetch(source, domain, period)?;
                    store
                        .create_snapshot(&domain.key, period, &totals, &percentages)
                        .at(Some(period))?;
                }
                refresh(source, store, domain, &PeriodKey::ThirtyDays)?;
            }
            Transition::Refresh { current } => {
                refresh(source, store, domain, &PeriodKey::ThirtyDays)?;
                refresh(source, store, domain, current)?;
            }
            Transition::Roll {
                pairs,
                create,
                remove,
                current,
            } => {
                refresh(source, store, domain, &PeriodKey::ThirtyDays)?;
                if pairs.len() > 1 || !create.is_empty() || !remove.is_empty() {
                    warn!(
                        event = "rollup_multi_month_drift",
                        domain = %domain.domain,
                        pairs = pairs.len(),
                        create = create.len(),
                        remove = remove.len()
                    );
                }
                for (old, new) in pairs {
                    let (totals, percentages) = fetch(source, domain, new)?;
                    store
                        .roll_window(&domain.key, old, new, &totals, &percentages)
                        .at(Some(new))?;
                    debug!(
                        event = "rollup_window_rolled",
                        domain = %domain.domain,
                        removed = %old,
                        added = %new
                    );
                }
                for period in create {
                    let (totals, percentages) = fetch(source, domain, period)?;
                    store
                        .create_snapshot(&domain.key, period, &totals, &percentages)
                        .at(Some(period))?;
                }
                for period in remove {
                    store
                        .remove_edge_and_snapshot(&domain.key, period)
                        .at(Some(period))?;
                }
                let written =
                    pairs.iter().any(|(_, new)| new == current) || create.contains(current);
                if !written {
                    refresh(source, store, domain, current)?;
                }
            }
        }

        info!(
            event = "rollup_domain",
            domain = %domain.domain,
            transition = transition.label()
        );
        Ok(transition)
    }
}

fn fetch<A: AggregateSource>(
    source: &A,
    domain: &DomainRecord,
    period: &PeriodKey,
) -> Result<(CategoryTotals, CategoryPercentages), StepError> {
    let totals = source.counts_for(&domain.domain, period).at(Some(period))?;
    let (_, percentages) = derive(&totals);
    Ok((totals, percentages))
}

fn refresh<A, S>(
    source: &A,
    store: &S,
    domain: &DomainRecord,
    period: &PeriodKey,
) -> Result<(), StepError>
where
    A: AggregateSource,
    S: SummaryStore,
{
    let (totals, percentages) = fetch(source, domain, period)?;
    store
        .upsert_current_period(&domain.key, period, &totals, &percentages)
        .at(Some(period))?;
    Ok(())
}

/// Lists the graph's domains and rolls them all against `anchor`.
pub fn run_rollup(
    graph: &GraphStore,
    reports: &ReportStore,
    anchor: NaiveDate,
    config: RollupConfig,
) -> Result<RollupReport, RollupError> {
    check_anchor(anchor)?;
    let domains = graph.list_domains()?;
    let source = GraphAggregateSource::new(reports, graph);
    Ok(RollupOrchestrator::new(config).run(&source, graph, &domains, anchor))
}
