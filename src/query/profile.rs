use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of per-stage query profiling counters.
///
/// Profiling is enabled via the `SPARROW_PROFILE` environment variable. Time
/// spent inside operators is inclusive of their children's pulls.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent parsing query text.
    pub parse_ns: u64,
    /// Number of parses.
    pub parse_count: u64,
    /// Total nanoseconds spent in the logical optimizer.
    pub optimize_ns: u64,
    /// Number of optimizer runs.
    pub optimize_count: u64,
    /// Total nanoseconds spent in physical planning.
    pub plan_ns: u64,
    /// Number of plans built.
    pub plan_count: u64,
    /// Total nanoseconds spent pulling from source scans.
    pub scan_ns: u64,
    /// Number of scan pulls.
    pub scan_count: u64,
    /// Total nanoseconds spent in join operators.
    pub join_ns: u64,
    /// Number of join pulls.
    pub join_count: u64,
    /// Total nanoseconds spent evaluating filters.
    pub filter_ns: u64,
    /// Number of filter evaluations.
    pub filter_count: u64,
    /// Total nanoseconds spent sorting.
    pub sort_ns: u64,
    /// Number of sorts.
    pub sort_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    parse_ns: AtomicU64,
    parse_count: AtomicU64,
    optimize_ns: AtomicU64,
    optimize_count: AtomicU64,
    plan_ns: AtomicU64,
    plan_count: AtomicU64,
    scan_ns: AtomicU64,
    scan_count: AtomicU64,
    join_ns: AtomicU64,
    join_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
    sort_ns: AtomicU64,
    sort_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("SPARROW_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    Parse,
    Optimize,
    Plan,
    /// One pull from a source scan.
    Scan,
    /// One pull from a join operator.
    Join,
    Filter,
    Sort,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Parse => (&counters.parse_ns, &counters.parse_count),
        QueryProfileKind::Optimize => (&counters.optimize_ns, &counters.optimize_count),
        QueryProfileKind::Plan => (&counters.plan_ns, &counters.plan_count),
        QueryProfileKind::Scan => (&counters.scan_ns, &counters.scan_count),
        QueryProfileKind::Join => (&counters.join_ns, &counters.join_count),
        QueryProfileKind::Filter => (&counters.filter_ns, &counters.filter_count),
        QueryProfileKind::Sort => (&counters.sort_ns, &counters.sort_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current query profiling counters.
///
/// # Arguments
///
/// * `reset` - If `true`, resets all counters to zero after reading them.
///
/// # Returns
///
/// `None` when profiling is disabled (no `SPARROW_PROFILE` in the environment).
///
/// # Example
///
/// ```no_run
/// use sparrow::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(true) {
///     println!("scan pulls: {}", snapshot.scan_count);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        parse_ns: load(&counters.parse_ns),
        parse_count: load(&counters.parse_count),
        optimize_ns: load(&counters.optimize_ns),
        optimize_count: load(&counters.optimize_count),
        plan_ns: load(&counters.plan_ns),
        plan_count: load(&counters.plan_count),
        scan_ns: load(&counters.scan_ns),
        scan_count: load(&counters.scan_count),
        join_ns: load(&counters.join_ns),
        join_count: load(&counters.join_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
        sort_ns: load(&counters.sort_ns),
        sort_count: load(&counters.sort_count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_follows_enable_flag() {
        let start = profile_timer();
        record_profile_timer(QueryProfileKind::Parse, start);
        match profile_snapshot(false) {
            Some(snapshot) => {
                assert!(profiling_enabled());
                assert!(snapshot.parse_count >= 1);
            }
            None => {
                assert!(!profiling_enabled());
                assert!(start.is_none());
            }
        }
    }
}
