/// Monotonic operation counters.
///
/// Counters are kept behind their own lock so [`metrics`](crate::Cache::metrics)
/// snapshots never contend with structural mutation; the returned value is a
/// plain copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Keys inserted for the first time. Updates of existing keys do not count.
    pub insertions: u64,
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing, or only an expired entry.
    pub misses: u64,
    /// Entries removed for any [`EvictionReason`](crate::EvictionReason).
    pub evictions: u64,
}
