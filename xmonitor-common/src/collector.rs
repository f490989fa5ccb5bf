//! Metric collection over the registry.

use crate::metrics::MetricCategory;
use crate::registry::{RegistryEntry, Strategy, MAX_REGISTRY_ENTRIES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// The source returned a block of the wrong size.
    SizeMismatch { expected: u32, actual: u32 },
    /// The counters exist but could not be read (e.g. never sampled).
    ReadFault,
    /// No exported metrics for this instance.
    Unreachable,
    /// The entry names a strategy or category this build does not know.
    Unsupported,
}

impl AcquireError {
    /// Small numeric code for program logs.
    pub const fn code(&self) -> u8 {
        match self {
            AcquireError::SizeMismatch { .. } => 1,
            AcquireError::ReadFault => 2,
            AcquireError::Unreachable => 3,
            AcquireError::Unsupported => 4,
        }
    }
}

/// Where metric bytes come from.
pub trait MetricSource {
    /// Host counters of `category`, read from the responder's own context.
    fn direct(&self, category: MetricCategory) -> Result<&[u8], AcquireError>;

    /// The block exported by the instance listening on `port`.
    fn indirect(&self, port: u16) -> Result<&[u8], AcquireError>;
}

/// What to do with the packet when one acquisition fails.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the packet; nothing is transmitted.
    Abort = 0,
    /// Stop collecting and transmit the blocks gathered so far.
    Truncate = 1,
}

impl FailurePolicy {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FailurePolicy::Abort),
            1 => Some(FailurePolicy::Truncate),
            _ => None,
        }
    }
}

/// A failed acquisition and the registry position it happened at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Failure {
    pub index: usize,
    pub entry: RegistryEntry,
    pub error: AcquireError,
}

/// Result of a completed (possibly truncated) collection pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Collection {
    pub blocks: usize,
    pub bytes: usize,
    /// Set when a `Truncate` failure stopped the pass early.
    pub truncated: Option<Failure>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectError<E> {
    /// An acquisition failed under the `Abort` policy.
    Fatal(Failure),
    /// The sink refused a block.
    Sink(E),
}

pub struct Collector<'a, S: ?Sized> {
    source: &'a S,
    direct_policy: FailurePolicy,
    indirect_policy: FailurePolicy,
}

impl<'a, S: MetricSource + ?Sized> Collector<'a, S> {
    pub fn new(source: &'a S, direct_policy: FailurePolicy, indirect_policy: FailurePolicy) -> Self {
        Self {
            source,
            direct_policy,
            indirect_policy,
        }
    }

    /// Fetch one entry's block, checking it is exactly `block_len` bytes.
    #[inline(always)]
    pub fn acquire(&self, entry: &RegistryEntry) -> Result<&'a [u8], AcquireError> {
        let bytes = match entry.strategy() {
            Some(Strategy::Direct) => {
                let category = entry.category().ok_or(AcquireError::Unsupported)?;
                self.source.direct(category)?
            }
            Some(Strategy::Indirect) => self.source.indirect(entry.id)?,
            None => return Err(AcquireError::Unsupported),
        };
        if bytes.len() != entry.block_len as usize {
            return Err(AcquireError::SizeMismatch {
                expected: entry.block_len,
                actual: bytes.len() as u32,
            });
        }
        Ok(bytes)
    }

    /// Policy for a failed entry. Entries of unknown strategy abort.
    pub fn policy_for(&self, entry: &RegistryEntry) -> FailurePolicy {
        match entry.strategy() {
            Some(Strategy::Direct) => self.direct_policy,
            Some(Strategy::Indirect) => self.indirect_policy,
            None => FailurePolicy::Abort,
        }
    }

    /// Acquire every entry in order and hand each block to `sink`.
    ///
    /// Iteration is bounded by `MAX_REGISTRY_ENTRIES`. A failed acquisition
    /// either aborts the whole pass or ends it early, depending on the
    /// entry's policy; blocks already handed to the sink stay there.
    #[inline(always)]
    pub fn collect<F, E>(
        &self,
        entries: &[RegistryEntry],
        mut sink: F,
    ) -> Result<Collection, CollectError<E>>
    where
        F: FnMut(&RegistryEntry, &[u8]) -> Result<(), E>,
    {
        let mut collection = Collection {
            blocks: 0,
            bytes: 0,
            truncated: None,
        };

        for (index, entry) in entries.iter().take(MAX_REGISTRY_ENTRIES).enumerate() {
            let bytes = match self.acquire(entry) {
                Ok(bytes) => bytes,
                Err(error) => {
                    let failure = Failure {
                        index,
                        entry: *entry,
                        error,
                    };
                    match self.policy_for(entry) {
                        FailurePolicy::Abort => return Err(CollectError::Fatal(failure)),
                        FailurePolicy::Truncate => {
                            collection.truncated = Some(failure);
                            break;
                        }
                    }
                }
            };
            sink(entry, bytes).map_err(CollectError::Sink)?;
            collection.blocks += 1;
            collection.bytes += bytes.len();
        }

        Ok(collection)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory metric source for pipeline tests.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub host: BTreeMap<u16, Vec<u8>>,
        pub apps: BTreeMap<u16, Vec<u8>>,
    }

    impl FakeSource {
        pub(crate) fn with_host(mut self, category: MetricCategory, fill: u8) -> Self {
            self.host
                .insert(category.tag(), vec![fill; category.block_len()]);
            self
        }

        pub(crate) fn with_app(mut self, port: u16, len: usize, fill: u8) -> Self {
            self.apps.insert(port, vec![fill; len]);
            self
        }
    }

    impl MetricSource for FakeSource {
        fn direct(&self, category: MetricCategory) -> Result<&[u8], AcquireError> {
            self.host
                .get(&category.tag())
                .map(Vec::as_slice)
                .ok_or(AcquireError::ReadFault)
        }

        fn indirect(&self, port: u16) -> Result<&[u8], AcquireError> {
            self.apps
                .get(&port)
                .map(Vec::as_slice)
                .ok_or(AcquireError::Unreachable)
        }
    }

    fn collect_ids(
        collector: &Collector<'_, FakeSource>,
        entries: &[RegistryEntry],
    ) -> (Result<Collection, CollectError<()>>, Vec<u16>) {
        let mut seen = Vec::new();
        let result = collector.collect(entries, |entry, _| {
            seen.push(entry.id);
            Ok(())
        });
        (result, seen)
    }

    #[test]
    fn collects_every_entry_in_order() {
        let source = FakeSource::default()
            .with_host(MetricCategory::Cpu, 1)
            .with_app(11211, 64, 2)
            .with_app(11212, 64, 3);
        let collector = Collector::new(&source, FailurePolicy::Abort, FailurePolicy::Truncate);
        let entries = [
            RegistryEntry::direct(MetricCategory::Cpu),
            RegistryEntry::indirect(11211, 64),
            RegistryEntry::indirect(11212, 64),
        ];

        let (result, seen) = collect_ids(&collector, &entries);
        assert_eq!(
            result,
            Ok(Collection {
                blocks: 3,
                bytes: 88 + 128,
                truncated: None
            })
        );
        assert_eq!(seen, [0, 11211, 11212]);
    }

    #[test]
    fn indirect_failure_truncates() {
        let source = FakeSource::default()
            .with_app(11211, 64, 2)
            .with_app(11213, 64, 4);
        let collector = Collector::new(&source, FailurePolicy::Abort, FailurePolicy::Truncate);
        let entries = [
            RegistryEntry::indirect(11211, 64),
            RegistryEntry::indirect(11212, 64),
            RegistryEntry::indirect(11213, 64),
        ];

        let (result, seen) = collect_ids(&collector, &entries);
        let collection = result.unwrap();
        assert_eq!(collection.blocks, 1);
        assert_eq!(
            collection.truncated,
            Some(Failure {
                index: 1,
                entry: entries[1],
                error: AcquireError::Unreachable,
            })
        );
        assert_eq!(seen, [11211]);
    }

    #[test]
    fn direct_failure_is_fatal() {
        let source = FakeSource::default().with_host(MetricCategory::Cpu, 1);
        let collector = Collector::new(&source, FailurePolicy::Abort, FailurePolicy::Truncate);
        let entries = [
            RegistryEntry::direct(MetricCategory::Cpu),
            RegistryEntry::direct(MetricCategory::Disk),
        ];

        let (result, _) = collect_ids(&collector, &entries);
        assert!(matches!(
            result,
            Err(CollectError::Fatal(Failure {
                index: 1,
                error: AcquireError::ReadFault,
                ..
            }))
        ));
    }

    #[test]
    fn policies_are_configurable_per_strategy() {
        let source = FakeSource::default();
        let collector = Collector::new(&source, FailurePolicy::Truncate, FailurePolicy::Abort);

        let (result, _) = collect_ids(&collector, &[RegistryEntry::indirect(6379, 740)]);
        assert!(matches!(result, Err(CollectError::Fatal(_))));

        let (result, _) = collect_ids(&collector, &[RegistryEntry::direct(MetricCategory::Memory)]);
        assert_eq!(result.unwrap().blocks, 0);
    }

    #[test]
    fn wrong_sized_block_is_rejected() {
        let source = FakeSource::default().with_app(11211, 60, 0);
        let collector = Collector::new(&source, FailurePolicy::Abort, FailurePolicy::Abort);

        assert_eq!(
            collector.acquire(&RegistryEntry::indirect(11211, 64)),
            Err(AcquireError::SizeMismatch {
                expected: 64,
                actual: 60
            })
        );
    }

    #[test]
    fn unknown_strategy_is_unsupported_and_aborts() {
        let source = FakeSource::default();
        let collector = Collector::new(&source, FailurePolicy::Truncate, FailurePolicy::Truncate);
        let entry = RegistryEntry {
            strategy: 7,
            ..RegistryEntry::indirect(1, 8)
        };

        assert_eq!(collector.acquire(&entry), Err(AcquireError::Unsupported));
        assert_eq!(collector.policy_for(&entry), FailurePolicy::Abort);
    }

    #[test]
    fn sink_errors_stop_collection() {
        let source = FakeSource::default()
            .with_app(1, 8, 0)
            .with_app(2, 8, 0);
        let collector = Collector::new(&source, FailurePolicy::Abort, FailurePolicy::Truncate);
        let entries = [RegistryEntry::indirect(1, 8), RegistryEntry::indirect(2, 8)];

        let mut calls = 0;
        let result = collector.collect(&entries, |_, _| {
            calls += 1;
            Err("full")
        });
        assert_eq!(result, Err(CollectError::Sink("full")));
        assert_eq!(calls, 1);
    }
}
