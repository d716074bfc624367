//! In-place reconciliation of an ordered cached collection
//!
//! Matching happens in two rounds per cached entry: first on the raw data,
//! then on the derived configuration. A raw match keeps the entry untouched
//! unless its derived configuration went stale; a derived match replaces the
//! raw data while keeping the entry's position.
//! Everything else cached is removed (highest index first) and every unmatched
//! authoritative entry is appended.

use crate::observer::{EntryHooks, ReconcileObserver};
use crate::types::{ReconcileSummary, Tracked};

/// Reconcile `cached` against `fresh`, mutating `cached` in place
///
/// # Arguments
/// * `cached` - The owner's collection; positions of surviving entries never move
///   except for shifts caused by removals
/// * `fresh` - Authoritative raw entries, already sanitized
/// * `derive` - Computes the derived configuration of a raw entry
/// * `hooks` - Side effects run on init/deinit
/// * `observer` - Receives add/update/remove notifications
pub fn reconcile_in_place<T, D, F, H, O>(
    cached: &mut Vec<Tracked<T, D>>,
    fresh: Vec<T>,
    derive: F,
    hooks: &mut H,
    observer: &mut O,
) -> ReconcileSummary
where
    T: PartialEq,
    D: PartialEq,
    F: Fn(&T) -> D,
    H: EntryHooks<T, D> + ?Sized,
    O: ReconcileObserver + ?Sized,
{
    let mut fresh: Vec<Tracked<T, D>> = fresh
        .into_iter()
        .map(|raw| Tracked::new(raw, &derive))
        .collect();
    let mut summary = ReconcileSummary::default();
    let mut to_remove = Vec::new();

    for index in 0..cached.len() {
        if let Some(pos) = fresh.iter().position(|c| c.raw == cached[index].raw) {
            let replacement = fresh.remove(pos);
            if replacement.derived == cached[index].derived {
                summary.unchanged += 1;
            } else {
                // Same raw data, but the derivation inputs moved
                hooks.deinit(index, &cached[index]);
                cached[index] = replacement;
                hooks.init(index, &cached[index]);
                observer.on_updated(index);
                summary.updated += 1;
            }
            continue;
        }

        let current = derive(&cached[index].raw);
        if let Some(pos) = fresh.iter().position(|c| c.derived == current) {
            let replacement = fresh.remove(pos);
            hooks.deinit(index, &cached[index]);
            cached[index] = replacement;
            hooks.init(index, &cached[index]);
            observer.on_updated(index);
            summary.updated += 1;
            continue;
        }

        to_remove.push(index);
    }

    for &index in to_remove.iter().rev() {
        observer.on_about_to_remove(index);
        hooks.deinit(index, &cached[index]);
        cached.remove(index);
        summary.removed += 1;
    }

    for entry in fresh {
        cached.push(entry);
        let index = cached.len() - 1;
        hooks.init(index, &cached[index]);
        observer.on_added(index);
        summary.added += 1;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{EventLog, NoHooks};
    use crate::types::ReconcileEvent;

    #[derive(Debug, Clone, PartialEq)]
    struct Probe {
        name: &'static str,
        probe: u32,
    }

    fn probe(name: &'static str, probe: u32) -> Probe {
        Probe { name, probe }
    }

    fn derive(p: &Probe) -> String {
        format!("/targets/{}", p.name)
    }

    fn cache(entries: &[Probe]) -> Vec<Tracked<Probe, String>> {
        entries
            .iter()
            .cloned()
            .map(|p| Tracked::new(p, derive))
            .collect()
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Vec<String>,
    }

    impl EntryHooks<Probe, String> for RecordingHooks {
        fn init(&mut self, index: usize, entry: &Tracked<Probe, String>) {
            self.calls.push(format!("init {index} {}", entry.raw.name));
        }

        fn deinit(&mut self, index: usize, entry: &Tracked<Probe, String>) {
            self.calls.push(format!("deinit {index} {}", entry.raw.name));
        }
    }

    #[test]
    fn test_second_pass_is_noop() {
        let mut cached = cache(&[probe("a", 1)]);
        let fresh = vec![probe("a", 2), probe("b", 1), probe("c", 1)];

        let mut log = EventLog::new();
        let first = reconcile_in_place(&mut cached, fresh.clone(), derive, &mut NoHooks, &mut log);
        assert_eq!(first.total_changes(), 3);

        let mut log = EventLog::new();
        let second = reconcile_in_place(&mut cached, fresh, derive, &mut NoHooks, &mut log);
        assert!(second.is_noop());
        assert!(log.is_empty());
        assert_eq!(second.unchanged, 3);
    }

    #[test]
    fn test_derived_match_updates_in_place() {
        let mut cached = cache(&[probe("a", 1), probe("b", 1)]);
        let mut hooks = RecordingHooks::default();
        let mut log = EventLog::new();

        let summary = reconcile_in_place(
            &mut cached,
            vec![probe("a", 1), probe("b", 9)],
            derive,
            &mut hooks,
            &mut log,
        );

        assert_eq!(summary.updated, 1);
        assert_eq!(log.events, vec![ReconcileEvent::Updated { index: 1 }]);
        assert_eq!(cached[1].raw.probe, 9);
        assert_eq!(hooks.calls, vec!["deinit 1 b", "init 1 b"]);
    }

    #[test]
    fn test_stale_derivation_updates_in_place() {
        let mut cached = cache(&[probe("a", 1), probe("b", 1)]);
        let mut hooks = RecordingHooks::default();
        let mut log = EventLog::new();
        let moved = |p: &Probe| format!("/moved/{}", p.name);

        let summary = reconcile_in_place(
            &mut cached,
            vec![probe("a", 1), probe("b", 2)],
            moved,
            &mut hooks,
            &mut log,
        );

        assert_eq!(summary.updated, 2);
        assert_eq!(summary.added + summary.removed, 0);
        assert_eq!(
            log.events,
            vec![
                ReconcileEvent::Updated { index: 0 },
                ReconcileEvent::Updated { index: 1 },
            ]
        );
        assert_eq!(cached[0].derived, "/moved/a");
        assert_eq!(cached[1].raw.probe, 2);
        assert_eq!(
            hooks.calls,
            vec!["deinit 0 a", "init 0 a", "deinit 1 b", "init 1 b"]
        );
    }

    #[test]
    fn test_removals_descend_and_adds_append() {
        let mut cached = cache(&[probe("a", 1), probe("b", 1), probe("c", 1), probe("d", 1)]);
        let mut log = EventLog::new();

        reconcile_in_place(
            &mut cached,
            vec![probe("c", 1), probe("e", 1)],
            derive,
            &mut NoHooks,
            &mut log,
        );

        assert_eq!(
            log.events,
            vec![
                ReconcileEvent::Removed { index: 3 },
                ReconcileEvent::Removed { index: 1 },
                ReconcileEvent::Removed { index: 0 },
                ReconcileEvent::Added { index: 1 },
            ]
        );
        let names: Vec<_> = cached.iter().map(|t| t.raw.name).collect();
        assert_eq!(names, vec!["c", "e"]);
    }

    #[test]
    fn test_updated_entry_keeps_position_among_removals() {
        let mut cached = cache(&[probe("a", 1), probe("b", 1), probe("c", 1)]);
        let mut log = EventLog::new();

        reconcile_in_place(
            &mut cached,
            vec![probe("c", 5), probe("a", 1)],
            derive,
            &mut NoHooks,
            &mut log,
        );

        assert_eq!(
            log.events,
            vec![
                ReconcileEvent::Updated { index: 2 },
                ReconcileEvent::Removed { index: 1 },
            ]
        );
        assert_eq!(cached[0].raw, probe("a", 1));
        assert_eq!(cached[1].raw, probe("c", 5));
    }
}
