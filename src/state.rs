use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDate;

use crate::mobility::MobilityData;
use crate::national::NationalData;
use crate::regional::RegionalData;

/// One complete, immutable generation of parsed data. A dataset that failed to
/// load is `None`.
#[derive(Debug, Clone, Default)]
pub struct Datasets {
    pub regional: Option<RegionalData>,
    pub national: Option<NationalData>,
    pub mobility: Option<MobilityData>,
}

impl Datasets {
    pub fn is_empty(&self) -> bool {
        self.regional.is_none() && self.national.is_none() && self.mobility.is_none()
    }

    pub fn upto_scotland(&self) -> Option<NaiveDate> {
        self.regional.as_ref().and_then(RegionalData::last_date)
    }

    pub fn upto_uk(&self) -> Option<NaiveDate> {
        self.national.as_ref().and_then(NationalData::last_date)
    }

    pub fn upto_mobility(&self) -> Option<NaiveDate> {
        self.mobility.as_ref().and_then(MobilityData::last_date)
    }
}

/// The published datasets. Readers take a snapshot and keep it for as long as
/// they need; an update builds a whole new [`Datasets`] and swaps it in, so a
/// snapshot is never partially overwritten.
#[derive(Debug, Clone, Default)]
pub struct SharedDatasets {
    current: Arc<RwLock<Arc<Datasets>>>,
    updating: Arc<AtomicBool>,
}

impl SharedDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Datasets> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn publish(&self, datasets: Datasets) {
        let next = Arc::new(datasets);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Marks an update as running until the guard is dropped. `None` when
    /// another update already holds the flag.
    pub fn begin_update(&self) -> Option<UpdateGuard<'_>> {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| UpdateGuard {
                flag: &self.updating,
            })
    }
}

pub struct UpdateGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_survive_a_publish() {
        let shared = SharedDatasets::new();
        let before = shared.snapshot();
        assert!(before.is_empty());

        shared.publish(Datasets {
            national: Some(NationalData::default()),
            ..Datasets::default()
        });

        assert!(before.is_empty());
        assert!(shared.snapshot().national.is_some());
    }

    #[test]
    fn only_one_update_at_a_time() {
        let shared = SharedDatasets::new();
        let guard = shared.begin_update().unwrap();
        assert!(shared.is_updating());
        assert!(shared.begin_update().is_none());
        drop(guard);
        assert!(!shared.is_updating());
        assert!(shared.begin_update().is_some());
    }

    #[test]
    fn clones_share_the_published_state() {
        let shared = SharedDatasets::new();
        let reader = shared.clone();
        shared.publish(Datasets {
            regional: Some(RegionalData::default()),
            ..Datasets::default()
        });
        assert!(reader.snapshot().regional.is_some());
    }
}
