//! Time-windowed re-identification memory

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use vigil_ai::ReportedPerson;
use vigil_db::PersonFeatures;

/// Latest known description of a tracked person
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonObservation {
    pub id: String,
    pub features: serde_json::Value,
    pub position: Option<String>,
    pub action: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl PersonObservation {
    /// Observation from a model report; people without an id cannot be tracked
    pub fn from_report(person: &ReportedPerson, seen_at: DateTime<Utc>) -> Option<Self> {
        let id = person.id.as_deref().map(str::trim).filter(|id| !id.is_empty())?;
        Some(Self {
            id: id.to_string(),
            features: person.features.clone(),
            position: person.position.clone(),
            action: person.action.clone(),
            last_seen: seen_at,
        })
    }

    pub fn to_record(&self, created_at: DateTime<Utc>) -> PersonFeatures {
        PersonFeatures {
            id: self.id.clone(),
            features: self.features.clone(),
            position: self.position.clone(),
            action: self.action.clone(),
            last_seen: self.last_seen,
            created_at,
        }
    }

    /// Replace the stored record with the latest observation; only the id survives
    fn merge(&mut self, incoming: PersonObservation) {
        self.features = incoming.features;
        self.position = incoming.position;
        self.action = incoming.action;
        self.last_seen = incoming.last_seen;
    }
}

#[derive(Debug, Clone)]
struct Entry {
    observation: PersonObservation,
    created_at: DateTime<Utc>,
}

/// Mapping of person id to latest observation.
///
/// Entries expire once older than the retention window, measured from the
/// last upsert; expiry happens lazily on every read.
#[derive(Debug)]
pub struct ReidStore {
    retention: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for ReidStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReidStore {
    pub fn new() -> Self {
        Self::with_retention(Duration::seconds(vigil_db::PERSON_RETENTION_SECS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(&self, observation: PersonObservation) -> PersonObservation {
        self.upsert_at(observation, Utc::now())
    }

    /// Insert or merge by id; returns the stored observation
    pub fn upsert_at(&self, observation: PersonObservation, now: DateTime<Utc>) -> PersonObservation {
        let mut entries = self.entries();
        let entry = entries
            .entry(observation.id.clone())
            .and_modify(|e| {
                e.observation.merge(observation.clone());
                e.created_at = now;
            })
            .or_insert_with(|| Entry {
                observation,
                created_at: now,
            });
        entry.observation.clone()
    }

    /// Live observations sorted by id
    pub fn snapshot(&self) -> Vec<PersonObservation> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<PersonObservation> {
        let mut entries = self.entries();
        self.evict(&mut entries, now);

        let mut live: Vec<_> = entries.values().map(|e| e.observation.clone()).collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    pub fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<PersonObservation> {
        let mut entries = self.entries();
        self.evict(&mut entries, now);
        entries.get(id).map(|e| e.observation.clone())
    }

    /// Seed from persisted records, keeping their original creation times
    pub fn hydrate(&self, records: impl IntoIterator<Item = PersonFeatures>) -> usize {
        let mut entries = self.entries();
        let mut loaded = 0;
        for record in records {
            entries.insert(
                record.id.clone(),
                Entry {
                    created_at: record.created_at,
                    observation: PersonObservation {
                        id: record.id,
                        features: record.features,
                        position: record.position,
                        action: record.action,
                        last_seen: record.last_seen,
                    },
                },
            );
            loaded += 1;
        }
        loaded
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    fn evict(&self, entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        let before = entries.len();
        entries.retain(|_, e| now - e.created_at <= self.retention);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {} expired reid entries", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn observation(id: &str, at: DateTime<Utc>) -> PersonObservation {
        PersonObservation {
            id: id.to_string(),
            features: json!({"helmet": "white"}),
            position: Some("scaffold".to_string()),
            action: Some("standing".to_string()),
            last_seen: at,
        }
    }

    #[test]
    fn test_two_hour_window() {
        let store = ReidStore::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        store.upsert_at(observation("p1", t), t);

        assert!(store.get_at("p1", t + Duration::minutes(119)).is_some());
        assert!(store.get_at("p1", t + Duration::minutes(121)).is_none());
        assert!(store.snapshot_at(t + Duration::minutes(121)).is_empty());
    }

    #[test]
    fn test_upsert_replaces_fields_and_refreshes_window() {
        let store = ReidStore::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        store.upsert_at(observation("p1", t), t);

        let later = t + Duration::minutes(90);
        let merged = store.upsert_at(
            PersonObservation {
                id: "p1".to_string(),
                features: serde_json::Value::Null,
                position: Some("gate".to_string()),
                action: None,
                last_seen: later,
            },
            later,
        );

        assert_eq!(merged.position.as_deref(), Some("gate"));
        // fields missing from the latest sighting are cleared
        assert_eq!(merged.action, None);
        assert!(merged.features.is_null());
        assert_eq!(merged.last_seen, later);

        // window restarts at the second upsert
        assert!(store.get_at("p1", t + Duration::minutes(200)).is_some());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let store = ReidStore::new();
        let now = Utc::now();
        for id in ["p3", "p1", "p2"] {
            store.upsert_at(observation(id, now), now);
        }
        let ids: Vec<_> = store.snapshot_at(now).into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_hydrate_keeps_creation_time() {
        let store = ReidStore::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let loaded = store.hydrate(vec![observation("p9", t).to_record(t)]);

        assert_eq!(loaded, 1);
        assert!(store.get_at("p9", t + Duration::minutes(60)).is_some());
        assert!(store.get_at("p9", t + Duration::minutes(130)).is_none());
    }

    #[test]
    fn test_from_report_requires_id() {
        let now = Utc::now();
        let anonymous = ReportedPerson {
            id: Some("  ".to_string()),
            features: json!({}),
            position: None,
            action: None,
        };
        assert!(PersonObservation::from_report(&anonymous, now).is_none());

        let named = ReportedPerson {
            id: Some("w-4".to_string()),
            ..anonymous
        };
        assert_eq!(PersonObservation::from_report(&named, now).unwrap().id, "w-4");
    }
}
