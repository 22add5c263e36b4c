//! StateStore — redb-backed persistence for the Vigil engine.
//!
//! Provides typed operations over service records, incidents and the
//! notification dedup index. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "fault-injection")]
use std::sync::atomic::{AtomicBool, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    #[cfg(feature = "fault-injection")]
    unavailable: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            #[cfg(feature = "fault-injection")]
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent operation fail with `StateError::Unavailable`
    /// until switched back.
    #[cfg(feature = "fault-injection")]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StateResult<()> {
        #[cfg(feature = "fault-injection")]
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable);
        }
        Ok(())
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        txn.open_table(DEDUP).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Service records ────────────────────────────────────────────

    /// Get a service record by id.
    pub fn get_service(&self, service_id: &str) -> StateResult<Option<ServiceRecord>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        get_json(&table, service_id)
    }

    /// List all service records.
    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        scan_json(&table)
    }

    /// Return the stored record for a service, creating a fresh one if the
    /// service has never been seen.
    pub fn load_or_init_service(&self, service_id: &str, now: u64) -> StateResult<ServiceRecord> {
        self.check_available()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            match get_json::<ServiceRecord, _>(&table, service_id)? {
                Some(existing) => record = existing,
                None => {
                    let mut fresh = ServiceRecord::new(service_id, now);
                    fresh.version = 1;
                    let value = serde_json::to_vec(&fresh).map_err(map_err!(Serialize))?;
                    table
                        .insert(service_id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    debug!(service = %service_id, "service record created");
                    record = fresh;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Atomically persist one state-machine step.
    ///
    /// The stored record must still carry `record.version`; it is replaced
    /// by `record` with the version bumped. If `incident` is given it is
    /// written in the same transaction. For an incident that already exists
    /// only its lifecycle fields are taken from the argument; recovery
    /// attempts and notifications already stored are kept.
    ///
    /// Returns the record as stored.
    pub fn commit_transition(
        &self,
        record: &ServiceRecord,
        incident: Option<&Incident>,
    ) -> StateResult<ServiceRecord> {
        self.check_available()?;
        let key = record.service_id.as_str();
        let mut stored = record.clone();
        stored.version = record.version + 1;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let found = get_json::<ServiceRecord, _>(&services, key)?
                .map(|r| r.version)
                .unwrap_or(0);
            if found != record.version {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected: record.version,
                    found,
                });
            }
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            services
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;

            if let Some(incident) = incident {
                let mut incidents = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
                let merged = match get_json::<Incident, _>(&incidents, &incident.id)? {
                    Some(mut existing) => {
                        existing.closed_at = incident.closed_at;
                        existing.severity = incident.severity;
                        existing.state = incident.state;
                        existing.cause = incident.cause.clone();
                        existing
                    }
                    None => incident.clone(),
                };
                let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
                incidents
                    .insert(merged.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %key, version = stored.version, state = %stored.state, "transition committed");
        Ok(stored)
    }

    // ── Incidents ──────────────────────────────────────────────────

    /// Get an incident by id.
    pub fn get_incident(&self, incident_id: &str) -> StateResult<Option<Incident>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        get_json(&table, incident_id)
    }

    /// List all incidents, oldest first.
    pub fn list_incidents(&self) -> StateResult<Vec<Incident>> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
        let mut incidents: Vec<Incident> = scan_json(&table)?;
        incidents.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        Ok(incidents)
    }

    /// List every incident of one service, oldest first.
    pub fn list_incidents_for_service(&self, service_id: &str) -> StateResult<Vec<Incident>> {
        let mut incidents = self.list_incidents()?;
        incidents.retain(|i| i.service_id == service_id);
        Ok(incidents)
    }

    /// List incidents that are not yet resolved.
    pub fn open_incidents(&self) -> StateResult<Vec<Incident>> {
        let mut incidents = self.list_incidents()?;
        incidents.retain(Incident::is_open);
        Ok(incidents)
    }

    /// Append a recovery attempt to its incident.
    ///
    /// Attempts are never rewritten. A set that runs again under the same
    /// attempt number adds its own rows after the earlier ones.
    pub fn append_recovery_attempt(&self, attempt: &RecoveryAttempt) -> StateResult<()> {
        self.check_available()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
            let mut incident = get_json::<Incident, _>(&table, &attempt.incident_id)?
                .ok_or_else(|| StateError::NotFound(attempt.incident_id.clone()))?;
            incident.attempts.push(attempt.clone());
            let value = serde_json::to_vec(&incident).map_err(map_err!(Serialize))?;
            table
                .insert(incident.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Notifications ──────────────────────────────────────────────

    /// Record a notification unless its dedup key is already taken.
    ///
    /// Check and insert happen in one write transaction. Returns `false`
    /// when the notification is a duplicate and must not be sent.
    pub fn record_notification(&self, record: &NotificationRecord) -> StateResult<bool> {
        self.check_available()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let recorded;
        {
            let mut dedup = txn.open_table(DEDUP).map_err(map_err!(Table))?;
            let taken = dedup
                .get(record.dedup_key.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if taken {
                recorded = false;
            } else {
                let mut incidents = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
                let mut incident = get_json::<Incident, _>(&incidents, &record.incident_id)?
                    .ok_or_else(|| StateError::NotFound(record.incident_id.clone()))?;
                incident.notifications.push(record.clone());
                let value = serde_json::to_vec(&incident).map_err(map_err!(Serialize))?;
                incidents
                    .insert(incident.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                dedup
                    .insert(record.dedup_key.as_str(), record.incident_id.as_str())
                    .map_err(map_err!(Write))?;
                recorded = true;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %record.dedup_key, recorded, "notification recorded");
        Ok(recorded)
    }

    /// Whether a notification with this dedup key exists.
    pub fn has_notification(&self, dedup_key: &str) -> StateResult<bool> {
        self.check_available()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEDUP).map_err(map_err!(Table))?;
        Ok(table.get(dedup_key).map_err(map_err!(Read))?.is_some())
    }

    /// Update the delivery marker of a recorded notification.
    pub fn set_delivery(
        &self,
        incident_id: &str,
        dedup_key: &str,
        delivery: DeliveryState,
    ) -> StateResult<()> {
        self.check_available()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INCIDENTS).map_err(map_err!(Table))?;
            let mut incident = get_json::<Incident, _>(&table, incident_id)?
                .ok_or_else(|| StateError::NotFound(incident_id.to_string()))?;
            let note = incident
                .notifications
                .iter_mut()
                .find(|n| n.dedup_key == dedup_key)
                .ok_or_else(|| StateError::NotFound(dedup_key.to_string()))?;
            note.delivery = delivery;
            let value = serde_json::to_vec(&incident).map_err(map_err!(Serialize))?;
            table
                .insert(incident_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Notifications persisted but never confirmed sent (crash between
    /// write and send).
    pub fn pending_notifications(&self) -> StateResult<Vec<NotificationRecord>> {
        Ok(self
            .list_incidents()?
            .into_iter()
            .flat_map(|i| i.notifications)
            .filter(|n| n.delivery == DeliveryState::Pending)
            .collect())
    }
}

/// Read and decode one JSON value from a table.
fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every value of a table.
fn scan_json<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_incident(store: &StateStore, service: &str) -> (ServiceRecord, Incident) {
        let mut record = store.load_or_init_service(service, 1000).unwrap();
        let id = record.next_incident_id();
        let incident = Incident::open(
            id.clone(),
            service,
            Severity::Major,
            "connection refused",
            IncidentSource::Probe,
            1000,
        );
        record.state = ServiceState::Unhealthy;
        record.open_incident = Some(id);
        let record = store.commit_transition(&record, Some(&incident)).unwrap();
        (record, incident)
    }

    fn notification(incident_id: &str, kind: NotificationKind) -> NotificationRecord {
        NotificationRecord {
            incident_id: incident_id.to_string(),
            dedup_key: dedup_key(incident_id, Severity::Major, kind),
            kind,
            severity: Severity::Major,
            channel: "ops".to_string(),
            sent_at: 1000,
            delivery: DeliveryState::Pending,
        }
    }

    fn attempt(incident_id: &str, number: u32, action: &str) -> RecoveryAttempt {
        RecoveryAttempt {
            incident_id: incident_id.to_string(),
            attempt_number: number,
            action: action.to_string(),
            started_at: 1000,
            finished_at: 1200,
            outcome: ActionOutcome::failure("exit status 1"),
        }
    }

    // ── Service records ────────────────────────────────────────────

    #[test]
    fn load_or_init_creates_healthy_record() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.load_or_init_service("api", 1000).unwrap();

        assert_eq!(record.state, ServiceState::Healthy);
        assert_eq!(record.version, 1);
        assert_eq!(store.get_service("api").unwrap(), Some(record.clone()));

        // Second call returns the stored record, not a fresh one.
        assert_eq!(store.load_or_init_service("api", 5000).unwrap(), record);
    }

    #[test]
    fn commit_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = store.load_or_init_service("api", 1000).unwrap();
        record.consecutive_failures = 1;
        record.state = ServiceState::Degraded;

        let stored = store.commit_transition(&record, None).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(store.get_service("api").unwrap().unwrap().state, ServiceState::Degraded);
    }

    #[test]
    fn commit_rejects_stale_version() {
        let store = StateStore::open_in_memory().unwrap();
        let record = store.load_or_init_service("api", 1000).unwrap();
        store.commit_transition(&record, None).unwrap();

        // Same (now stale) version again.
        let err = store.commit_transition(&record, None).unwrap_err();
        assert!(matches!(err, StateError::Conflict { expected: 1, found: 2, .. }));
        assert!(!err.is_persistence_failure());
    }

    #[test]
    fn commit_writes_record_and_incident_together() {
        let store = StateStore::open_in_memory().unwrap();
        let (record, incident) = open_incident(&store, "api");

        assert_eq!(record.open_incident.as_deref(), Some("api-00001"));
        assert_eq!(store.get_incident("api-00001").unwrap(), Some(incident));
    }

    #[test]
    fn commit_keeps_appended_attempts_and_notifications() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut record, mut incident) = open_incident(&store, "api");

        store.append_recovery_attempt(&attempt(&incident.id, 1, "restart")).unwrap();
        store
            .record_notification(&notification(&incident.id, NotificationKind::Opened))
            .unwrap();

        // The pipeline's copy predates both appends.
        incident.state = IncidentState::Escalated;
        incident.severity = Severity::Critical;
        record.state = ServiceState::Escalated;
        store.commit_transition(&record, Some(&incident)).unwrap();

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.state, IncidentState::Escalated);
        assert_eq!(stored.severity, Severity::Critical);
        assert_eq!(stored.attempts.len(), 1);
        assert_eq!(stored.notifications.len(), 1);
    }

    // ── Incidents ──────────────────────────────────────────────────

    #[test]
    fn incidents_for_service_do_not_match_prefixes() {
        let store = StateStore::open_in_memory().unwrap();
        open_incident(&store, "api");
        open_incident(&store, "api-gw");

        let api = store.list_incidents_for_service("api").unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].service_id, "api");
        assert_eq!(store.open_incidents().unwrap().len(), 2);
    }

    #[test]
    fn attempts_are_append_only() {
        let store = StateStore::open_in_memory().unwrap();
        let (_, incident) = open_incident(&store, "api");

        store.append_recovery_attempt(&attempt(&incident.id, 1, "flush")).unwrap();
        store.append_recovery_attempt(&attempt(&incident.id, 1, "restart")).unwrap();
        // Set 1 runs again after an abandoned run.
        store.append_recovery_attempt(&attempt(&incident.id, 1, "flush")).unwrap();
        store.append_recovery_attempt(&attempt(&incident.id, 2, "flush")).unwrap();

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        let rows: Vec<(u32, &str)> = stored
            .attempts
            .iter()
            .map(|a| (a.attempt_number, a.action.as_str()))
            .collect();
        assert_eq!(rows, vec![(1, "flush"), (1, "restart"), (1, "flush"), (2, "flush")]);
    }

    #[test]
    fn attempt_for_unknown_incident_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.append_recovery_attempt(&attempt("ghost-00001", 1, "x")).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    // ── Notifications ──────────────────────────────────────────────

    #[test]
    fn notification_dedup() {
        let store = StateStore::open_in_memory().unwrap();
        let (_, incident) = open_incident(&store, "api");
        let note = notification(&incident.id, NotificationKind::Opened);

        assert!(store.record_notification(&note).unwrap());
        assert!(!store.record_notification(&note).unwrap());
        assert!(store.has_notification(&note.dedup_key).unwrap());

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.notifications.len(), 1);
    }

    #[test]
    fn delivery_marker_and_pending_scan() {
        let store = StateStore::open_in_memory().unwrap();
        let (_, incident) = open_incident(&store, "api");
        let opened = notification(&incident.id, NotificationKind::Opened);
        let resolved = notification(&incident.id, NotificationKind::Resolved);
        store.record_notification(&opened).unwrap();
        store.record_notification(&resolved).unwrap();

        store
            .set_delivery(&incident.id, &opened.dedup_key, DeliveryState::Delivered)
            .unwrap();

        let pending = store.pending_notifications().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, NotificationKind::Resolved);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vigil.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let (_, incident) = open_incident(&store, "api");
            store
                .record_notification(&notification(&incident.id, NotificationKind::Opened))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_service("api").unwrap().unwrap();
        assert_eq!(record.state, ServiceState::Unhealthy);
        assert_eq!(record.incident_seq, 1);
        let incident = store.get_incident("api-00001").unwrap().unwrap();
        assert_eq!(incident.notifications.len(), 1);
        assert!(store.has_notification(&incident.notifications[0].dedup_key).unwrap());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_services().unwrap().is_empty());
        assert!(store.list_incidents().unwrap().is_empty());
        assert!(store.pending_notifications().unwrap().is_empty());
        assert!(store.get_service("nope").unwrap().is_none());
        assert!(store.get_incident("nope").unwrap().is_none());
        assert!(!store.has_notification("nope").unwrap());
    }
}
