use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::MutexGuard;

use crate::lounge::{self, BindParams};
use crate::storage::{self, Storage};
use crate::transport::Transport;

/// Registry size; older devices fall off the end.
pub const MAX_DEVICES: usize = 20;

const DEVICES_KEY: &str = "devices";
const ACTIVE_SCREEN_KEY: &str = "active_screen_id";
const DEVICE_ID_KEY: &str = "device_id";
const LAST_AID_PREFIX: &str = "last_aid.";
const LEGACY_TOKEN_KEY: &str = "lounge_token";
const LEGACY_SCREEN_KEY: &str = "screen_id";
const LEGACY_NAME_KEY: &str = "screen_name";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A paired screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub screen_id: String,
    pub lounge_token: String,
    pub name: String,
}

impl Device {
    /// Same screen if either the token or the screen id matches.
    pub fn same_as(&self, other: &Device) -> bool {
        self.lounge_token == other.lounge_token || self.screen_id == other.screen_id
    }
}

/// A live bind-channel session. Only ever held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub lounge_token: String,
    pub screen_id: String,
    pub remote_id: String,
    pub sid: String,
    pub gsession_id: Option<String>,
    /// Next unused message id on this channel.
    pub aid: i64,
    pub cpn: String,
}

impl Session {
    /// Same channel, regardless of how far its cursor has moved.
    pub fn is_same(&self, other: &Session) -> bool {
        self.sid == other.sid && self.lounge_token == other.lounge_token
    }
}

// ---------------------------------------------------------------------------
// Durable registry
// ---------------------------------------------------------------------------

/// Persistent side of the session state: paired devices, the active
/// selection, the local device id and per-screen sequence baselines.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Paired devices, most recently used first.
    pub fn devices(&self) -> Vec<Device> {
        if let Some(stored) = self.storage.get_string(DEVICES_KEY).filter(|s| !s.trim().is_empty()) {
            return serde_json::from_str(&stored).unwrap_or_else(|e| {
                tracing::warn!("[store] discarding unreadable device list: {e}");
                Vec::new()
            });
        }
        self.migrate_legacy()
    }

    /// Older builds stored exactly one device under separate keys.
    fn migrate_legacy(&self) -> Vec<Device> {
        let token = self.storage.get_string(LEGACY_TOKEN_KEY).unwrap_or_default();
        let screen_id = self.storage.get_string(LEGACY_SCREEN_KEY).unwrap_or_default();
        if token.trim().is_empty() || screen_id.trim().is_empty() {
            return Vec::new();
        }

        let name = self
            .storage
            .get_string(LEGACY_NAME_KEY)
            .unwrap_or_else(|| screen_id.clone());
        let devices = vec![Device {
            screen_id,
            lounge_token: token,
            name,
        }];

        match self.write_devices(&devices) {
            Ok(()) => {
                tracing::info!("[store] migrated legacy single-device record");
                self.remove_legacy();
            }
            Err(e) => tracing::warn!("[store] legacy migration not persisted: {e}"),
        }
        devices
    }

    fn remove_legacy(&self) {
        for key in [LEGACY_TOKEN_KEY, LEGACY_SCREEN_KEY, LEGACY_NAME_KEY] {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!("[store] failed to remove {key}: {e}");
            }
        }
    }

    fn write_devices(&self, devices: &[Device]) -> storage::Result<()> {
        let encoded = serde_json::to_string(devices)?;
        self.storage.set_string(DEVICES_KEY, &encoded)
    }

    /// Insert at the front, replacing any entry with the same identity.
    pub fn save_device(&self, device: &Device) -> storage::Result<()> {
        let mut devices = self.devices();
        devices.retain(|d| !d.same_as(device));
        devices.insert(0, device.clone());
        devices.truncate(MAX_DEVICES);
        self.write_devices(&devices)
    }

    /// Returns whether anything was removed.
    pub fn remove_device(&self, device: &Device) -> storage::Result<bool> {
        let mut devices = self.devices();
        let before = devices.len();
        devices.retain(|d| !d.same_as(device));
        if devices.len() == before {
            return Ok(false);
        }
        self.write_devices(&devices)?;
        Ok(true)
    }

    pub fn active_screen_id(&self) -> Option<String> {
        self.storage
            .get_string(ACTIVE_SCREEN_KEY)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn current_device(&self) -> Option<Device> {
        let active = self.active_screen_id()?;
        self.devices().into_iter().find(|d| d.screen_id == active)
    }

    /// Move `device` to the front and select it.
    pub fn set_active(&self, device: &Device) -> storage::Result<()> {
        self.save_device(device)?;
        self.storage.set_string(ACTIVE_SCREEN_KEY, &device.screen_id)
    }

    pub fn clear_active(&self) -> storage::Result<()> {
        self.storage.remove(ACTIVE_SCREEN_KEY)
    }

    /// Forget every paired device and baseline. The local device id stays.
    pub fn wipe(&self) -> storage::Result<()> {
        for device in self.devices() {
            self.storage.remove(&last_aid_key(&device.screen_id))?;
        }
        for key in [DEVICES_KEY, ACTIVE_SCREEN_KEY, LEGACY_TOKEN_KEY, LEGACY_SCREEN_KEY, LEGACY_NAME_KEY] {
            self.storage.remove(key)?;
        }
        Ok(())
    }

    /// `wipe` plus the local device id.
    pub fn wipe_all(&self) -> storage::Result<()> {
        self.wipe()?;
        self.storage.remove(DEVICE_ID_KEY)
    }

    /// Locally generated identity of this sender, created on first use.
    pub fn device_id(&self) -> storage::Result<String> {
        if let Some(existing) = self.storage.get_string(DEVICE_ID_KEY).filter(|s| !s.trim().is_empty()) {
            return Ok(existing);
        }
        let fresh = uuid::Uuid::new_v4().to_string();
        self.storage.set_string(DEVICE_ID_KEY, &fresh)?;
        Ok(fresh)
    }

    /// The device id as sent on the wire (`id=`), without dashes.
    pub fn remote_id(&self) -> storage::Result<String> {
        Ok(self.device_id()?.replace('-', ""))
    }

    pub fn last_aid(&self, screen_id: &str) -> i64 {
        self.storage.get_int(&last_aid_key(screen_id)).unwrap_or(0)
    }

    pub fn save_last_aid(&self, screen_id: &str, aid: i64) {
        if let Err(e) = self.storage.set_int(&last_aid_key(screen_id), aid) {
            tracing::warn!("[store] failed to persist sequence baseline {aid}: {e}");
        }
    }

    /// Persist `aid` for `screen_id` unless the stored baseline is already
    /// at or past it.
    pub fn raise_last_aid(&self, screen_id: &str, aid: i64) {
        if aid > self.last_aid(screen_id) {
            self.save_last_aid(screen_id, aid);
        }
    }
}

fn last_aid_key(screen_id: &str) -> String {
    format!("{LAST_AID_PREFIX}{screen_id}")
}

// ---------------------------------------------------------------------------
// In-memory session owner
// ---------------------------------------------------------------------------

/// Owns the single live session of a client and its sequence cursor.
///
/// Anything that assigns message ids holds [`SessionManager::lock`] for the
/// whole request. The cursor itself only moves forward through
/// [`SessionManager::merge_sequence`], so the streaming reader can merge
/// what it observes without taking the lock. Storage is written on commit
/// and on [`SessionManager::checkpoint`], not per merged id.
pub struct SessionManager {
    store: SessionStore,
    current: Mutex<Option<Session>>,
    last_aid: AtomicI64,
    dispatch_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        let baseline = store
            .current_device()
            .map(|d| store.last_aid(&d.screen_id))
            .unwrap_or(0);
        Self {
            store,
            current: Mutex::new(None),
            last_aid: AtomicI64::new(baseline),
            dispatch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Exclusive right to assign sequence ids.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock.lock().await
    }

    pub fn current(&self) -> Option<Session> {
        self.slot().clone()
    }

    /// Last sequence id known locally, live session or not.
    pub fn local_aid(&self) -> i64 {
        self.last_aid.load(Ordering::SeqCst)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached session for `device`, handshaking if there is none.
    /// Callers hold [`SessionManager::lock`].
    pub async fn get_or_create(
        &self,
        transport: &dyn Transport,
        bind: &BindParams,
        device: &Device,
        remote_id: &str,
    ) -> lounge::Result<Session> {
        if let Some(session) = self.current() {
            if session.lounge_token == device.lounge_token {
                return Ok(session);
            }
        }
        self.handshake(transport, bind, device, remote_id).await
    }

    /// Always runs a fresh handshake and installs the result.
    pub async fn handshake(
        &self,
        transport: &dyn Transport,
        bind: &BindParams,
        device: &Device,
        remote_id: &str,
    ) -> lounge::Result<Session> {
        let known = self.local_aid().max(self.store.last_aid(&device.screen_id));
        let session = lounge::handshake(transport, bind, device, remote_id, known).await?;
        let mut slot = self.slot();
        self.last_aid.fetch_max(session.aid, Ordering::SeqCst);
        self.store.save_last_aid(&session.screen_id, session.aid);
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Advance the cursor of `session` to at least `seen`. Never moves
    /// backwards and does not touch storage.
    ///
    /// Ids observed on a session that is no longer the live one only raise
    /// that session's own screen baseline. Returns the live cursor, or
    /// `None` if `session` was stale.
    pub fn merge_sequence(&self, session: &Session, seen: i64) -> Option<i64> {
        let mut slot = self.slot();
        if let Some(live) = slot.as_mut().filter(|live| live.is_same(session)) {
            let merged = self.last_aid.fetch_max(seen, Ordering::SeqCst).max(seen);
            live.aid = live.aid.max(merged);
            return Some(merged);
        }
        drop(slot);

        tracing::debug!("[session] id {seen} from a replaced session on {}", session.screen_id);
        self.store.raise_last_aid(&session.screen_id, seen);
        None
    }

    /// Record that `count` ids starting at `session.aid` were accepted, and
    /// persist the result.
    pub fn commit(&self, session: &Session, count: usize) -> i64 {
        let accepted = session.aid + count as i64;
        match self.merge_sequence(session, accepted) {
            Some(merged) => {
                self.checkpoint();
                merged
            }
            None => accepted,
        }
    }

    /// Persist the live session's cursor as its screen's baseline.
    pub fn checkpoint(&self) {
        let slot = self.slot();
        if let Some(live) = slot.as_ref() {
            self.store.raise_last_aid(&live.screen_id, live.aid);
        }
    }

    /// Drop the session and fall back to `device`'s durable baseline.
    pub fn invalidate(&self, device: &Device) {
        let mut slot = self.slot();
        *slot = None;
        let baseline = self.store.last_aid(&device.screen_id);
        self.last_aid.store(baseline, Ordering::SeqCst);
        tracing::debug!("[session] invalidated, baseline={baseline} screen={}", device.screen_id);
    }

    /// Drop the session if it belongs to a different device.
    pub fn drop_if_stale(&self, device: &Device) {
        let stale = self
            .slot()
            .as_ref()
            .is_some_and(|s| s.lounge_token != device.lounge_token);
        if stale {
            tracing::info!("[session] active device changed, dropping session");
            self.invalidate(device);
        }
    }

    /// Drop the session without touching the cursor.
    pub fn drop_session(&self) {
        *self.slot() = None;
    }

    /// Pairing data was wiped: nothing survives.
    pub fn reset(&self) {
        *self.slot() = None;
        self.last_aid.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn device(n: usize) -> Device {
        Device {
            screen_id: format!("screen-{n}"),
            lounge_token: format!("token-{n}"),
            name: format!("TV {n}"),
        }
    }

    fn store() -> (Arc<MemoryStorage>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone(), SessionStore::new(storage))
    }

    fn session_for(d: &Device, aid: i64) -> Session {
        Session {
            lounge_token: d.lounge_token.clone(),
            screen_id: d.screen_id.clone(),
            remote_id: "remote".into(),
            sid: "SID".into(),
            gsession_id: None,
            aid,
            cpn: "cpn".into(),
        }
    }

    #[test]
    fn registry_dedupes_and_caps() {
        let (_, store) = store();
        for n in 0..25 {
            store.save_device(&device(n)).unwrap();
        }
        let devices = store.devices();
        assert_eq!(devices.len(), MAX_DEVICES);
        assert_eq!(devices[0], device(24));

        // Same screen id with a refreshed token replaces the old entry.
        let refreshed = Device {
            lounge_token: "new-token".into(),
            ..device(10)
        };
        store.save_device(&refreshed).unwrap();
        let devices = store.devices();
        assert_eq!(devices.len(), MAX_DEVICES);
        assert_eq!(devices[0], refreshed);
        assert_eq!(devices.iter().filter(|d| d.screen_id == "screen-10").count(), 1);
    }

    #[test]
    fn remove_matches_token_or_screen() {
        let (_, store) = store();
        store.save_device(&device(1)).unwrap();
        store.save_device(&device(2)).unwrap();

        let by_token = Device {
            screen_id: "other".into(),
            ..device(1)
        };
        assert!(store.remove_device(&by_token).unwrap());
        assert!(!store.remove_device(&by_token).unwrap());
        assert_eq!(store.devices(), vec![device(2)]);
    }

    #[test]
    fn active_selection() {
        let (_, store) = store();
        assert_eq!(store.current_device(), None);
        store.save_device(&device(1)).unwrap();
        store.set_active(&device(2)).unwrap();
        assert_eq!(store.current_device(), Some(device(2)));
        assert_eq!(store.devices()[0], device(2));
        store.clear_active().unwrap();
        assert_eq!(store.current_device(), None);
    }

    #[test]
    fn migrates_legacy_single_device() {
        let (storage, store) = store();
        storage.set_string(LEGACY_TOKEN_KEY, "tok").unwrap();
        storage.set_string(LEGACY_SCREEN_KEY, "scr").unwrap();

        let devices = store.devices();
        assert_eq!(
            devices,
            vec![Device {
                screen_id: "scr".into(),
                lounge_token: "tok".into(),
                name: "scr".into(),
            }]
        );
        assert_eq!(storage.get_string(LEGACY_TOKEN_KEY), None);
        assert_eq!(store.devices(), devices);
    }

    #[test]
    fn device_id_is_stable_until_wipe_all() {
        let (_, store) = store();
        let id = store.device_id().unwrap();
        assert_eq!(store.device_id().unwrap(), id);
        assert!(!store.remote_id().unwrap().contains('-'));

        store.wipe().unwrap();
        assert_eq!(store.device_id().unwrap(), id);
        store.wipe_all().unwrap();
        assert_ne!(store.device_id().unwrap(), id);
    }

    #[test]
    fn wipe_resets_baselines() {
        let (_, store) = store();
        store.set_active(&device(1)).unwrap();
        store.save_last_aid("screen-1", 30);
        store.wipe().unwrap();
        assert_eq!(store.last_aid("screen-1"), 0);
        assert!(store.devices().is_empty());
    }

    #[test]
    fn merge_sequence_is_monotonic_and_checkpointed() {
        let (_, store) = store();
        store.set_active(&device(1)).unwrap();
        let manager = SessionManager::new(store.clone());
        let session = session_for(&device(1), 4);
        *manager.slot() = Some(session.clone());

        assert_eq!(manager.merge_sequence(&session, 9), Some(9));
        assert_eq!(manager.merge_sequence(&session, 3), Some(9));
        assert_eq!(manager.current().unwrap().aid, 9);
        assert_eq!(store.last_aid("screen-1"), 0);

        manager.checkpoint();
        assert_eq!(store.last_aid("screen-1"), 9);
    }

    #[test]
    fn replaced_session_only_raises_its_own_screen() {
        let (_, store) = store();
        store.set_active(&device(1)).unwrap();
        store.save_last_aid("screen-1", 50);
        let manager = SessionManager::new(store.clone());
        let old = session_for(&device(1), 50);
        *manager.slot() = Some(old.clone());

        store.set_active(&device(2)).unwrap();
        manager.invalidate(&device(2));
        assert_eq!(manager.commit(&old, 1), 51);
        assert_eq!(manager.merge_sequence(&old, 60), None);

        assert_eq!(manager.local_aid(), 0);
        assert_eq!(store.last_aid("screen-2"), 0);
        assert_eq!(store.last_aid("screen-1"), 60);
    }

    #[test]
    fn invalidate_restores_durable_baseline() {
        let (_, store) = store();
        store.set_active(&device(1)).unwrap();
        store.save_last_aid("screen-1", 12);
        store.save_last_aid("screen-2", 40);

        let manager = SessionManager::new(store.clone());
        assert_eq!(manager.local_aid(), 12);

        *manager.slot() = Some(session_for(&device(1), 12));
        manager.drop_if_stale(&device(1));
        assert!(manager.current().is_some());

        manager.drop_if_stale(&device(2));
        assert!(manager.current().is_none());
        assert_eq!(manager.local_aid(), 40);

        manager.reset();
        assert_eq!(manager.local_aid(), 0);
    }
}
