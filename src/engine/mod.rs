mod conflict;
mod contracts;
mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedHouseState = Arc<RwLock<HouseState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes don't leak into
    // the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}

fn handle_control(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// WAL-backed reservation store: houses, catalog, guests and reservations.
///
/// Every house has its own lock; the overlap check, the WAL append and the
/// in-memory apply for a reservation all happen under that house's write
/// lock, so two conflicting bookings can never both commit.
pub struct Engine {
    pub(super) houses: DashMap<HouseId, SharedHouseState>,
    pub(super) extras: DashMap<ExtraId, Extra>,
    pub(super) facilities: DashMap<FacilityId, Facility>,
    pub(super) guests: DashMap<Ulid, Guest>,
    /// Code → verification. Approved and expired entries are dropped on compaction.
    pub(super) verifications: DashMap<String, Verification>,
    /// Dedupe key → guest id.
    pub(super) guest_keys: DashMap<String, Ulid>,
    /// Reservation / blackout id → house id.
    pub(super) entity_to_house: DashMap<Ulid, HouseId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so no append
    /// can slip between the snapshot and the file swap.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes guest find-or-create and verification so one contact never
    /// yields two guests and one code is approved at most once.
    pub(super) guest_lock: Mutex<()>,
    /// Serializes catalog edits. Taken before any house lock.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply a house-scoped event (caller holds the house write lock).
fn apply_to_house(hs: &mut HouseState, event: &Event, entity_map: &DashMap<Ulid, HouseId>) {
    match event {
        Event::BlackoutAdded { id, house_id, window, reason } => {
            hs.insert_interval(Interval {
                id: *id,
                window: *window,
                kind: IntervalKind::Blackout { reason: reason.clone() },
            });
            entity_map.insert(*id, *house_id);
        }
        Event::BlackoutRemoved { id, .. } => {
            hs.remove_interval(*id);
            entity_map.remove(id);
        }
        Event::ReservationCreated { reservation } => {
            if reservation.status.blocks_calendar() {
                hs.insert_interval(Interval {
                    id: reservation.id,
                    window: reservation.window,
                    kind: IntervalKind::Stay { status: reservation.status },
                });
            }
            hs.reservations.insert(reservation.id, reservation.clone());
            entity_map.insert(reservation.id, reservation.house_id);
        }
        Event::StatusChanged { id, status, at, .. } => {
            if let Some(r) = hs.reservations.get_mut(id) {
                r.status = *status;
                r.updated_at = *at;
            }
            hs.set_stay_status(*id, *status);
        }
        Event::ReminderSent { id, .. } => {
            if let Some(r) = hs.reservations.get_mut(id) {
                r.reminder_sent = true;
            }
        }
        Event::HouseUpdated { house } => {
            hs.house = house.clone();
        }
        // Catalog and guest events live outside house state.
        Event::HouseRegistered { .. }
        | Event::HouseRemoved { .. }
        | Event::ExtraRegistered { .. }
        | Event::ExtraUpdated { .. }
        | Event::ExtraRemoved { .. }
        | Event::FacilityRegistered { .. }
        | Event::FacilityUpdated { .. }
        | Event::FacilityRemoved { .. }
        | Event::GuestRegistered { .. }
        | Event::VerificationIssued { .. }
        | Event::VerificationApproved { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            houses: DashMap::new(),
            extras: DashMap::new(),
            facilities: DashMap::new(),
            guests: DashMap::new(),
            verifications: DashMap::new(),
            guest_keys: DashMap::new(),
            entity_to_house: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            guest_lock: Mutex::new(()),
            catalog_lock: Mutex::new(()),
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // blocking_write would panic here when called from async context.
        for event in &replay.records {
            engine.apply_global(event);
            if let Some(house_id) = event.house_id()
                && let Some(entry) = engine.houses.get(&house_id)
            {
                let shared = entry.clone();
                drop(entry);
                match shared.try_write() {
                    Ok(mut guard) => apply_to_house(&mut guard, event, &engine.entity_to_house),
                    Err(_) => {
                        return Err(io::Error::other("replay: house state unexpectedly locked"));
                    }
                }
            }
        }

        tracing::info!(
            path = %wal_path.display(),
            events = replay.records.len(),
            houses = engine.houses.len(),
            "engine state restored"
        );
        Ok(engine)
    }

    /// Apply catalog and guest events that are not guarded by a house lock.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::HouseRegistered { house } => {
                self.houses
                    .insert(house.id, Arc::new(RwLock::new(HouseState::new(house.clone()))));
            }
            Event::HouseRemoved { id, blackouts } => {
                self.houses.remove(id);
                for blackout in blackouts {
                    self.entity_to_house.remove(blackout);
                }
                for mut facility in self.facilities.iter_mut() {
                    facility.house_ids.retain(|h| h != id);
                }
            }
            Event::ExtraRegistered { extra } | Event::ExtraUpdated { extra } => {
                self.extras.insert(extra.id, extra.clone());
            }
            Event::ExtraRemoved { id } => {
                self.extras.remove(id);
            }
            Event::FacilityRegistered { facility } | Event::FacilityUpdated { facility } => {
                self.facilities.insert(facility.id, facility.clone());
            }
            Event::FacilityRemoved { id } => {
                self.facilities.remove(id);
            }
            Event::GuestRegistered { guest } => {
                self.guest_keys.insert(guest.dedupe_key(), guest.id);
                self.guests.insert(guest.id, guest.clone());
            }
            Event::VerificationIssued { verification } => {
                self.verifications.insert(verification.code.clone(), verification.clone());
            }
            Event::VerificationApproved { code, guest_id, messaging_id } => {
                if let Some(mut v) = self.verifications.get_mut(code) {
                    v.approved = true;
                }
                if let Some(mut guest) = self.guests.get_mut(guest_id) {
                    guest.messaging_id = Some(*messaging_id);
                }
            }
            _ => {}
        }
    }

    /// Hand an event to the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Durably append a catalog/guest event, then apply it.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.apply_global(event);
        Ok(())
    }

    /// Durably append a house-scoped event, then apply it under the held lock.
    ///
    /// Once the append is acknowledged the apply always runs; callers must drive
    /// this future to completion rather than racing it against a timeout.
    pub(super) async fn persist_and_apply(
        &self,
        hs: &mut HouseState,
        event: &Event,
    ) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        apply_to_house(hs, event, &self.entity_to_house);
        Ok(())
    }

    pub fn get_house_state(&self, id: &HouseId) -> Option<SharedHouseState> {
        self.houses.get(id).map(|e| e.value().clone())
    }

    pub fn house_for_entity(&self, entity_id: &Ulid) -> Option<HouseId> {
        self.entity_to_house.get(entity_id).map(|e| *e.value())
    }

    /// Take a house's write lock, failing if it is unknown or was removed
    /// while we waited.
    pub(super) async fn lock_house(
        &self,
        house_id: HouseId,
    ) -> Result<OwnedRwLockWriteGuard<HouseState>, StoreError> {
        let hs = self
            .get_house_state(&house_id)
            .ok_or(StoreError::HouseNotFound(house_id))?;
        let guard = hs.write_owned().await;
        if guard.removed {
            return Err(StoreError::HouseNotFound(house_id));
        }
        Ok(guard)
    }

    /// Look up a reservation/blackout's house and take its write lock.
    pub(super) async fn lock_house_of(
        &self,
        entity_id: &Ulid,
    ) -> Option<(HouseId, OwnedRwLockWriteGuard<HouseState>)> {
        let house_id = self.house_for_entity(entity_id)?;
        let guard = self.lock_house(house_id).await.ok()?;
        Some((house_id, guard))
    }
}
