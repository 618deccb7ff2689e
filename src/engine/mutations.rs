use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedRwLockReadGuard, oneshot};
use ulid::Ulid;

use crate::lifecycle;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_window};
use super::{Engine, StoreError, WalCommand};

fn check_name(name: &str, what: &'static str) -> Result<(), StoreError> {
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded(what));
    }
    Ok(())
}

fn check_price(price: i64, what: &'static str) -> Result<(), StoreError> {
    if !(0..=MAX_PRICE).contains(&price) {
        return Err(StoreError::LimitExceeded(what));
    }
    Ok(())
}

fn check_house(house: &House) -> Result<(), StoreError> {
    check_name(&house.name, "house name too long")?;
    check_price(house.base_price, "house price out of range")
}

fn check_extra(extra: &Extra) -> Result<(), StoreError> {
    check_name(&extra.name, "extra name too long")?;
    check_price(extra.price, "extra price out of range")
}

fn check_facility(facility: &Facility) -> Result<(), StoreError> {
    check_name(&facility.name, "facility name too long")?;
    check_price(facility.price, "facility price out of range")?;
    for option in &facility.fill_options {
        check_name(&option.name, "fill option name too long")?;
        check_price(option.price, "fill option price out of range")?;
    }
    Ok(())
}

fn check_contact(contact: &ContactInfo) -> Result<(), StoreError> {
    check_name(&contact.name, "guest name too long")?;
    if contact.email.len() > MAX_CONTACT_LEN || contact.phone.len() > MAX_CONTACT_LEN {
        return Err(StoreError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn register_house(&self, house: House) -> Result<(), StoreError> {
        check_house(&house)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.houses.len() >= MAX_HOUSES {
            return Err(StoreError::LimitExceeded("too many houses"));
        }
        if self.houses.contains_key(&house.id) {
            return Err(StoreError::AlreadyExists(format!("house {}", house.id)));
        }
        self.persist_global(&Event::HouseRegistered { house }).await
    }

    /// Replace a house's catalog entry. Stored reservations keep the total
    /// they were booked at.
    pub async fn update_house(&self, house: House) -> Result<(), StoreError> {
        check_house(&house)?;
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.lock_house(house.id).await?;
        let event = Event::HouseUpdated { house };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a house and its blackouts. Refused while any reservation, past
    /// or cancelled ones included, still references it.
    pub async fn remove_house(&self, id: HouseId) -> Result<(), StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.lock_house(id).await?;
        if !guard.reservations.is_empty() {
            return Err(StoreError::HouseInUse(id));
        }
        let blackouts = guard.intervals.iter().map(|i| i.id).collect();
        self.persist_global(&Event::HouseRemoved { id, blackouts }).await?;
        guard.removed = true;
        Ok(())
    }

    pub async fn register_extra(&self, extra: Extra) -> Result<(), StoreError> {
        check_extra(&extra)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.extras.contains_key(&extra.id) {
            return Err(StoreError::AlreadyExists(format!("extra {}", extra.id)));
        }
        self.persist_global(&Event::ExtraRegistered { extra }).await
    }

    pub async fn update_extra(&self, extra: Extra) -> Result<(), StoreError> {
        check_extra(&extra)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.extras.contains_key(&extra.id) {
            return Err(StoreError::ExtraNotFound(extra.id));
        }
        self.persist_global(&Event::ExtraUpdated { extra }).await
    }

    pub async fn remove_extra(&self, id: ExtraId) -> Result<(), StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.extras.contains_key(&id) {
            return Err(StoreError::ExtraNotFound(id));
        }
        self.persist_global(&Event::ExtraRemoved { id }).await
    }

    fn missing_house(&self, facility: &Facility) -> Result<(), StoreError> {
        match facility.house_ids.iter().find(|h| !self.houses.contains_key(h)) {
            Some(missing) => Err(StoreError::HouseNotFound(*missing)),
            None => Ok(()),
        }
    }

    pub async fn register_facility(&self, facility: Facility) -> Result<(), StoreError> {
        check_facility(&facility)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.facilities.contains_key(&facility.id) {
            return Err(StoreError::AlreadyExists(format!("facility {}", facility.id)));
        }
        self.missing_house(&facility)?;
        self.persist_global(&Event::FacilityRegistered { facility }).await
    }

    pub async fn update_facility(&self, facility: Facility) -> Result<(), StoreError> {
        check_facility(&facility)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.facilities.contains_key(&facility.id) {
            return Err(StoreError::FacilityNotFound(facility.id));
        }
        self.missing_house(&facility)?;
        self.persist_global(&Event::FacilityUpdated { facility }).await
    }

    pub async fn remove_facility(&self, id: FacilityId) -> Result<(), StoreError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.facilities.contains_key(&id) {
            return Err(StoreError::FacilityNotFound(id));
        }
        self.persist_global(&Event::FacilityRemoved { id }).await
    }

    pub async fn add_blackout(
        &self,
        id: Ulid,
        house_id: HouseId,
        window: StayWindow,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        validate_window(&window)?;
        if let Some(ref r) = reason
            && r.len() > MAX_BLACKOUT_REASON_LEN
        {
            return Err(StoreError::LimitExceeded("blackout reason too long"));
        }
        let mut guard = self.lock_house(house_id).await?;
        if guard.intervals.len() >= MAX_INTERVALS_PER_HOUSE {
            return Err(StoreError::LimitExceeded("too many intervals on house"));
        }
        let event = Event::BlackoutAdded { id, house_id, window, reason };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<HouseId, StoreError> {
        let (house_id, mut guard) = self
            .lock_house_of(&id)
            .await
            .ok_or(StoreError::BlackoutNotFound(id))?;
        let is_blackout = guard
            .intervals
            .iter()
            .any(|i| i.id == id && matches!(i.kind, IntervalKind::Blackout { .. }));
        if !is_blackout {
            return Err(StoreError::BlackoutNotFound(id));
        }
        let event = Event::BlackoutRemoved { id, house_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(house_id)
    }

    // ── Guests ───────────────────────────────────────────────

    /// Return the guest matching the contact's dedupe key, creating one if
    /// none exists. Never touches the guest's messaging binding.
    pub async fn find_or_create_guest(&self, contact: &ContactInfo) -> Result<Guest, StoreError> {
        check_contact(contact)?;
        let _serial = self.guest_lock.lock().await;
        self.find_or_create_locked(contact).await
    }

    /// Caller holds `guest_lock`.
    async fn find_or_create_locked(&self, contact: &ContactInfo) -> Result<Guest, StoreError> {
        let key = contact.dedupe_key();
        let existing = self
            .guest_keys
            .get(&key)
            .and_then(|id| self.guests.get(id.value()).map(|g| g.clone()));
        if let Some(guest) = existing {
            return Ok(guest);
        }

        let guest = Guest {
            id: Ulid::new(),
            name: contact.name.trim().to_string(),
            email: contact.email.trim().to_string(),
            phone: contact.phone.trim().to_string(),
            messaging_id: None,
        };
        self.persist_global(&Event::GuestRegistered { guest: guest.clone() }).await?;
        Ok(guest)
    }

    /// Issue a six-digit code for the guest behind `contact`, valid until
    /// `expires_at`.
    pub async fn issue_verification(
        &self,
        contact: &ContactInfo,
        expires_at: DateTime<Utc>,
    ) -> Result<Verification, StoreError> {
        check_contact(contact)?;
        let _serial = self.guest_lock.lock().await;
        let guest = self.find_or_create_locked(contact).await?;
        let code = (0..32)
            .map(|_| format!("{:06}", Ulid::new().random() % 1_000_000))
            .find(|code| !self.verifications.contains_key(code))
            .ok_or(StoreError::LimitExceeded("no free verification code"))?;

        let verification = Verification { code, guest_id: guest.id, expires_at, approved: false };
        self.persist_global(&Event::VerificationIssued { verification: verification.clone() })
            .await?;
        Ok(verification)
    }

    /// Bind `messaging_id` to the guest a pending code was issued for. This
    /// is the only path that sets a guest's messaging account.
    pub async fn approve_verification(
        &self,
        code: &str,
        messaging_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Guest, StoreError> {
        let _serial = self.guest_lock.lock().await;
        let verification = self
            .verifications
            .get(code)
            .map(|v| v.clone())
            .ok_or(StoreError::VerificationNotFound)?;
        if verification.approved {
            return Err(StoreError::VerificationUsed);
        }
        if verification.is_expired(now) {
            return Err(StoreError::VerificationExpired);
        }
        let guest_id = verification.guest_id;
        let guest = self.get_guest(&guest_id).ok_or(StoreError::GuestNotFound(guest_id))?;
        if guest.messaging_id.is_some_and(|bound| bound != messaging_id) {
            return Err(StoreError::GuestAlreadyBound(guest_id));
        }

        let event = Event::VerificationApproved { code: verification.code, guest_id, messaging_id };
        self.persist_global(&event).await?;
        Ok(Guest { messaging_id: Some(messaging_id), ..guest })
    }

    // ── Reservations ─────────────────────────────────────────

    /// Persist a new reservation. The overlap check, the WAL append and the
    /// apply all run under the house write lock.
    pub async fn create_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        validate_window(&reservation.window)?;
        if !self.guests.contains_key(&reservation.guest_id) {
            return Err(StoreError::GuestNotFound(reservation.guest_id));
        }
        if self.entity_to_house.contains_key(&reservation.id) {
            return Err(StoreError::AlreadyExists(format!("reservation {}", reservation.id)));
        }
        let mut guard = self.lock_house(reservation.house_id).await?;
        if guard.intervals.len() >= MAX_INTERVALS_PER_HOUSE {
            return Err(StoreError::LimitExceeded("too many intervals on house"));
        }

        check_no_conflict(&guard, &reservation.window)?;

        let event = Event::ReservationCreated { reservation };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Cancel a reservation on behalf of `requester`. Guests may only cancel
    /// their own stays.
    pub async fn cancel(&self, id: Ulid, requester: Requester) -> Result<Reservation, StoreError> {
        let (house_id, mut guard) = self
            .lock_house_of(&id)
            .await
            .ok_or(StoreError::ReservationNotFound(id))?;
        let reservation = guard
            .reservations
            .get(&id)
            .ok_or(StoreError::ReservationNotFound(id))?;

        if let Requester::Guest { messaging_id } = requester {
            let owner = self
                .guests
                .get(&reservation.guest_id)
                .and_then(|g| g.messaging_id);
            if owner != Some(messaging_id) {
                return Err(StoreError::Forbidden(id));
            }
        }

        let status = lifecycle::cancel(reservation.status)?;
        let event = Event::StatusChanged { id, house_id, status, at: Utc::now() };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ReservationNotFound(id))
    }

    /// Compare-and-set status move: fails with `StaleStatus` when the stored
    /// status is no longer `change.from`.
    pub async fn update_status(&self, change: StatusChange) -> Result<(), StoreError> {
        let StatusChange { id, from, to } = change;
        let (house_id, mut guard) = self
            .lock_house_of(&id)
            .await
            .ok_or(StoreError::ReservationNotFound(id))?;
        let actual = guard
            .reservations
            .get(&id)
            .map(|r| r.status)
            .ok_or(StoreError::ReservationNotFound(id))?;
        if actual != from {
            return Err(StoreError::StaleStatus { id, expected: from, actual });
        }
        lifecycle::ensure_transition(from, to)?;

        let event = Event::StatusChanged { id, house_id, status: to, at: Utc::now() };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Apply each change independently; one failure never blocks the rest.
    pub async fn batch_update_status(
        &self,
        changes: Vec<StatusChange>,
    ) -> Vec<(Ulid, Result<(), StoreError>)> {
        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            let result = self.update_status(change).await;
            results.push((change.id, result));
        }
        results
    }

    /// Record that the check-in reminder went out. Idempotent.
    pub async fn mark_reminded(&self, id: Ulid) -> Result<(), StoreError> {
        let (house_id, mut guard) = self
            .lock_house_of(&id)
            .await
            .ok_or(StoreError::ReservationNotFound(id))?;
        let already = guard
            .reservations
            .get(&id)
            .map(|r| r.reminder_sent)
            .ok_or(StoreError::ReservationNotFound(id))?;
        if already {
            return Ok(());
        }
        let event = Event::ReminderSent { id, house_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Returns `false` when a house registered mid-compaction is busy; the next
    /// run picks it up.
    pub async fn compact_wal(&self) -> Result<bool, StoreError> {
        // House read locks first, then the gate: a mutation holding a house
        // write lock always gets its gate read before we ask for the write.
        let mut ids: Vec<HouseId> = self.houses.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        let mut guards: BTreeMap<HouseId, OwnedRwLockReadGuard<HouseState>> = BTreeMap::new();
        for id in ids {
            if let Some(hs) = self.get_house_state(&id) {
                guards.insert(id, hs.read_owned().await);
            }
        }

        let _gate = self.commit_gate.write().await;

        let late: Vec<HouseId> = self
            .houses
            .iter()
            .map(|e| *e.key())
            .filter(|id| !guards.contains_key(id))
            .collect();
        for id in late {
            let Some(hs) = self.get_house_state(&id) else { continue };
            match hs.try_read_owned() {
                Ok(guard) => {
                    guards.insert(id, guard);
                }
                Err(_) => return Ok(false),
            }
        }

        let now = Utc::now();
        let events = self.snapshot_events(&guards, now);
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;

        self.verifications.retain(|_, v| !v.approved && !v.is_expired(now));
        tracing::info!(events = count, "WAL compacted");
        Ok(true)
    }

    fn snapshot_events(
        &self,
        guards: &BTreeMap<HouseId, OwnedRwLockReadGuard<HouseState>>,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let live: Vec<_> = guards.iter().filter(|(_, g)| !g.removed).collect();

        for (_, guard) in &live {
            events.push(Event::HouseRegistered { house: guard.house.clone() });
        }

        let mut extras: Vec<Extra> = self.extras.iter().map(|e| e.value().clone()).collect();
        extras.sort_by_key(|e| e.id);
        events.extend(extras.into_iter().map(|extra| Event::ExtraRegistered { extra }));

        let mut facilities: Vec<Facility> =
            self.facilities.iter().map(|e| e.value().clone()).collect();
        facilities.sort_by_key(|f| f.id);
        events.extend(facilities.into_iter().map(|facility| Event::FacilityRegistered { facility }));

        let mut guests: Vec<Guest> = self.guests.iter().map(|e| e.value().clone()).collect();
        guests.sort_by_key(|g| g.id);
        events.extend(guests.into_iter().map(|guest| Event::GuestRegistered { guest }));

        let mut pending: Vec<Verification> = self
            .verifications
            .iter()
            .filter(|v| !v.approved && !v.is_expired(now))
            .map(|v| v.value().clone())
            .collect();
        pending.sort_by(|a, b| a.code.cmp(&b.code));
        events.extend(pending.into_iter().map(|verification| Event::VerificationIssued { verification }));

        for (house_id, guard) in live {
            for interval in &guard.intervals {
                if let IntervalKind::Blackout { reason } = &interval.kind {
                    events.push(Event::BlackoutAdded {
                        id: interval.id,
                        house_id: *house_id,
                        window: interval.window,
                        reason: reason.clone(),
                    });
                }
            }
            // Every stay, blocking or not, so history survives compaction.
            let mut stays: Vec<&Reservation> = guard.reservations.values().collect();
            stays.sort_by_key(|r| (r.window.check_in, r.id));
            events.extend(stays.into_iter().map(|r| Event::ReservationCreated { reservation: r.clone() }));
        }
        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
