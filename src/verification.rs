//! Binding a messaging account to a guest through one-time codes.
//!
//! A guest identified by phone and email asks for a code; the code is then
//! sent back from the messaging account that should own the guest's
//! reservations. Approval is the only way a guest gains a messaging id.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::booking::{BookingError, validate_contact};
use crate::model::{ContactInfo, Guest, Verification};
use crate::store::GuestDirectory;

pub const CODE_LEN: usize = 6;

pub struct VerificationService {
    guests: Arc<dyn GuestDirectory>,
    ttl: Duration,
}

impl VerificationService {
    pub fn new(guests: Arc<dyn GuestDirectory>, ttl: Duration) -> Self {
        Self { guests, ttl }
    }

    /// Issue a code for the guest behind `contact`, creating the guest if
    /// needed. The code expires after the configured TTL.
    pub async fn generate(
        &self,
        contact: &ContactInfo,
        cancel: &CancellationToken,
    ) -> Result<Verification, BookingError> {
        validate_contact(contact)?;
        if cancel.is_cancelled() {
            return Err(BookingError::Cancelled);
        }
        let verification = self
            .guests
            .issue_verification(contact, Utc::now() + self.ttl)
            .await?;
        tracing::info!(
            guest_id = %verification.guest_id,
            expires_at = %verification.expires_at,
            "verification code issued"
        );
        Ok(verification)
    }

    /// Bind `messaging_id` to the guest the code was issued for.
    pub async fn approve(
        &self,
        code: &str,
        messaging_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Guest, BookingError> {
        if code.len() != CODE_LEN || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(BookingError::InvalidRequest(format!(
                "verification code must be {CODE_LEN} digits"
            )));
        }
        if cancel.is_cancelled() {
            return Err(BookingError::Cancelled);
        }
        match self.guests.approve_verification(code, messaging_id, Utc::now()).await {
            Ok(guest) => {
                tracing::info!(guest_id = %guest.id, messaging_id, "messaging account bound");
                Ok(guest)
            }
            Err(e) => {
                tracing::warn!(messaging_id, error = %e, "verification rejected");
                Err(e.into())
            }
        }
    }
}
