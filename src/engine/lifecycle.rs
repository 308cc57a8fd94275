//! Booking state machine. Callers hold the booking's lock.

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Only PENDING bookings take decisions; every other status is absorbing here.
pub(crate) fn check_transition(current: BookingStatus, decision: Decision) -> Result<(), EngineError> {
    match current {
        BookingStatus::Pending => Ok(()),
        BookingStatus::Approved
        | BookingStatus::Rejected
        | BookingStatus::Cancelled
        | BookingStatus::Completed => Err(EngineError::InvalidTransition {
            from: current,
            to: decision.target(),
        }),
    }
}

/// Stamp a decision onto a booking already checked by `check_transition`.
pub(crate) fn apply_decision(
    booking: &mut Booking,
    decision: Decision,
    actor: Actor,
    comments: Option<String>,
    at: Ms,
) {
    booking.status = decision.target();
    booking.processed_by = Some(actor);
    booking.updated_on = Some(at);
    match decision {
        Decision::Approve => booking.approved_on = Some(at),
        Decision::Reject => booking.rejected_on = Some(at),
    }
    booking.admin_comments = comments;
}

pub(crate) fn validate_intake(intake: &NewBooking) -> Result<(), EngineError> {
    let fields = [
        intake.customer.full_name.as_str(),
        intake.customer.email.as_str(),
        intake.customer.mobile_number.as_str(),
        intake.address.address_line.as_str(),
        intake.address.pincode.as_str(),
        intake.address.city.as_str(),
        intake.address.landmark.as_deref().unwrap_or_default(),
        intake.address.state.as_str(),
        intake.product.id.as_str(),
        intake.product.name.as_str(),
        intake.product.brand.as_str(),
    ];
    if fields.iter().any(|f| f.len() > MAX_FIELD_LEN) {
        return Err(EngineError::LimitExceeded("booking field too long"));
    }
    if !intake.time_slot.is_valid() {
        return Err(EngineError::InvalidRange(format!(
            "time slot {} does not end after it starts",
            intake.time_slot
        )));
    }
    Ok(())
}
