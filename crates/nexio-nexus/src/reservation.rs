//! Reservation management
//!
//! Each child opened for write registers the nexus key and acquires (or
//! verifies) the reservation. The device arbitrates; nothing here is shared
//! between processes. Preempting another holder happens only when the
//! operator named its key, either in the configuration the nexus is created
//! with or through an explicit preempt request. Children reopened or added
//! later are opened without a preempt key.

use nexio_common::{ReservationConfig, ReservationPolicy};
use nexio_device::{DeviceError, DeviceHandle, DeviceResult};
use serde::Serialize;
use tracing::{info, warn};

/// Reservation held on one child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReservationToken {
    /// Key registered by this nexus
    pub holder: u64,
    /// Device generation observed after acquiring
    pub generation: u32,
    pub policy: ReservationPolicy,
}

/// Register our key on `handle` and acquire the reservation.
///
/// Succeeds when nobody holds the reservation, when we already hold it, or
/// when the holder is the configured `preempt_key`. Any other holder is a
/// conflict.
pub(crate) async fn acquire(
    handle: &dyn DeviceHandle,
    config: &ReservationConfig,
) -> DeviceResult<ReservationToken> {
    let device = handle.device_name();
    handle.reservation_register(config.key).await?;

    let report = handle.reservation_report().await?;
    match report.holder {
        None => {
            handle
                .reservation_acquire(config.key, config.policy)
                .await?;
            info!(
                "{}: acquired {} reservation with key {:#x}",
                device, config.policy, config.key
            );
        }
        Some(holder) if holder == config.key => {
            if report.policy != Some(config.policy) {
                warn!(
                    "{}: already holding reservation with policy {:?}, wanted {}",
                    device, report.policy, config.policy
                );
            }
        }
        Some(holder) if Some(holder) == config.preempt_key => {
            handle
                .reservation_preempt(config.key, holder, config.policy)
                .await?;
            warn!(
                "{}: preempted reservation of {:#x} with key {:#x}",
                device, holder, config.key
            );
        }
        Some(holder) => {
            warn!(
                "{}: reservation held by {:#x}, refusing to take over",
                device, holder
            );
            return Err(DeviceError::ReservationConflict {
                device: device.to_string(),
                holder: Some(holder),
            });
        }
    }

    verify(handle, config).await
}

/// Check that we are the holder and return the current token
pub(crate) async fn verify(
    handle: &dyn DeviceHandle,
    config: &ReservationConfig,
) -> DeviceResult<ReservationToken> {
    let report = handle.reservation_report().await?;
    if report.holder != Some(config.key) || !report.registrants.contains(&config.key) {
        return Err(DeviceError::ReservationConflict {
            device: handle.device_name().to_string(),
            holder: report.holder,
        });
    }
    Ok(ReservationToken {
        holder: config.key,
        generation: report.generation,
        policy: report.policy.unwrap_or(config.policy),
    })
}

/// Operator-requested takeover from `victim`
pub(crate) async fn preempt(
    handle: &dyn DeviceHandle,
    config: &ReservationConfig,
    victim: u64,
) -> DeviceResult<ReservationToken> {
    handle.reservation_register(config.key).await?;
    handle
        .reservation_preempt(config.key, victim, config.policy)
        .await?;
    info!(
        "{}: preempted {:#x} on operator request",
        handle.device_name(),
        victim
    );
    verify(handle, config).await
}

/// Release our reservation and registration
pub(crate) async fn release(handle: &dyn DeviceHandle, key: u64) -> DeviceResult<()> {
    handle.reservation_release(key).await?;
    info!("{}: released reservation {:#x}", handle.device_name(), key);
    Ok(())
}
