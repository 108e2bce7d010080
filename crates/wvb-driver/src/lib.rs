//! Driver-side half of the wireless VR bridge's driver ↔ server IPC
//! contract (spec §4.7, §6.4).
//!
//! A real OpenVR driver DLL would link this crate and poll [`SharedState`]
//! plus the eight named events below from its device-thread callbacks. The
//! OpenVR driver-host glue itself, and the actual cross-process shared
//! memory primitive, are out of scope (spec §1) — [`wvb_core::ipc`]
//! supplies the in-process stand-in this crate builds the contract on.

use std::sync::Arc;
use std::time::Duration;

use wvb_core::ipc::{NamedEvent, SharedRegion};
use wvb_core::telemetry::{MeasurementWindow, TrackingTimeMeasurement};
use wvb_core::types::{PresentInfo, TrackingState, VrSystemSpecs};
use wvb_core::vrcp::server::ServerState;

/// Driver-observed lifecycle state, written by the driver, read by the
/// server (mirrors [`ServerState`]'s role but from the other side of the
/// boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Inactive,
    Active,
    Presenting,
}

/// Upper bound on the driver-side bounded measurement arrays (spec §4.7
/// "bounded arrays of driver-side measurements"), matching the timing-phase
/// capacity used by the client-side measurement bucket.
pub const DRIVER_MEASUREMENT_CAPACITY: usize = 2000;

/// Everything the shared-memory region holds (spec §4.7). One writer per
/// field: the driver writes `driver_state` and `latest_present_info`; the
/// server writes everything else.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    pub server_state: Option<ServerState>,
    pub driver_state: DriverState,
    pub ntp_epoch: u64,
    pub vr_system_specs: Option<VrSystemSpecs>,
    pub latest_present_info: Option<PresentInfo>,
    pub tracking_state: Option<TrackingState>,
    pub measurement_window: Option<MeasurementWindow>,
    pub tracking_measurements: Vec<TrackingTimeMeasurement>,
}

impl SharedState {
    /// Append a driver-side tracking-time measurement, dropping the oldest
    /// entry once the bounded capacity is reached.
    pub fn push_tracking_measurement(&mut self, m: TrackingTimeMeasurement) {
        if self.tracking_measurements.len() >= DRIVER_MEASUREMENT_CAPACITY {
            self.tracking_measurements.remove(0);
        }
        self.tracking_measurements.push(m);
    }
}

/// The eight named events from spec §4.7, each created sender-side by
/// exactly one process.
pub struct IpcEvents {
    pub driver_state_changed: Arc<NamedEvent>,
    pub server_state_changed: Arc<NamedEvent>,
    pub new_present_info: Arc<NamedEvent>,
    pub new_tracking_data: Arc<NamedEvent>,
    pub frame_finished: Arc<NamedEvent>,
    pub new_system_specs: Arc<NamedEvent>,
    pub new_benchmark_data: Arc<NamedEvent>,
    pub new_measurements: Arc<NamedEvent>,
}

impl IpcEvents {
    pub fn new() -> Self {
        Self {
            driver_state_changed: NamedEvent::new("wvb_driver_state_changed"),
            server_state_changed: NamedEvent::new("wvb_server_state_changed"),
            new_present_info: NamedEvent::new("wvb_new_present_info"),
            new_tracking_data: NamedEvent::new("wvb_new_tracking_data"),
            frame_finished: NamedEvent::new("wvb_frame_finished"),
            new_system_specs: NamedEvent::new("wvb_new_system_specs"),
            new_benchmark_data: NamedEvent::new("wvb_new_benchmark_data"),
            new_measurements: NamedEvent::new("wvb_new_measurements"),
        }
    }
}

impl Default for IpcEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// The full IPC contract: a shared region plus its event set, handed out as
/// one `Arc` bundle to both the driver-side and server-side code paths.
pub struct DriverServerIpc {
    pub state: Arc<SharedRegion<SharedState>>,
    pub events: IpcEvents,
}

impl DriverServerIpc {
    pub fn new() -> Self {
        Self {
            state: SharedRegion::new(SharedState::default()),
            events: IpcEvents::new(),
        }
    }

    /// Driver side: publish a new `PresentInfo` and wake the server's video
    /// worker (spec §4.8 step 1 "wait on event `new_present_info`").
    pub fn present_frame(&self, info: PresentInfo, timeout: Duration) -> wvb_core::error::Result<()> {
        self.state.update(timeout, |s| {
            s.latest_present_info = Some(info);
        })?;
        self.events.new_present_info.signal();
        Ok(())
    }

    /// Server side: publish fresh tracking data and wake the driver's
    /// tracking thread.
    pub fn publish_tracking_state(
        &self,
        tracking: TrackingState,
        timeout: Duration,
    ) -> wvb_core::error::Result<()> {
        self.state.update(timeout, |s| {
            s.tracking_state = Some(tracking);
        })?;
        self.events.new_tracking_data.signal();
        Ok(())
    }
}

impl Default for DriverServerIpc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_frame_wakes_new_present_info_waiter() {
        let ipc = Arc::new(DriverServerIpc::new());
        let waiter = ipc.clone();
        let handle = std::thread::spawn(move || {
            waiter.events.new_present_info.wait(Duration::from_secs(2))
        });
        std::thread::sleep(Duration::from_millis(20));

        let info = PresentInfo {
            shared_texture_handle: 1,
            frame_id: 1,
            vsync_time_seconds: 0.0,
            sample_timestamp: 0,
            pose_timestamp: 0,
        };
        ipc.present_frame(info, Duration::from_millis(50)).unwrap();
        assert!(handle.join().unwrap().is_ok());

        let state = ipc.state.read(Duration::from_millis(50)).unwrap();
        assert_eq!(state.latest_present_info, Some(info));
    }

    #[test]
    fn tracking_measurements_drop_oldest_past_capacity() {
        let mut state = SharedState::default();
        for i in 0..(DRIVER_MEASUREMENT_CAPACITY + 3) {
            state.push_tracking_measurement(TrackingTimeMeasurement {
                pose_timestamp: i as u32,
                tracking_received_timestamp: 0,
                tracking_processed_timestamp: 0,
            });
        }
        assert_eq!(state.tracking_measurements.len(), DRIVER_MEASUREMENT_CAPACITY);
        assert_eq!(state.tracking_measurements[0].pose_timestamp, 3);
    }
}
