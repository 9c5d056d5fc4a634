//! Group synchronization: per-device state and the controller that pulls
//! every receiver toward a common virtual playback time.

pub mod controller;
pub mod device;

pub use controller::{
    ControllerSnapshot, GroupSnapshot, SyncController, SyncQuality, DEFAULT_GROUP,
};
pub use device::{DeviceSnapshot, DeviceState, DriftSample};
