//! Battery pack telemetry acquisition and publishing.
//!
//! Each cycle reads pack status and per-cell voltages from a battery management system, folds
//! them into a [`sample::TelemetrySample`], serializes that into a bounded JSON payload and hands
//! it to a cloud transport. A [`scheduler::Scheduler`] repeats this on a fixed period.
//!
//! The BMS, the transport and the clock are collaborators supplied by the caller through the
//! [`acquisition::Bms`], [`publisher::TelemetryTransport`] and [`clock::Clock`] traits.

#![cfg_attr(feature = "no-std", no_std)]

#[cfg(feature = "no-std")]
use defmt::{debug, info, warn};
#[cfg(feature = "std")]
use log::{debug, info, warn};

pub mod acquisition;
pub mod clock;
mod error;
pub mod payload;
pub mod publisher;
pub mod sample;
pub mod scheduler;

pub use error::{AcquisitionError, CycleError, PublishError, SerializationOverflow};
