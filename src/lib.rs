// THEORY:
// This file is the entry point of the `abacus_vision` library crate. It exposes
// the `CaptureSession` pipeline and the types a host needs around it: the
// engine context that owns the imaging backend, configuration, frames, and the
// calibration and reading types that make up the session's output.
//
// The individual algorithms (detection, tracking, fiducial calibration,
// rectification, debouncing) live in `core_modules` and stay public so hosts
// and tests can drive any stage on its own.

pub mod config;
pub mod context;
pub mod core_modules;
pub mod error;
pub mod frame;
pub mod pipeline;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use core_modules::calibration::{CalibrationGrid, CalibrationSource, Margins, RegionOfInterest};
pub use core_modules::fiducial::MountingMode;
pub use core_modules::geometry::{Point, Quad};
pub use core_modules::imaging::{ImageprocBackend, ImagingBackend};
pub use core_modules::reading::{ColumnClassifier, ColumnDigit, ColumnReading};
pub use error::{CalibrationRejection, EngineError, Result};
pub use frame::Frame;
pub use pipeline::{CaptureSession, DetectionMode, FrameReport, SessionHandle, spawn};
