pub mod calibration;
pub mod fiducial;
pub mod geometry;
pub mod imaging;
pub mod markers;
pub mod quad_detector;
pub mod quad_tracker;
pub mod reading;
pub mod rectifier;
pub mod stability;
