//! # Capture Loop Scenarios
//!
//! Whole-cycle tests of [`sundial_cam_lib::station::CaptureLoop`] with fake
//! camera, rasterizer, sensors and transport. The station sits in Cluj-Napoca
//! (23.586 E, 46.758 N) around the March equinox.

mod cycle_tests;
