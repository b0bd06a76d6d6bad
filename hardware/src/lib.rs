//! Hardware drivers for the acquisition rig.
//!
//! This crate provides the wire protocol and links for the GPS-disciplined
//! timer unit that triggers the CCD camera.
//!
//! # Features
//!
//! - `hardware-tests` - Tests that talk to a timer unit attached over USB

pub mod timer;
