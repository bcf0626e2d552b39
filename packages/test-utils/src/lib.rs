//! Shared test utilities for Resonance workspace
//!
//! This crate provides filesystem fixtures for testing the library scanner
//! without touching a real music library.
//!
//! # Fixtures
//!
//! - [`TempLibrary`] - Temporary directory tree of audio and non-audio files
//!
//! # Example
//!
//! ```rust
//! use resonance_test_utils::TempLibrary;
//!
//! let library = TempLibrary::new();
//! library.add_file("Artist/Album/01 - Intro.flac", b"fLaC");
//! library.add_file("Artist/Album/cover.jpg", b"jpg");
//!
//! assert!(library.root().join("Artist/Album/01 - Intro.flac").is_file());
//! ```

mod library;

pub use library::TempLibrary;
