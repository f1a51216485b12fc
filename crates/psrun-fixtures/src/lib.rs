//! Test fixtures for psrun.
//!
//! - [`FakeHost`], [`FakeChannel`] and [`FakeProcess`] simulate a remote
//!   Windows host behind the channel traits.
//! - [`helpers`] builds runner configurations and runners against a fake host.

#![allow(missing_docs)]

pub mod fake;
pub mod helpers;

pub use fake::{FakeChannel, FakeHost, FakeProcess, FAKE_PID};
pub use helpers::{fake_runner, temp_dir, test_config};
