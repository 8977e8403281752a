//! Crate-level test suites
//!
//! End-to-end scenarios driving the supervisor through full lifecycles, and
//! property checks over persistence, hooks, and scheduling. Per-module unit
//! tests live next to the code they cover.

#[cfg(test)]
mod test_helpers;

#[cfg(test)]
mod scenario_tests;
