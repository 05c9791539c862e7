// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Test harness for posting flood simulation.
//!
//! This module provides utilities for replaying abusive posting patterns
//! against the admission rules on a simulated clock.

pub mod attacks;
pub mod generators;
pub mod metrics;
