// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Host integration tests for the A/B update and boot-fallback stack
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: update_flow.rs (update cycles), boot_flow.rs (boot sequences)
//!
//! ADR: docs/adr/0002-update-agent.md
