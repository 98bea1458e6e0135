// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: fotad daemon – update agent, boot success monitor, control socket
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests per module + end-to-end flows in tests/fota_host
//!
//! PUBLIC API: config, agent (loop + boot monitor), server, provision
//! DEPENDS_ON: fota domain library, bootstate
//! ADR: docs/adr/0002-update-agent.md

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod provision;
pub mod server;
