//  Copyright 2021, 2022 PolyCrypt GmbH
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The Perun state-channel client: per-channel control logic that drives a
//! channel through its lifecycle of opening, off-chain updates, disputed
//! registration with an on-ledger adjudicator, and final withdrawal.
//!
//! The [`machine::Machine`] is the deterministic phase machine persisting
//! the authoritative off-chain state with its accumulated signatures. The
//! update protocol in [`update`] advances it off-chain; the watcher and
//! settlement pipeline in [`channel`] drive the on-ledger
//! `register → wait-timeout → withdraw` sequence through the
//! [`adjudicator::Adjudicator`] capability. [`sim`] provides a simulated
//! ledger backend for tests and demos.

pub mod adjudicator;
pub mod app;
pub mod channel;
pub mod error;
pub mod machine;
pub mod sim;
pub mod sync;
pub mod types;
pub mod update;
pub mod wallet;
mod watch;
