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

use crate::machine::Phase;
use crate::types::{AppId, Version};
use thiserror::Error;

#[macro_export]
macro_rules! require {
	($cond:expr, $err:ident) => {
		if !($cond) {
			return Err(Error::$err);
		}
	};
	($cond:expr, $err:expr) => {
		if !($cond) {
			return Err($err);
		}
	};
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Contains all errors that can occur while operating a Perun channel client.
pub enum Error {
	/// An operation that is illegal in the machine's current phase.
	#[error("illegal transition to {to:?} in phase {current:?}")]
	PhaseTransition { current: Phase, to: Phase },
	/// Any kind of signature mismatch, including missing or duplicate
	/// signature slots.
	#[error("signature mismatch")]
	Authentication,
	/// The app rejected a proposed state transition.
	#[error("app rejected transition: {0}")]
	AppTransition(String),
	/// A peer replied to an update proposal with a rejection.
	#[error("update {version} rejected by peer {peer}: {reason}")]
	UpdateRejected {
		peer: usize,
		version: Version,
		reason: String,
	},
	/// In some way, the input was invalid.
	#[error("invalid input")]
	InvalidInput,
	/// A non-finalized state was supplied when a finalized state was
	/// expected, or a withdrawal was attempted before settlement.
	#[error("channel not finalized")]
	NotFinalized,
	/// A channel has been concluded or disputed after conclusion.
	#[error("channel already concluded")]
	AlreadyConcluded,
	/// When trying to get more funds out of a channel than have been put
	/// into it.
	#[error("insufficient channel funding")]
	InsufficientFunding,
	/// When a state that is registered for dispute is older than the
	/// previously registered state.
	#[error("outdated channel state")]
	OutdatedState,
	/// No app is bound to the requested app identifier.
	#[error("unknown app {0}")]
	UnknownApp(AppId),
	/// On-chain contract code does not match the known runtime bytecode.
	#[error("contract bytecode mismatch: {0}")]
	ContractBytecode(String),
	/// A submitted ledger transaction was reverted or dropped. Callers may
	/// keep waiting for external events.
	#[error("transaction failed")]
	TxFailed(#[source] Box<Error>),
	/// The event stream failed mid-flight.
	#[error("subscription error: {0}")]
	Subscription(String),
	/// The ledger acknowledged a different version than expected.
	#[error("unexpected version {got} registered, expected {expected}")]
	UnexpectedVersion { expected: Version, got: Version },
	/// The machine mutex could not be acquired before the context fired.
	#[error("locking machine mutex in time")]
	LockTimeout,
	/// The supplied context was cancelled.
	#[error("context cancelled")]
	Cancelled,
	/// The channel or resource was already closed.
	#[error("already closed")]
	Closed,
}

/// Returns whether the error means that a ledger transaction was reverted or
/// dropped. Such errors are recoverable by waiting for external events.
pub fn is_tx_failed(err: &Error) -> bool {
	matches!(err, Error::TxFailed(_))
}

/// Returns whether the error stems from on-chain contract code validation.
pub fn is_contract_bytecode_error(err: &Error) -> bool {
	matches!(err, Error::ContractBytecode(_))
}

impl Error {
	/// Wraps a ledger rejection as a failed transaction.
	pub fn tx_failed(reason: Error) -> Self {
		Error::TxFailed(Box::new(reason))
	}
}

/// Client operation result type.
pub type Result<T> = core::result::Result<T, Error>;
