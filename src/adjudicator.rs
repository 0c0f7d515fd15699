//  Copyright 2022 PolyCrypt GmbH
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

use crate::error::{Error, Result};
use crate::sync::Ctx;
use crate::types::{Address, ChannelId, Params, State, Transaction, Version};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// An abstract deadline on the ledger's clock.
#[async_trait]
pub trait Timeout: Send + Sync + fmt::Debug {
	/// Whether the deadline has been reached. Non-blocking.
	fn is_elapsed(&self) -> bool;

	/// Suspends until the deadline is reached on the ledger's clock or the
	/// context fires, returning [`Error::Cancelled`] in the latter case.
	async fn wait(&self, ctx: &Ctx) -> Result<()>;
}

/// A timeout handle shared between events and their observers.
pub type SharedTimeout = Arc<dyn Timeout>;

#[derive(Clone)]
/// Produced by the ledger when a state has been posted to the adjudicator.
pub struct RegisteredEvent {
	/// The registered channel.
	pub channel: ChannelId,
	/// The version of the registered state.
	pub version: Version,
	/// The challenge timeout after which the registered state becomes
	/// available for withdrawing.
	pub timeout: SharedTimeout,
}

impl fmt::Debug for RegisteredEvent {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("RegisteredEvent")
			.field("channel", &self.channel.to_string())
			.field("version", &self.version)
			.field("timeout", &self.timeout)
			.finish()
	}
}

// Event identity is the registered channel and version; the timeout handle
// carries no identity of its own.
impl PartialEq for RegisteredEvent {
	fn eq(&self, other: &Self) -> bool {
		self.channel == other.channel && self.version == other.version
	}
}

impl Eq for RegisteredEvent {}

#[derive(Clone)]
/// Everything an adjudicator call needs: the channel's parameters, the
/// caller's participant index, and the transaction to act on.
pub struct AdjudicatorReq {
	pub params: Params,
	pub idx: usize,
	pub tx: Transaction,
}

/// Closes a subscription from outside the consuming task, e.g. from a
/// channel's close hook. Closing is idempotent.
#[derive(Clone)]
pub struct SubCloser(Arc<dyn Fn() + Send + Sync>);

impl SubCloser {
	pub fn new(f: Arc<dyn Fn() + Send + Sync>) -> Self {
		Self(f)
	}

	pub fn close(&self) {
		(self.0)()
	}
}

/// A stream of [`RegisteredEvent`]s for one channel. A fresh subscription
/// delivers past events, filtered from ledger history, before live ones.
#[async_trait]
pub trait RegisteredSub: Send {
	/// The next event, or `None` once the subscription is closed or fails.
	async fn next(&mut self) -> Option<RegisteredEvent>;

	/// Closes the subscription; `next` returns `None` afterwards. Closing an
	/// already closed subscription succeeds.
	fn close(&self) -> Result<()>;

	/// The error that terminated the stream, if any. `None` after an orderly
	/// close.
	fn err(&self) -> Option<Error>;

	/// A handle that closes this subscription from another task.
	fn close_handle(&self) -> SubCloser;
}

/// The boundary to the on-ledger adjudicator arbitrating this channel.
#[async_trait]
pub trait Adjudicator: Send + Sync {
	/// Funds the channel's asset holders on behalf of one participant.
	async fn deposit(&self, ctx: &Ctx, params: &Params, state: &State, idx: usize) -> Result<()>;

	/// Posts a fully-signed state. The returned event may be a different,
	/// higher-versioned one if another party raced ahead.
	async fn register(&self, ctx: &Ctx, req: AdjudicatorReq) -> Result<RegisteredEvent>;

	/// Releases the calling participant's allocation after settlement.
	async fn withdraw(&self, ctx: &Ctx, req: AdjudicatorReq) -> Result<()>;

	/// Subscribes to registration events for the given channel.
	async fn subscribe_registered(
		&self,
		ctx: &Ctx,
		params: &Params,
	) -> Result<Box<dyn RegisteredSub>>;

	/// Makes sure the channel is concluded on the ledger, issuing at most one
	/// conclude transaction and tolerating concurrent conclusion by peers.
	async fn ensure_concluded(&self, ctx: &Ctx, req: &AdjudicatorReq) -> Result<()>;
}

/// Read access to deployed contract code, for pre-flight validation.
#[async_trait]
pub trait ContractBackend: Send + Sync {
	/// The runtime bytecode at the given address; empty when nothing is
	/// deployed there.
	async fn code_at(&self, ctx: &Ctx, addr: Address) -> Result<Vec<u8>>;

	/// The adjudicator address an asset holder contract points back to.
	async fn asset_holder_adjudicator(&self, ctx: &Ctx, asset_holder: Address) -> Result<Address>;
}

/// Verifies a fully-signed transaction against the channel parameters before
/// it is handed to the ledger.
pub fn validate_adjudicator_req(req: &AdjudicatorReq) -> Result<()> {
	if req.idx >= req.params.participants.len() {
		return Err(Error::InvalidInput);
	}
	req.tx.validate(&req.params)
}
