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

//! A simulated ledger backend. It keeps the adjudicator contract semantics
//! in process memory and drives time with an explicit block clock, so that
//! the channel client can be exercised without a real chain.

use crate::adjudicator::{
	validate_adjudicator_req, Adjudicator, AdjudicatorReq, ContractBackend, RegisteredEvent,
	RegisteredSub, SharedTimeout, SubCloser, Timeout,
};
use crate::error::{Error, Result};
use crate::require;
use crate::sync::Ctx;
use crate::types::{
	Address, Amount, ChannelId, Duration, Funding, Params, State, Timestamp, Transaction,
};
use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Runtime bytecode of the simulated adjudicator deployment.
pub const ADJUDICATOR_BIN_RUNTIME: &[u8] = b"perun/adjudicator/runtime/v2";
/// Runtime bytecode of the simulated asset holder deployment.
pub const ASSET_HOLDER_BIN_RUNTIME: &[u8] = b"perun/assetholder/runtime/v2";

#[derive(Clone)]
/// A registered channel's state, as seen by the ledger. The timeout, in
/// combination with the state's final flag, determines whether the channel
/// is settled and its funds ready for withdrawing.
pub struct RegisteredState {
	/// The registered channel state.
	pub state: State,
	/// The challenge timeout after which the currently registered state
	/// becomes available for withdrawing. Ignored for final states.
	pub timeout: Timestamp,
	/// Whether a conclude transaction was accepted for the channel.
	pub concluded: bool,
}

impl RegisteredState {
	pub fn settled(&self, now: Timestamp) -> bool {
		self.state.is_final || now >= self.timeout
	}
}

#[derive(Clone)]
/// An entry of the simulated ledger's per-channel event log.
pub enum LedgerEvent {
	/// A participant supplied funds into the channel.
	Funded { funding: Funding, total: Vec<Amount> },
	/// A dispute was started or refuted.
	Registered(RegisteredEvent),
	/// The channel is concluded; funds can be withdrawn and no further
	/// registrations are possible.
	Concluded { channel: ChannelId },
}

struct Contract {
	code: Vec<u8>,
	adjudicator: Option<Address>,
}

#[derive(Default)]
struct Inner {
	now: Timestamp,
	/// Tracks all deposits for unregistered channels. For registered
	/// channels, tracks withdrawable balances instead. Balances are
	/// per-asset columns in the order of the channel's asset list.
	holdings: HashMap<Funding, Vec<Amount>>,
	/// Tracks all registered channels.
	channels: HashMap<ChannelId, RegisteredState>,
	/// All events ever emitted, for subscription replay.
	history: HashMap<ChannelId, Vec<LedgerEvent>>,
	subs: HashMap<ChannelId, Vec<mpsc::UnboundedSender<LedgerEvent>>>,
	contracts: HashMap<Address, Contract>,
	addr_counter: u64,
	conclude_calls: HashMap<ChannelId, usize>,
}

/// The simulated ledger: adjudicator contract state plus a block clock.
pub struct SimLedger {
	inner: Mutex<Inner>,
	clock_tx: watch::Sender<Timestamp>,
	// Keeps the clock channel alive and seeds subscriber clones.
	clock_rx: watch::Receiver<Timestamp>,
}

impl Default for SimLedger {
	fn default() -> Self {
		Self::new()
	}
}

impl SimLedger {
	pub fn new() -> Self {
		let (clock_tx, clock_rx) = watch::channel(0);
		Self {
			inner: Mutex::new(Inner::default()),
			clock_tx,
			clock_rx,
		}
	}

	/// The current block timestamp.
	pub fn now(&self) -> Timestamp {
		self.inner.lock().unwrap().now
	}

	/// Advances the block clock, waking all timeout waiters.
	pub fn advance(&self, dt: Duration) {
		let now = {
			let mut inner = self.inner.lock().unwrap();
			inner.now += dt;
			inner.now
		};
		let _ = self.clock_tx.send(now);
	}

	/// A timeout handle elapsing at the given ledger timestamp.
	pub fn timeout(&self, when: Timestamp) -> SharedTimeout {
		Arc::new(SimTimeout {
			when,
			clock: self.clock_rx.clone(),
		})
	}

	/// Deposits funds for the specified participant into the specified
	/// channel, one amount per channel asset.
	pub fn deposit(&self, funding: Funding, amounts: Vec<Amount>) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		let holding = inner
			.holdings
			.entry(funding.clone())
			.or_insert_with(|| vec![0; amounts.len()]);
		require!(holding.len() == amounts.len(), InvalidInput);
		for (held, add) in holding.iter_mut().zip(amounts.iter()) {
			*held += add;
		}
		let total = holding.clone();
		let channel = funding.channel.clone();
		emit(&mut inner, &channel, LedgerEvent::Funded { funding, total });
		Ok(())
	}

	/// Returns the funds deposited for a channel's specified participant, if
	/// any.
	pub fn query_holdings(&self, funding: &Funding) -> Option<Vec<Amount>> {
		self.inner.lock().unwrap().holdings.get(funding).cloned()
	}

	/// Queries a registered state.
	pub fn state(&self, id: &ChannelId) -> Option<RegisteredState> {
		self.inner.lock().unwrap().channels.get(id).cloned()
	}

	/// Calculates the per-asset total funds held in a channel. If the channel
	/// is unknown and there are no deposited funds for it, returns zeroes.
	pub fn holdings_total(&self, params: &Params, assets: usize) -> Vec<Amount> {
		let inner = self.inner.lock().unwrap();
		holdings_total(&inner, params, assets)
	}

	/// How often a conclude transaction was issued for the channel.
	pub fn conclude_calls(&self, id: &ChannelId) -> usize {
		*self
			.inner
			.lock()
			.unwrap()
			.conclude_calls
			.get(id)
			.unwrap_or(&0)
	}

	/// Whether a `Concluded` event exists in the channel's past.
	pub fn has_concluded(&self, id: &ChannelId) -> bool {
		self.inner
			.lock()
			.unwrap()
			.history
			.get(id)
			.map_or(false, |events| {
				events
					.iter()
					.any(|ev| matches!(ev, LedgerEvent::Concluded { .. }))
			})
	}

	/// Subscribes to the channel's event log. Past events are replayed into
	/// the subscription before any live ones are delivered.
	pub fn subscribe(&self, id: &ChannelId) -> mpsc::UnboundedReceiver<LedgerEvent> {
		let mut inner = self.inner.lock().unwrap();
		let (tx, rx) = mpsc::unbounded_channel();
		if let Some(events) = inner.history.get(id) {
			for ev in events {
				let _ = tx.send(ev.clone());
			}
		}
		inner.subs.entry(id.clone()).or_default().push(tx);
		rx
	}

	/// Starts or refutes a dispute with a non-final state. Refutations must
	/// carry a strictly higher version than the registered state.
	pub fn dispute(&self, params: &Params, tx: &Transaction) -> Result<RegisteredEvent> {
		tx.validate(params)?;
		let mut inner = self.inner.lock().unwrap();
		let now = inner.now;
		let id = tx.state.channel.clone();

		if let Some(old_state) = inner.channels.get(&id) {
			require!(!old_state.settled(now), AlreadyConcluded);
			require!(old_state.state.version < tx.state.version, OutdatedState);
		}

		let timeout = now + params.challenge_duration;
		register_channel(
			&mut inner,
			params,
			RegisteredState {
				state: tx.state.clone(),
				timeout,
				concluded: false,
			},
		)?;

		let event = RegisteredEvent {
			channel: id.clone(),
			version: tx.state.version,
			timeout: self.timeout(timeout),
		};
		emit(&mut inner, &id, LedgerEvent::Registered(event.clone()));
		Ok(event)
	}

	/// Concludes a channel from a final state, making its funds distribution
	/// withdrawable immediately.
	pub fn conclude_final(&self, params: &Params, tx: &Transaction) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		let id = tx.state.channel.clone();
		*inner.conclude_calls.entry(id.clone()).or_insert(0) += 1;
		let now = inner.now;

		tx.validate_final(params)?;

		if let Some(old_state) = inner.channels.get(&id) {
			require!(!old_state.settled(now), AlreadyConcluded);
		}

		register_channel(
			&mut inner,
			params,
			RegisteredState {
				state: tx.state.clone(),
				timeout: now,
				concluded: true,
			},
		)?;
		emit(&mut inner, &id, LedgerEvent::Concluded { channel: id.clone() });
		Ok(())
	}

	/// Concludes a registered, non-final channel after its challenge timeout
	/// elapsed.
	pub fn conclude(&self, params: &Params, tx: &Transaction) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();
		let id = tx.state.channel.clone();
		*inner.conclude_calls.entry(id.clone()).or_insert(0) += 1;
		let now = inner.now;
		require!(params.id() == id, InvalidInput);

		let registered = inner.channels.get_mut(&id).ok_or(Error::NotFinalized)?;
		require!(!registered.concluded, AlreadyConcluded);
		require!(now >= registered.timeout, NotFinalized);
		require!(registered.state.version == tx.state.version, InvalidInput);
		registered.concluded = true;

		emit(&mut inner, &id, LedgerEvent::Concluded { channel: id.clone() });
		Ok(())
	}

	/// Withdraws the specified participant's per-asset funds from a settled
	/// channel. Repeated withdrawals return zeroes.
	pub fn withdraw(&self, params: &Params, idx: usize, tx: &Transaction) -> Result<Vec<Amount>> {
		require!(idx < params.participants.len(), InvalidInput);
		let mut inner = self.inner.lock().unwrap();
		let now = inner.now;
		let id = tx.state.channel.clone();
		let funding = Funding::new(id.clone(), params.participants[idx].clone());

		match inner.channels.get(&id) {
			None => Err(Error::NotFinalized),
			Some(state) => {
				require!(state.settled(now), NotFinalized);
				Ok(inner.holdings.remove(&funding).unwrap_or_default())
			}
		}
	}

	/// Deploys a simulated adjudicator contract, returning its address.
	pub fn deploy_adjudicator(&self) -> Address {
		let mut inner = self.inner.lock().unwrap();
		let addr = next_address(&mut inner);
		inner.contracts.insert(
			addr,
			Contract {
				code: ADJUDICATOR_BIN_RUNTIME.to_vec(),
				adjudicator: None,
			},
		);
		addr
	}

	/// Deploys a simulated asset holder pointing back to the given
	/// adjudicator, returning its address.
	pub fn deploy_asset_holder(&self, adjudicator: Address) -> Address {
		let mut inner = self.inner.lock().unwrap();
		let addr = next_address(&mut inner);
		inner.contracts.insert(
			addr,
			Contract {
				code: ASSET_HOLDER_BIN_RUNTIME.to_vec(),
				adjudicator: Some(adjudicator),
			},
		);
		addr
	}
}

fn next_address(inner: &mut Inner) -> Address {
	inner.addr_counter += 1;
	let mut addr = [0u8; 20];
	addr[12..].copy_from_slice(&inner.addr_counter.to_le_bytes());
	Address(addr)
}

/// Appends an event to the channel's log and fans it out to all live
/// subscriptions.
fn emit(inner: &mut Inner, id: &ChannelId, event: LedgerEvent) {
	inner
		.history
		.entry(id.clone())
		.or_default()
		.push(event.clone());
	if let Some(subs) = inner.subs.get_mut(id) {
		subs.retain(|tx| tx.send(event.clone()).is_ok());
	}
}

fn holdings_total(inner: &Inner, params: &Params, assets: usize) -> Vec<Amount> {
	let mut acc = vec![0; assets];
	for pk in params.participants.iter() {
		let funding = Funding::new(params.id(), pk.clone());
		if let Some(holding) = inner.holdings.get(&funding) {
			for (sum, held) in acc.iter_mut().zip(holding.iter()) {
				*sum += held;
			}
		}
	}
	acc
}

/// Updates the holdings associated with a channel to the outcome of the
/// supplied state, then registers the state. If the state is the channel's
/// initial state, the holdings are not updated, as initial states are allowed
/// to be under-funded and are otherwise expected to match the deposit
/// distribution exactly if fully funded.
fn register_channel(inner: &mut Inner, params: &Params, state: RegisteredState) -> Result<()> {
	let assets = state.state.allocation.assets.len();
	let total = holdings_total(inner, params, assets);
	let outcome = state.state.total();
	if total
		.iter()
		.zip(outcome.iter())
		.any(|(held, owed)| held < owed)
	{
		require!(state.state.may_be_underfunded(), InsufficientFunding);
	} else {
		update_holdings(inner, params, &state.state);
	}

	inner.channels.insert(state.state.channel.clone(), state);
	Ok(())
}

/// Pushes a state's funding allocation into the channel's holdings mapping.
fn update_holdings(inner: &mut Inner, params: &Params, state: &State) {
	for (i, pk) in params.participants.iter().enumerate() {
		inner.holdings.insert(
			Funding::new(state.channel.clone(), pk.clone()),
			state.allocation.column(i),
		);
	}
}

// SimTimeout

#[derive(Clone)]
/// A block-clock deadline on the simulated ledger.
pub struct SimTimeout {
	when: Timestamp,
	clock: watch::Receiver<Timestamp>,
}

impl fmt::Debug for SimTimeout {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "SimTimeout({})", self.when)
	}
}

#[async_trait]
impl Timeout for SimTimeout {
	fn is_elapsed(&self) -> bool {
		*self.clock.borrow() >= self.when
	}

	async fn wait(&self, ctx: &Ctx) -> Result<()> {
		let mut clock = self.clock.clone();
		loop {
			if *clock.borrow() >= self.when {
				return Ok(());
			}
			tokio::select! {
				changed = clock.changed() => {
					if changed.is_err() {
						return Err(Error::Subscription("ledger clock stopped".into()));
					}
				}
				_ = ctx.cancelled() => return Err(Error::Cancelled),
			}
		}
	}
}

// SimRegisteredSub

/// A [`RegisteredSub`] over the simulated ledger's event log.
pub struct SimRegisteredSub {
	rx: mpsc::UnboundedReceiver<LedgerEvent>,
	closed_tx: Arc<watch::Sender<bool>>,
	closed_rx: watch::Receiver<bool>,
	err: Option<Error>,
}

#[async_trait]
impl RegisteredSub for SimRegisteredSub {
	async fn next(&mut self) -> Option<RegisteredEvent> {
		loop {
			if *self.closed_rx.borrow() {
				return None;
			}
			tokio::select! {
				ev = self.rx.recv() => match ev {
					Some(LedgerEvent::Registered(reg)) => return Some(reg),
					Some(_) => continue,
					None => {
						self.err = Some(Error::Subscription("ledger event stream ended".into()));
						return None;
					}
				},
				changed = self.closed_rx.changed() => {
					if changed.is_err() || *self.closed_rx.borrow() {
						return None;
					}
				}
			}
		}
	}

	fn close(&self) -> Result<()> {
		let _ = self.closed_tx.send(true);
		Ok(())
	}

	fn err(&self) -> Option<Error> {
		self.err.clone()
	}

	fn close_handle(&self) -> SubCloser {
		let closed_tx = self.closed_tx.clone();
		SubCloser::new(Arc::new(move || {
			let _ = closed_tx.send(true);
		}))
	}
}

// SimAdjudicator

/// An [`Adjudicator`] over the simulated ledger.
pub struct SimAdjudicator {
	ledger: Arc<SimLedger>,
}

impl SimAdjudicator {
	pub fn new(ledger: Arc<SimLedger>) -> Self {
		Self { ledger }
	}

	pub fn ledger(&self) -> &Arc<SimLedger> {
		&self.ledger
	}
}

#[async_trait]
impl Adjudicator for SimAdjudicator {
	async fn deposit(&self, _ctx: &Ctx, params: &Params, state: &State, idx: usize) -> Result<()> {
		require!(idx < params.participants.len(), InvalidInput);
		let funding = Funding::new(state.channel.clone(), params.participants[idx].clone());
		self.ledger.deposit(funding, state.allocation.column(idx))
	}

	async fn register(&self, ctx: &Ctx, req: AdjudicatorReq) -> Result<RegisteredEvent> {
		validate_adjudicator_req(&req)?;

		// Final states conclude directly; the returned registration carries
		// an already-elapsed timeout, so settlement proceeds without a
		// challenge window.
		if req.tx.state.is_final {
			self.ensure_concluded(ctx, &req).await?;
			return Ok(RegisteredEvent {
				channel: req.tx.state.channel.clone(),
				version: req.tx.state.version,
				timeout: self.ledger.timeout(self.ledger.now()),
			});
		}

		match self.ledger.dispute(&req.params, &req.tx) {
			Ok(event) => Ok(event),
			// Another party raced ahead with a higher version; acknowledge
			// with the event of the registered state instead.
			Err(Error::OutdatedState) => {
				let reg = self
					.ledger
					.state(&req.tx.state.channel)
					.ok_or(Error::OutdatedState)?;
				Ok(RegisteredEvent {
					channel: reg.state.channel.clone(),
					version: reg.state.version,
					timeout: self.ledger.timeout(reg.timeout),
				})
			}
			Err(err) => Err(Error::tx_failed(err)),
		}
	}

	async fn withdraw(&self, _ctx: &Ctx, req: AdjudicatorReq) -> Result<()> {
		self.ledger
			.withdraw(&req.params, req.idx, &req.tx)
			.map(|_| ())
			.map_err(Error::tx_failed)
	}

	async fn subscribe_registered(
		&self,
		_ctx: &Ctx,
		params: &Params,
	) -> Result<Box<dyn RegisteredSub>> {
		let rx = self.ledger.subscribe(&params.id());
		let (closed_tx, closed_rx) = watch::channel(false);
		Ok(Box::new(SimRegisteredSub {
			rx,
			closed_tx: Arc::new(closed_tx),
			closed_rx,
			err: None,
		}))
	}

	/// Makes sure conclude or concludeFinal (for non-final and final states,
	/// resp.) is called on the adjudicator: a subscription on `Concluded`
	/// events is established, then past events are searched. A past event
	/// means the channel is already concluded. Otherwise the transaction is
	/// issued, tolerating reverts caused by concurrent conclusion, and the
	/// live event is awaited.
	async fn ensure_concluded(&self, ctx: &Ctx, req: &AdjudicatorReq) -> Result<()> {
		let id = req.tx.state.channel.clone();
		let mut events = self.ledger.subscribe(&id);

		if self.ledger.has_concluded(&id) {
			return Ok(());
		}

		let submitted = if req.tx.state.is_final {
			self.ledger.conclude_final(&req.params, &req.tx)
		} else {
			self.ledger.conclude(&req.params, &req.tx)
		};
		if let Err(err) = submitted {
			warn!(
				"Calling conclude(Final) failed, waiting for event anyways: {}",
				err
			);
		}

		loop {
			tokio::select! {
				ev = events.recv() => match ev {
					Some(LedgerEvent::Concluded { .. }) => return Ok(()),
					Some(_) => continue,
					None => return Err(Error::Subscription("ledger event stream ended".into())),
				},
				_ = ctx.cancelled() => return Err(Error::Cancelled),
			}
		}
	}
}

#[async_trait]
impl ContractBackend for SimLedger {
	async fn code_at(&self, _ctx: &Ctx, addr: Address) -> Result<Vec<u8>> {
		Ok(self
			.inner
			.lock()
			.unwrap()
			.contracts
			.get(&addr)
			.map(|c| c.code.clone())
			.unwrap_or_default())
	}

	async fn asset_holder_adjudicator(&self, _ctx: &Ctx, asset_holder: Address) -> Result<Address> {
		self.inner
			.lock()
			.unwrap()
			.contracts
			.get(&asset_holder)
			.and_then(|c| c.adjudicator)
			.ok_or(Error::InvalidInput)
	}
}

/// Checks that the bytecode at the given address is the adjudicator's known
/// runtime bytecode. A mismatch yields a [`Error::ContractBytecode`], which
/// can be detected with [`crate::error::is_contract_bytecode_error`].
pub async fn validate_adjudicator(
	ctx: &Ctx,
	backend: &dyn ContractBackend,
	adjudicator: Address,
) -> Result<()> {
	let code = backend.code_at(ctx, adjudicator).await?;
	if code != ADJUDICATOR_BIN_RUNTIME {
		return Err(Error::ContractBytecode(
			"incorrect adjudicator contract".into(),
		));
	}
	Ok(())
}

/// Checks that the bytecode at the given address is the asset holder's known
/// runtime bytecode and that the deployment points back to the expected
/// adjudicator, which is validated as well.
pub async fn validate_asset_holder(
	ctx: &Ctx,
	backend: &dyn ContractBackend,
	asset_holder: Address,
	adjudicator: Address,
) -> Result<()> {
	let code = backend.code_at(ctx, asset_holder).await?;
	if code != ASSET_HOLDER_BIN_RUNTIME {
		return Err(Error::ContractBytecode(
			"incorrect asset holder contract".into(),
		));
	}
	let set_in_contract = backend.asset_holder_adjudicator(ctx, asset_holder).await?;
	if set_in_contract != adjudicator {
		return Err(Error::ContractBytecode(
			"incorrect adjudicator address in contract".into(),
		));
	}
	validate_adjudicator(ctx, backend, adjudicator).await
}
