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

use crate::adjudicator::{AdjudicatorReq, RegisteredEvent};
use crate::app::{App, AppRegistry};
use crate::error::{Error, Result};
use crate::require;
use crate::types::{L2Signature, Params, State, Transaction};
use crate::wallet::Account;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
/// A channel's progress through its lifecycle. The declaration order is the
/// lifecycle order; phases gate which machine operations are legal.
pub enum Phase {
	/// The initial state is being set up.
	InitActing,
	/// The initial state is being signed by all participants.
	InitSigning,
	/// The initial state is fully signed; deposits are being made.
	Funding,
	/// The channel is open for off-chain updates.
	Acting,
	/// A staged update is collecting signatures.
	Signing,
	/// A final state has been fully signed; no further updates are legal.
	Final,
	/// A state is being posted to the adjudicator.
	Registering,
	/// The adjudicator acknowledged a registered state.
	Registered,
	/// Funds are being withdrawn.
	Withdrawing,
	/// All funds withdrawn. Terminal.
	Withdrawn,
}

/// The per-channel phase machine. It persists the authoritative off-chain
/// state together with accumulated peer signatures, a staged next state
/// during updates, and the latest adjudicator registration.
///
/// Once the phase reaches `Funding`, the current transaction is always fully
/// signed; a staged transaction always has `version = current + 1` and has
/// passed the app's transition check.
pub struct Machine {
	idx: usize,
	acc: Arc<Account>,
	params: Params,
	app: Arc<dyn App>,
	phase: Phase,
	cur: Transaction,
	staging: Option<Transaction>,
	registered: Option<RegisteredEvent>,
}

impl Machine {
	/// Creates a machine over a validated initial state. The account must be
	/// the participant at the given index and the app bound to the params'
	/// app identifier must accept the initial state.
	pub fn new(
		registry: &AppRegistry,
		acc: Arc<Account>,
		idx: usize,
		params: Params,
		init: State,
	) -> Result<Self> {
		let n = params.participants.len();
		require!(n > 0 && idx < n, InvalidInput);
		require!(acc.public() == &params.participants[idx], Authentication);
		require!(init.channel == params.id(), InvalidInput);
		require!(init.version == 0, InvalidInput);
		require!(init.allocation.valid_shape(n), InvalidInput);

		let app = registry.resolve(&params.app)?;
		app.valid_init(&params, &init)?;

		Ok(Self {
			idx,
			acc,
			params,
			app,
			phase: Phase::InitActing,
			cur: Transaction::new(init, n),
			staging: None,
			registered: None,
		})
	}

	pub fn idx(&self) -> usize {
		self.idx
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	pub fn account(&self) -> &Arc<Account> {
		&self.acc
	}

	/// The current committed state.
	pub fn state(&self) -> &State {
		&self.cur.state
	}

	/// The staged next state, if an update is in progress.
	pub fn staging_state(&self) -> Option<&State> {
		self.staging.as_ref().map(|tx| &tx.state)
	}

	pub fn current_fully_signed(&self) -> bool {
		self.cur.is_fully_signed()
	}

	/// The latest adjudicator registration known to the machine.
	pub fn registered(&self) -> Option<&RegisteredEvent> {
		self.registered.as_ref()
	}

	/// Builds the request handed to adjudicator calls from the current
	/// transaction.
	pub fn adjudicator_req(&self) -> AdjudicatorReq {
		AdjudicatorReq {
			params: self.params.clone(),
			idx: self.idx,
			tx: self.cur.clone(),
		}
	}

	fn expect(&self, from: &[Phase], to: Phase) -> Result<()> {
		require!(
			from.contains(&self.phase),
			Error::PhaseTransition {
				current: self.phase,
				to,
			}
		);
		Ok(())
	}

	/// Signs the initial state with the own account.
	pub fn sign_initial(&mut self) -> Result<L2Signature> {
		self.expect(&[Phase::InitActing], Phase::InitSigning)?;
		let sig = self.acc.sign_state(&self.cur.state);
		self.cur.put_sig(self.idx, sig.clone())?;
		self.phase = Phase::InitSigning;
		Ok(sig)
	}

	/// Adds a participant's signature on the state currently collecting
	/// signatures: the initial state during `InitSigning`, the staged state
	/// during `Signing`. A fully signed staged state is committed, advancing
	/// to `Acting`, or `Final` for final states.
	pub fn add_sig(&mut self, part: usize, sig: L2Signature) -> Result<()> {
		require!(part < self.params.participants.len(), InvalidInput);
		match self.phase {
			Phase::InitSigning => {
				self.cur
					.state
					.validate_sig(&sig, &self.params.participants[part])?;
				self.cur.put_sig(part, sig)
			}
			Phase::Signing => {
				let mut staging = self.staging.take().ok_or(Error::InvalidInput)?;
				let res = staging
					.state
					.validate_sig(&sig, &self.params.participants[part])
					.and_then(|_| staging.put_sig(part, sig));
				if let Err(err) = res {
					self.staging = Some(staging);
					return Err(err);
				}

				if staging.is_fully_signed() {
					self.phase = if staging.state.is_final {
						Phase::Final
					} else {
						Phase::Acting
					};
					self.cur = staging;
				} else {
					self.staging = Some(staging);
				}
				Ok(())
			}
			_ => Err(Error::PhaseTransition {
				current: self.phase,
				to: self.phase,
			}),
		}
	}

	/// Signs the staged state with the own account and records the signature.
	pub fn sign_staging(&mut self) -> Result<L2Signature> {
		self.expect(&[Phase::Signing], Phase::Signing)?;
		let staging = self.staging.as_ref().ok_or(Error::InvalidInput)?;
		let sig = self.acc.sign_state(&staging.state);
		self.add_sig(self.idx, sig.clone())?;
		Ok(sig)
	}

	/// Transitions to `Funding` once the initial state is fully signed.
	pub fn enable_init(&mut self) -> Result<()> {
		self.expect(&[Phase::InitSigning], Phase::Funding)?;
		require!(self.cur.is_fully_signed(), Authentication);
		self.phase = Phase::Funding;
		Ok(())
	}

	/// Marks the channel as funded. Funding confirmation happens externally.
	pub fn set_funded(&mut self) -> Result<()> {
		self.expect(&[Phase::Funding], Phase::Acting)?;
		self.phase = Phase::Acting;
		Ok(())
	}

	/// Stages a next state proposed by the given participant.
	pub fn update(&mut self, next: State, actor: usize) -> Result<()> {
		self.expect(&[Phase::Acting], Phase::Signing)?;
		require!(actor < self.params.participants.len(), InvalidInput);
		self.valid_transition(&next, actor)?;

		self.staging = Some(Transaction::new(next, self.params.participants.len()));
		self.phase = Phase::Signing;
		Ok(())
	}

	fn valid_transition(&self, next: &State, actor: usize) -> Result<()> {
		let cur = &self.cur.state;
		require!(next.channel == cur.channel, InvalidInput);
		require!(next.version == cur.version + 1, InvalidInput);
		require!(
			next.allocation
				.valid_shape(self.params.participants.len()),
			InvalidInput
		);
		// Assets are fixed at channel creation and balances may only be
		// reshuffled, never minted or burned.
		require!(next.allocation.assets == cur.allocation.assets, InvalidInput);
		require!(next.total() == cur.total(), InvalidInput);

		self.app.valid_transition(&self.params, cur, next, actor)
	}

	/// Drops the staged state and all partial signatures on it.
	pub fn discard_update(&mut self) -> Result<()> {
		self.expect(&[Phase::Signing], Phase::Acting)?;
		self.staging = None;
		self.phase = Phase::Acting;
		Ok(())
	}

	/// Marks a registration as in progress. Also legal from `Registered`,
	/// which is how a stale peer registration gets refuted.
	pub fn set_registering(&mut self) -> Result<()> {
		self.expect(
			&[
				Phase::Acting,
				Phase::Signing,
				Phase::Final,
				Phase::Registering,
				Phase::Registered,
			],
			Phase::Registering,
		)?;
		self.phase = Phase::Registering;
		Ok(())
	}

	/// Stores a registration event. Among multiple events, the highest
	/// version wins; a stale event loses its authority but still moves the
	/// phase so that the settlement pipeline refutes it.
	pub fn set_registered(&mut self, event: RegisteredEvent) -> Result<()> {
		self.expect(
			&[
				Phase::Acting,
				Phase::Signing,
				Phase::Final,
				Phase::Registering,
				Phase::Registered,
			],
			Phase::Registered,
		)?;
		require!(event.channel == self.cur.state.channel, InvalidInput);

		match &self.registered {
			Some(cur_event) if cur_event.version > event.version => {}
			_ => self.registered = Some(event),
		}
		self.phase = Phase::Registered;
		Ok(())
	}

	/// Marks a withdrawal as in progress. Legal from `Final` for
	/// collaborative settlement, from `Registered` after a challenge
	/// timeout, and from `Withdrawing` for pipeline re-entry.
	pub fn set_withdrawing(&mut self) -> Result<()> {
		self.expect(
			&[Phase::Final, Phase::Registered, Phase::Withdrawing],
			Phase::Withdrawing,
		)?;
		self.phase = Phase::Withdrawing;
		Ok(())
	}

	/// Marks the channel as withdrawn once the ledger confirmed. Terminal.
	pub fn set_withdrawn(&mut self) -> Result<()> {
		self.expect(&[Phase::Withdrawing], Phase::Withdrawn)?;
		self.phase = Phase::Withdrawn;
		Ok(())
	}
}
