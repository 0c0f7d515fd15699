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

use crate::adjudicator::Adjudicator;
use crate::app::AppRegistry;
use crate::error::{Error, Result};
use crate::machine::{Machine, Phase};
use crate::sync::{Closer, Ctx, CtxMutex};
use crate::types::{ChannelId, Params, State};
use crate::update::Conn;
use crate::wallet::{Account, Wallet};
use log::debug;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// A channel controller. It owns the channel's phase machine, guarded by a
/// cancellable mutex through which all per-channel operations serialize, the
/// connection to the channel's peers, and the watcher task.
pub struct Channel {
	idx: usize,
	id: ChannelId,
	params: Params,
	pub(crate) machine: CtxMutex<Machine>,
	pub(crate) adjudicator: Arc<dyn Adjudicator>,
	pub(crate) wallet: Arc<Wallet>,
	pub(crate) conn: Box<dyn Conn>,
	pub(crate) closer: Closer,
	watcher: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Channel {
	/// Creates a channel controller over a validated initial state and
	/// registers one usage of the account with the wallet.
	pub fn new(
		registry: &AppRegistry,
		adjudicator: Arc<dyn Adjudicator>,
		wallet: Arc<Wallet>,
		conn: Box<dyn Conn>,
		acc: Arc<Account>,
		idx: usize,
		params: Params,
		init: State,
	) -> Result<Self> {
		let machine = Machine::new(registry, acc.clone(), idx, params.clone(), init)?;
		wallet.increment_usage(acc.public());
		Ok(Self {
			idx,
			id: params.id(),
			params,
			machine: CtxMutex::new(machine),
			adjudicator,
			wallet,
			conn,
			closer: Closer::new(),
			watcher: Mutex::new(None),
		})
	}

	pub fn id(&self) -> &ChannelId {
		&self.id
	}

	pub fn idx(&self) -> usize {
		self.idx
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	/// A context that is cancelled when the channel closes.
	pub fn ctx(&self) -> Ctx {
		self.closer.ctx()
	}

	pub async fn phase(&self) -> Phase {
		self.machine.lock().await.phase()
	}

	/// A snapshot of the current committed state.
	pub async fn state(&self) -> State {
		self.machine.lock().await.state().clone()
	}

	/// Deposits the own allocation column with the channel's asset holders.
	pub async fn deposit(&self, ctx: &Ctx) -> Result<()> {
		let state = {
			let m = self.machine.lock().await;
			m.state().clone()
		};
		self.adjudicator
			.deposit(ctx, &self.params, &state, self.idx)
			.await
	}

	/// Marks the channel as funded. Funding confirmation is external, e.g.
	/// by observing the asset holders' balances.
	pub async fn set_funded(&self) -> Result<()> {
		self.machine.lock().await.set_funded()
	}

	/// Spawns the watcher as an owned task. The channel cancels and joins it
	/// on close.
	pub fn spawn_watcher(self: &Arc<Self>) {
		let ch = self.clone();
		let handle = tokio::spawn(async move { ch.watch().await });
		*self.watcher.lock().unwrap() = Some(handle);
	}

	/// Takes the watcher's task handle, e.g. to await its result directly.
	pub fn take_watcher(&self) -> Option<JoinHandle<Result<()>>> {
		self.watcher.lock().unwrap().take()
	}

	/// Closes the channel controller: cancels all pending operations, closes
	/// the watcher's subscription and joins the watcher task. Closing twice
	/// is a no-op.
	pub async fn close(&self) -> Result<()> {
		match self.closer.close() {
			Ok(()) => {}
			Err(Error::Closed) => return Ok(()),
			Err(err) => return Err(err),
		}

		let handle = self.take_watcher();
		if let Some(handle) = handle {
			match handle.await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => debug!("[{}] watcher returned: {}", self.id, err),
				Err(err) => debug!("[{}] watcher task panicked: {}", self.id, err),
			}
		}
		Ok(())
	}
}
