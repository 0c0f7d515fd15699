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

use crate::adjudicator::RegisteredEvent;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::machine::{Machine, Phase};
use crate::sync::Ctx;
use log::{debug, info, warn};
use std::sync::Arc;

impl Channel {
	/// Runs the channel watcher routine. It subscribes to registration
	/// events on the adjudicator. When an event arrives, it makes sure the
	/// latest state is registered and all funds are withdrawn.
	///
	/// If handling fails, the watcher returns the respective error. It is
	/// the user's job to restart the watcher after the cause of the error
	/// got fixed. The subscription is also closed when the channel closes;
	/// an orderly close without an event returns success.
	pub async fn watch(self: Arc<Self>) -> Result<()> {
		let ctx = self.closer.ctx();
		let mut sub = self
			.adjudicator
			.subscribe_registered(&ctx, self.params())
			.await?;
		let close_sub = sub.close_handle();
		self.closer.on_close_always(Box::new(move || close_sub.close()));

		// Wait for on-chain event.
		let reg = sub.next().await;
		debug!("[{}] watcher received event: {:?}", self.id(), reg);
		let reg = match reg {
			Some(reg) => reg,
			// err is none if the subscription got orderly closed.
			None => {
				return match sub.err() {
					Some(err) => Err(err),
					None => Ok(()),
				}
			}
		};

		let res = self.handle_registered(&ctx, reg).await;
		debug!("[{}] watcher returned", self.id());
		res
	}

	/// Stores the observed registration in the machine and settles the
	/// channel.
	async fn handle_registered(&self, ctx: &Ctx, reg: RegisteredEvent) -> Result<()> {
		// Lock machine while registering is in progress.
		let mut m = self.machine.try_lock_ctx(ctx).await?;

		if m.phase() == Phase::Withdrawn {
			// A Settle call by the user caused this event and the channel is
			// already withdrawn.
			debug!("[{}] channel already withdrawn", self.id());
			return Ok(());
		}

		m.set_registered(reg)?;
		self.settle_locked(ctx, &mut m).await
	}

	/// Settles the channel: makes sure that the current state is registered
	/// and the final balance withdrawn. This call blocks until the channel
	/// has been successfully withdrawn; it is cancelled early when the
	/// channel controller closes.
	pub async fn settle(&self, ctx: &Ctx) -> Result<()> {
		let mut m = self.machine.try_lock_ctx(ctx).await?;
		let ctx = ctx.merged(&self.closer.ctx());
		self.settle_locked(&ctx, &mut m).await
	}

	/// The settlement pipeline: register if needed, wait out the challenge
	/// timeout, withdraw. The caller holds the machine lock, so only one
	/// settlement attempt exists at a time per channel.
	async fn settle_locked(&self, ctx: &Ctx, m: &mut Machine) -> Result<()> {
		let ver = m.state().version;
		let registered = m.registered();
		if m.phase() < Phase::Registered || registered.map_or(true, |reg| reg.version < ver) {
			if let Some(reg) = registered {
				if reg.version < ver {
					warn!(
						"[{}] lower version {} (< {}) registered, refuting...",
						self.id(),
						reg.version,
						ver
					);
				}
			}
			self.register_locked(ctx, m).await?;
			info!("[{}] channel state registered", self.id());
		}

		let reg = match m.registered() {
			Some(reg) => reg.clone(),
			None => return Err(Error::InvalidInput),
		};
		if !reg.timeout.is_elapsed() {
			if m.state().is_final {
				warn!(
					"[{}] unexpected withdrawal timeout while settling final state, waiting",
					self.id()
				);
			} else {
				info!("[{}] waiting for withdrawal timeout", self.id());
			}
			reg.timeout.wait(ctx).await?;
		}

		self.withdraw_locked(ctx, m).await?;
		info!("[{}] withdrawal successful", self.id());
		self.wallet.decrement_usage(m.account().public());
		Ok(())
	}

	/// Registers the current channel state with the adjudicator and stores
	/// the acknowledged event. The acknowledged version must match the
	/// current state's version.
	async fn register_locked(&self, ctx: &Ctx, m: &mut Machine) -> Result<()> {
		m.set_registering()?;

		let reg = self.adjudicator.register(ctx, m.adjudicator_req()).await?;
		let ver = m.state().version;
		if reg.version != ver {
			return Err(Error::UnexpectedVersion {
				expected: ver,
				got: reg.version,
			});
		}

		m.set_registered(reg)
	}

	/// Withdraws the own funds from the settled channel.
	async fn withdraw_locked(&self, ctx: &Ctx, m: &mut Machine) -> Result<()> {
		m.set_withdrawing()?;
		self.adjudicator.withdraw(ctx, m.adjudicator_req()).await?;
		m.set_withdrawn()
	}
}
