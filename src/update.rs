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

//! The off-chain update protocol: a two-phase proposal/acknowledge exchange
//! that advances the channel's phase machine. Wire transport is abstracted
//! behind the [`Conn`] capability; [`direct_conns`] provides in-process
//! connections for tests and demos.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::machine::Phase;
use crate::sync::Ctx;
use crate::types::{L2Signature, State, Version};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Clone)]
/// A channel protocol message.
pub enum Msg {
	/// A participant's signature on the initial channel state.
	InitSig { sig: L2Signature },
	/// Proposes the next channel state, signed by the proposer.
	Update { state: State, sig: L2Signature },
	/// Accepts a proposed update with the sender's signature.
	UpdateAcc { version: Version, sig: L2Signature },
	/// Rejects a proposed update.
	UpdateRej { version: Version, reason: String },
}

/// A connection to the channel's peers. Messages from all peers arrive over
/// a single ordered stream, tagged with the sender's participant index.
#[async_trait]
pub trait Conn: Send + Sync {
	/// Sends a message to the participant with the given index.
	async fn send(&self, to: usize, msg: Msg) -> Result<()>;

	/// Receives the next message, suspending until one arrives or the
	/// context fires.
	async fn recv(&self, ctx: &Ctx) -> Result<(usize, Msg)>;
}

/// An in-process connection between channel participants.
pub struct DirectConn {
	idx: usize,
	peers: Vec<mpsc::UnboundedSender<(usize, Msg)>>,
	rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(usize, Msg)>>,
}

/// Creates fully-connected in-process connections for `n` participants.
pub fn direct_conns(n: usize) -> Vec<DirectConn> {
	let mut txs = Vec::with_capacity(n);
	let mut rxs = Vec::with_capacity(n);
	for _ in 0..n {
		let (tx, rx) = mpsc::unbounded_channel();
		txs.push(tx);
		rxs.push(rx);
	}
	rxs.into_iter()
		.enumerate()
		.map(|(idx, rx)| DirectConn {
			idx,
			peers: txs.clone(),
			rx: tokio::sync::Mutex::new(rx),
		})
		.collect()
}

#[async_trait]
impl Conn for DirectConn {
	async fn send(&self, to: usize, msg: Msg) -> Result<()> {
		let peer = self.peers.get(to).ok_or(Error::InvalidInput)?;
		peer.send((self.idx, msg)).map_err(|_| Error::Closed)
	}

	async fn recv(&self, ctx: &Ctx) -> Result<(usize, Msg)> {
		let mut rx = self.rx.lock().await;
		tokio::select! {
			msg = rx.recv() => msg.ok_or(Error::Closed),
			_ = ctx.cancelled() => Err(Error::Cancelled),
		}
	}
}

impl Channel {
	async fn broadcast(&self, msg: Msg) -> Result<()> {
		for to in 0..self.params().participants.len() {
			if to != self.idx() {
				self.conn.send(to, msg.clone()).await?;
			}
		}
		Ok(())
	}

	/// Runs the initial signature exchange. Every participant calls this
	/// concurrently: it signs the initial state, broadcasts the signature,
	/// collects the peers' signatures and enables funding once the initial
	/// state is fully signed.
	pub async fn open(&self, ctx: &Ctx) -> Result<()> {
		let mut m = self.machine.try_lock_ctx(ctx).await?;
		let sig = m.sign_initial()?;
		self.broadcast(Msg::InitSig { sig }).await?;

		while !m.current_fully_signed() {
			let (from, msg) = self.conn.recv(ctx).await?;
			match msg {
				Msg::InitSig { sig } => m.add_sig(from, sig)?,
				_ => return Err(Error::InvalidInput),
			}
		}
		m.enable_init()
	}

	/// Proposes the next channel state to all peers and collects their
	/// signatures. The machine lock is held across the whole exchange. A
	/// peer's rejection discards the staged update and surfaces as
	/// [`Error::UpdateRejected`]; the committed state is unchanged.
	pub async fn update(&self, ctx: &Ctx, next: State) -> Result<()> {
		let mut m = self.machine.try_lock_ctx(ctx).await?;
		m.update(next, self.idx())?;
		let sig = m.sign_staging()?;
		let (version, state) = match m.staging_state() {
			Some(state) => (state.version, state.clone()),
			None => return Err(Error::InvalidInput),
		};
		self.broadcast(Msg::Update { state, sig }).await?;

		while m.phase() == Phase::Signing {
			let (from, msg) = self.conn.recv(ctx).await?;
			match msg {
				Msg::UpdateAcc { version: v, sig } if v == version => m.add_sig(from, sig)?,
				Msg::UpdateRej { version: v, reason } if v == version => {
					m.discard_update()?;
					return Err(Error::UpdateRejected {
						peer: from,
						version: v,
						reason,
					});
				}
				_ => return Err(Error::InvalidInput),
			}
		}
		Ok(())
	}

	/// Receives and processes the next protocol message, replying to the
	/// sender as required. Call this in a loop to act as the responder.
	pub async fn handle_next(&self, ctx: &Ctx) -> Result<()> {
		let (from, msg) = self.conn.recv(ctx).await?;
		match msg {
			Msg::Update { state, sig } => self.handle_update(ctx, from, state, sig).await,
			_ => Err(Error::InvalidInput),
		}
	}

	/// The responder half of the update protocol: stage the proposed state,
	/// verify the proposer's signature, counter-sign and reply. Any failure
	/// is answered with an explicit rejection and leaves the committed state
	/// untouched.
	async fn handle_update(
		&self,
		ctx: &Ctx,
		from: usize,
		state: State,
		sig: L2Signature,
	) -> Result<()> {
		let mut m = self.machine.try_lock_ctx(ctx).await?;
		let version = state.version;

		let staged = m.update(state, from).and_then(|_| m.add_sig(from, sig));
		if let Err(err) = staged {
			if m.phase() == Phase::Signing {
				m.discard_update()?;
			}
			self.conn
				.send(
					from,
					Msg::UpdateRej {
						version,
						reason: err.to_string(),
					},
				)
				.await?;
			return Err(err);
		}

		let own = m.sign_staging()?;
		self.broadcast(Msg::UpdateAcc { version, sig: own }).await?;

		// With more than two parties, the remaining signatures arrive here.
		while m.phase() == Phase::Signing {
			let (peer, msg) = self.conn.recv(ctx).await?;
			match msg {
				Msg::UpdateAcc { version: v, sig } if v == version => m.add_sig(peer, sig)?,
				_ => return Err(Error::InvalidInput),
			}
		}
		Ok(())
	}
}
