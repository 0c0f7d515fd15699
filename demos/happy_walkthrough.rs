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

use log::{error, info};
use perun_client::error::Result;
use perun_client::machine::Phase;
use perun_client::sync::Ctx;
use perun_client::test::{self, Setup};
use perun_client::types::{Amount, State};
use perun_client::update::direct_conns;
use std::sync::Arc;

/// Entry point for this example.
#[tokio::main]
async fn main() {
	pretty_env_logger::init();

	if let Err(err) = walkthrough().await {
		error!("{}", err);
	}
}

/// The next state paying `amount` of the first asset between participants.
fn pay(cur: &State, from: usize, to: usize, amount: Amount) -> State {
	let mut next = cur.clone();
	next.version += 1;
	next.allocation.balances[0][from] -= amount;
	next.allocation.balances[0][to] += amount;
	next
}

/// Walkthrough through the collaborative Perun protocol: open a channel over
/// the simulated ledger, exchange a few payments, finalize, and settle
/// without ever starting a dispute.
async fn walkthrough() -> Result<()> {
	let mut rng = test::prng("happy_walkthrough");
	let mut setup = Setup::new(&mut rng, false, false);
	setup.state.allocation.balances = vec![vec![100, 100]];
	let setup = Arc::new(setup);
	let (alice, bob) = (0, 1);
	let id = setup.params.id();

	let mut conns = direct_conns(2);
	let cb = setup.channel(bob, conns.pop().expect("two connections"))?;
	let ca = setup.channel(alice, conns.pop().expect("two connections"))?;
	let ctx = Ctx::background();

	// Open and fund the channel.
	info!("Opening          channel: {}", id);
	let (ra, rb) = tokio::join!(ca.open(&ctx), cb.open(&ctx));
	ra?;
	rb?;

	for (name, ch) in [("Alice", &ca), ("Bob", &cb)] {
		info!("Depositing       channel: {} for {}", id, name);
		ch.deposit(&ctx).await?;
	}
	ca.set_funded().await?;
	cb.set_funded().await?;
	ca.spawn_watcher();
	cb.spawn_watcher();

	// Alice pays Bob three times, Bob pays Alice once.
	for _ in 0..3 {
		let next = pay(&ca.state().await, alice, bob, 10);
		let (ra, rb) = tokio::join!(ca.update(&ctx, next), cb.handle_next(&ctx));
		ra?;
		rb?;
	}
	let next = pay(&cb.state().await, bob, alice, 5);
	let (rb, ra) = tokio::join!(cb.update(&ctx, next), ca.handle_next(&ctx));
	rb?;
	ra?;
	info!(
		"Off-chain balances now: {:?}",
		ca.state().await.allocation.balances[0]
	);

	// Finalize the channel collaboratively.
	let mut fin = ca.state().await;
	fin.version += 1;
	fin.is_final = true;
	let (ra, rb) = tokio::join!(ca.update(&ctx, fin), cb.handle_next(&ctx));
	ra?;
	rb?;
	info!("Finalized        channel: {}", id);

	// Settle: concludes on the ledger and withdraws both balances.
	let (ra, rb) = tokio::join!(ca.settle(&ctx), cb.settle(&ctx));
	ra?;
	rb?;
	info!(
		"Settled          channel: {}, Alice phase: {:?}, Bob phase: {:?}",
		id,
		ca.phase().await,
		cb.phase().await
	);
	assert_eq!(ca.phase().await, Phase::Withdrawn);
	assert_eq!(cb.phase().await, Phase::Withdrawn);

	let registered = setup.ledger.state(&id).expect("concluded channel state");
	info!(
		"Final ledger outcome: {:?}, concluded: {}",
		registered.state.allocation.balances[0], registered.concluded
	);

	ca.close().await?;
	cb.close().await?;
	Ok(())
}
