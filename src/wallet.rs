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

use crate::types::{L2Account, L2Signature, State};
use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey};
use log::warn;
use std::collections::HashMap;
use std::sync::Mutex;

/// A layer-2 signing identity: an ed25519 key pair that signs canonical
/// channel state encodings.
pub struct Account {
	sk: ExpandedSecretKey,
	pk: L2Account,
}

impl Account {
	pub fn new(sk: SecretKey) -> Self {
		let pk = L2Account(PublicKey::from(&sk));
		Self {
			sk: ExpandedSecretKey::from(&sk),
			pk,
		}
	}

	/// The account's layer-2 identity.
	pub fn public(&self) -> &L2Account {
		&self.pk
	}

	/// Signs a raw message.
	pub fn sign(&self, msg: &[u8]) -> L2Signature {
		L2Signature(self.sk.sign(msg, &self.pk.0))
	}

	/// Signs the canonical encoding of a channel state.
	pub fn sign_state(&self, state: &State) -> L2Signature {
		self.sign(&state.sig_msg())
	}
}

#[derive(Default)]
/// Tracks how many channels currently use each account. A channel increments
/// its account's usage at construction; the settlement pipeline decrements it
/// exactly once per successful withdrawal.
pub struct Wallet {
	usage: Mutex<HashMap<L2Account, usize>>,
}

impl Wallet {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn increment_usage(&self, acc: &L2Account) {
		*self.usage.lock().unwrap().entry(acc.clone()).or_insert(0) += 1;
	}

	pub fn decrement_usage(&self, acc: &L2Account) {
		let mut usage = self.usage.lock().unwrap();
		match usage.get_mut(acc) {
			Some(count) if *count > 0 => *count -= 1,
			_ => warn!("decrementing usage of unused account"),
		}
	}

	pub fn usage(&self, acc: &L2Account) -> usize {
		*self.usage.lock().unwrap().get(acc).unwrap_or(&0)
	}
}
