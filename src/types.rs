//  Copyright 2021 PolyCrypt GmbH
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

use crate::{
	error::{Error, Result},
	require,
};
use core::convert::TryFrom;
use digest::{FixedOutputDirty, Update};
use ed25519_dalek::{PublicKey, Sha512 as Hasher, Signature};
use serde::de::{Deserializer, Error as _};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

// Type definitions start here.

#[derive(PartialEq, Debug, Eq, PartialOrd, Ord, Default, Clone)]
/// A hash as used by the signature scheme.
pub struct Hash(pub digest::Output<Hasher>);

#[derive(PartialEq, Debug, Default, Clone, Eq)]
/// A layer-2 account identifier.
pub struct L2Account(pub PublicKey);

#[derive(PartialEq, Clone, Eq, Debug)]
/// A layer-2 signature for signing Perun protocol messages.
pub struct L2Signature(pub Signature);

/// An amount of a currency.
pub type Amount = u128;
/// Duration in ledger-time units.
pub type Duration = u64;
/// Timestamp in ledger-time units.
pub type Timestamp = u64;
/// Channel state version identifier.
pub type Version = u64;

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Debug)]
/// Unique Perun channel identifier.
pub struct ChannelId(pub [u8; 32]);

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Debug)]
/// A channel's unique nonce.
pub struct Nonce(pub [u8; 32]);

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Debug)]
/// Identifies the app governing a channel's state transitions.
pub struct AppId(pub [u8; 32]);

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Debug, Clone, Copy, Default)]
/// A layer-1 contract address.
pub struct Address(pub [u8; 20]);

/// An asset is identified by its holder contract's address.
pub type Asset = Address;

#[derive(Deserialize, Serialize, Clone)]
/// The immutable parameters of a Perun channel.
pub struct Params {
	/// The channel's unique nonce, to protect against replay attacks.
	pub nonce: Nonce,
	/// The channel's participants' layer-2 identities.
	pub participants: Vec<L2Account>,
	/// When a dispute occurs, how long to wait for responses.
	pub challenge_duration: Duration,
	/// The app governing valid state transitions.
	pub app: AppId,
}

#[derive(Deserialize, Serialize, Default, Clone, PartialEq, Eq, Debug)]
/// A channel's asset allocation. Balances are indexed by asset first, then by
/// participant in the order of the channel parameters' participant list.
pub struct Allocation {
	/// The channel's assets.
	pub assets: Vec<Asset>,
	/// Per asset, each participant's current balance.
	pub balances: Vec<Vec<Amount>>,
}

#[derive(Deserialize, Serialize, Default, Clone, PartialEq, Eq, Debug)]
/// The mutable, versioned state of a Perun channel.
pub struct State {
	/// The channel's unique identifier, equal to the owning params' id.
	pub channel: ChannelId,
	/// The channel's current state revision number.
	pub version: Version,
	/// The channel's asset allocation.
	pub allocation: Allocation,
	/// Opaque app-specific payload, validated by the channel's app.
	#[serde(with = "serde_bytes")]
	pub app_data: Vec<u8>,
	/// Whether the channel is finalized, i.e., no more updates can be made
	/// and funds can be withdrawn without waiting for a challenge timeout.
	pub is_final: bool,
}

#[derive(Deserialize, Serialize, Default, Clone, PartialEq, Eq, Debug)]
/// A channel state together with one signature slot per participant, in the
/// order of the parameters' participant list. Slots that have not been filled
/// yet are explicit `None`s; the adjudicator verifies by index.
pub struct Transaction {
	/// The channel's state.
	pub state: State,
	/// The participants' signatures on the channel state.
	pub sigs: Vec<Option<L2Signature>>,
}

#[derive(PartialEq, Clone, Default, Deserialize, Serialize, Eq, Hash)]
/// Identifies the funds belonging to a certain layer-2 identity within a
/// certain channel.
pub struct Funding {
	/// The channel's unique identifier.
	pub channel: ChannelId,
	/// The funds' owner's layer-2 identity within the channel.
	pub participant: L2Account,
}

// Hash

impl Hash {
	pub fn digest(msg: &[u8]) -> Self {
		let mut h = Hasher::default();
		h.update(msg);
		let mut out: Hash = Hash::default();
		h.finalize_into_dirty(&mut out.0);
		out
	}
}

impl std::fmt::Display for Hash {
	/// Formats the first 4 byte of a hash as lower case hex with 0x prefix.
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let data = &self.0[..4];
		write!(f, "0x{}…", hex::encode(data))
	}
}

impl std::hash::Hash for Hash {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.0.as_slice().hash(state);
	}
}

// 32-byte identifiers

macro_rules! impl_id32 {
	($name:ident, $expect:expr) => {
		impl Default for $name {
			fn default() -> Self {
				$name([0; 32])
			}
		}

		impl Clone for $name {
			fn clone(&self) -> Self {
				$name(self.0.clone())
			}
		}

		impl Serialize for $name {
			fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
			where
				S: Serializer,
			{
				serializer.serialize_bytes(&self.0)
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
			where
				D: Deserializer<'de>,
			{
				let bytes = ByteBuf::deserialize(deserializer)?;
				require!(
					bytes.len() == 32,
					D::Error::invalid_length(bytes.len(), &$expect)
				);
				let mut arr = [0u8; 32];
				arr.copy_from_slice(&bytes[..32]);
				Ok($name(arr))
			}
		}

		impl std::fmt::Display for $name {
			/// Formats the first 4 byte as lower case hex with 0x prefix.
			fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				write!(f, "0x{}…", hex::encode(&self.0[..4]))
			}
		}
	};
}

impl_id32!(ChannelId, "32-byte ChannelId");
impl_id32!(Nonce, "32-byte Nonce");
impl_id32!(AppId, "32-byte AppId");

/// Truncates a hash to a 32-byte channel identifier.
pub fn hash_to_channel_id(hash: &Hash) -> ChannelId {
	let mut arr = [0u8; 32];
	arr.copy_from_slice(&hash.0[..32]);
	ChannelId(arr)
}

// Address

impl Serialize for Address {
	fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_bytes(&self.0)
	}
}

impl<'de> Deserialize<'de> for Address {
	fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let bytes = ByteBuf::deserialize(deserializer)?;
		require!(
			bytes.len() == 20,
			D::Error::invalid_length(bytes.len(), &"20-byte Address")
		);
		let mut arr = [0u8; 20];
		arr.copy_from_slice(&bytes[..20]);
		Ok(Address(arr))
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "0x{}", hex::encode(&self.0))
	}
}

// L2Account

impl Serialize for L2Account {
	fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_bytes(&self.0.to_bytes())
	}
}

impl<'de> Deserialize<'de> for L2Account {
	fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let bytes = ByteBuf::deserialize(deserializer)?;
		let pk = PublicKey::from_bytes(bytes.as_slice())
			.ok()
			.ok_or(D::Error::invalid_length(bytes.len(), &"public key"))?;
		Ok(L2Account(pk))
	}
}

impl std::hash::Hash for L2Account {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.0.to_bytes().hash(state);
	}
}

// L2Signature

impl Serialize for L2Signature {
	fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_bytes(&self.0.to_bytes())
	}
}

impl<'de> Deserialize<'de> for L2Signature {
	fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let bytes = ByteBuf::deserialize(deserializer)?;
		let sig = Signature::try_from(bytes.as_slice())
			.map_err(|_| D::Error::invalid_length(bytes.len(), &"signature"))?;
		Ok(L2Signature(sig))
	}
}

// Params

impl Params {
	/// The channel's unique identifier, a pure function of the parameters.
	/// Two params with equal ids are structurally equal.
	pub fn id(&self) -> ChannelId {
		let mut params_bytes = Vec::new();
		params_bytes.extend_from_slice(&self.nonce.0);

		params_bytes.extend_from_slice(&(self.participants.len() as u32).to_le_bytes());
		for participant in &self.participants {
			params_bytes.extend_from_slice(&participant.0.to_bytes());
		}

		params_bytes.extend_from_slice(&self.challenge_duration.to_le_bytes());
		params_bytes.extend_from_slice(&self.app.0);

		hash_to_channel_id(&Hash::digest(&params_bytes))
	}
}

// Allocation

impl Allocation {
	/// Whether the allocation has one balance row per asset and one entry per
	/// participant in each row.
	pub fn valid_shape(&self, participants: usize) -> bool {
		self.balances.len() == self.assets.len()
			&& self.balances.iter().all(|row| row.len() == participants)
	}

	/// The per-asset sums over all participants.
	pub fn totals(&self) -> Vec<Amount> {
		self.balances
			.iter()
			.map(|row| row.iter().sum())
			.collect()
	}

	/// One participant's balances across all assets.
	pub fn column(&self, part: usize) -> Vec<Amount> {
		self.balances.iter().map(|row| row[part]).collect()
	}
}

// State

impl State {
	/// The canonical byte encoding of the state that gets signed by all
	/// participants. The channel identifier binds the state to its params.
	/// Deterministic: equal states produce byte-identical encodings.
	pub fn sig_msg(&self) -> Vec<u8> {
		let mut msg_enc = Vec::new();

		msg_enc.extend_from_slice(&self.channel.0);
		msg_enc.extend_from_slice(&self.version.to_le_bytes());

		msg_enc.extend_from_slice(&(self.allocation.assets.len() as u32).to_le_bytes());
		for (asset, row) in self
			.allocation
			.assets
			.iter()
			.zip(self.allocation.balances.iter())
		{
			msg_enc.extend_from_slice(&asset.0);
			for amount in row {
				msg_enc.extend_from_slice(&amount.to_le_bytes());
			}
		}

		msg_enc.extend_from_slice(&[self.is_final as u8]);
		msg_enc.extend_from_slice(&(self.app_data.len() as u32).to_le_bytes());
		msg_enc.extend_from_slice(&self.app_data);

		msg_enc
	}

	/// Verifies a participant's signature on this state.
	pub fn validate_sig(&self, sig: &L2Signature, pk: &L2Account) -> Result<()> {
		pk.0.verify_strict(&self.sig_msg(), &sig.0)
			.ok()
			.ok_or(Error::Authentication)
	}

	/// Calculates the total funds per asset in a channel's state.
	pub fn total(&self) -> Vec<Amount> {
		self.allocation.totals()
	}

	/// Channels that are in their initial state may not yet be fully funded,
	/// but may be registered already for disputes. This is to retrieve funds
	/// of channels where the funding phase does not complete.
	pub fn may_be_underfunded(&self) -> bool {
		self.version == 0 && !self.is_final
	}
}

// Transaction

impl Transaction {
	/// Creates a transaction over a state with one empty signature slot per
	/// participant.
	pub fn new(state: State, participants: usize) -> Self {
		Self {
			state,
			sigs: vec![None; participants],
		}
	}

	/// Fills the signature slot of the given participant. The slot must be
	/// empty; the adjudicator verifies by index, so slots are never
	/// reassigned.
	pub fn put_sig(&mut self, part: usize, sig: L2Signature) -> Result<()> {
		require!(part < self.sigs.len(), InvalidInput);
		require!(self.sigs[part].is_none(), Authentication);
		self.sigs[part] = Some(sig);
		Ok(())
	}

	/// Whether every signature slot is filled.
	pub fn is_fully_signed(&self) -> bool {
		self.sigs.iter().all(|s| s.is_some())
	}

	/// Checks that the transaction is fully authenticated and matches the
	/// supplied parameters.
	pub fn validate(&self, params: &Params) -> Result<()> {
		require!(self.state.channel == params.id(), InvalidInput);
		require!(self.sigs.len() == params.participants.len(), InvalidInput);
		require!(
			self.state.allocation.valid_shape(params.participants.len()),
			InvalidInput
		);

		for (i, pk) in params.participants.iter().enumerate() {
			match &self.sigs[i] {
				Some(sig) => self.state.validate_sig(sig, pk)?,
				None => return Err(Error::Authentication),
			}
		}

		Ok(())
	}

	/// Checks that the transaction is valid and its state is final.
	pub fn validate_final(&self, params: &Params) -> Result<()> {
		require!(self.state.is_final, NotFinalized);
		self.validate(params)
	}
}

// Funding

impl Funding {
	pub fn new(channel: ChannelId, participant: L2Account) -> Self {
		Self {
			channel,
			participant,
		}
	}
}
