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
use crate::types::{AppId, Params, State};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Decides which state transitions are valid for a channel's app payload.
/// Apps are pure: they read states and never perform I/O.
pub trait App: Send + Sync {
	/// Checks an initial channel state before funding.
	fn valid_init(&self, params: &Params, state: &State) -> Result<()>;

	/// Checks a single proposed state transition, proposed by the
	/// participant with the given index.
	fn valid_transition(
		&self,
		params: &Params,
		from: &State,
		to: &State,
		actor: usize,
	) -> Result<()>;
}

/// An app that accepts any initial state and any transition. It exists to
/// exercise the channel machinery.
pub struct MockApp;

impl App for MockApp {
	fn valid_init(&self, _params: &Params, _state: &State) -> Result<()> {
		Ok(())
	}

	fn valid_transition(
		&self,
		_params: &Params,
		_from: &State,
		_to: &State,
		_actor: usize,
	) -> Result<()> {
		Ok(())
	}
}

#[derive(Clone, Default)]
/// Binds app identifiers to their implementations. Populated at program
/// start and threaded through channel construction; lookups happen by the
/// params' app identifier.
pub struct AppRegistry {
	apps: Arc<Mutex<HashMap<AppId, Arc<dyn App>>>>,
}

impl AppRegistry {
	pub fn new() -> Self {
		Default::default()
	}

	/// Binds an app to an identifier, replacing any previous binding.
	pub fn register(&self, id: AppId, app: Arc<dyn App>) {
		self.apps.lock().unwrap().insert(id, app);
	}

	/// Returns the app bound to the given identifier.
	pub fn resolve(&self, id: &AppId) -> Result<Arc<dyn App>> {
		self.apps
			.lock()
			.unwrap()
			.get(id)
			.cloned()
			.ok_or(Error::UnknownApp(id.clone()))
	}
}
