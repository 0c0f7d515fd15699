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
use futures::future::{pending, select_all};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, MutexGuard};

#[derive(Clone, Default)]
/// A cancellation context. Contexts form a chain: a child created with
/// [`Ctx::with_cancel`] is cancelled when either its own canceller fires or
/// any ancestor is cancelled. The default context is never cancelled.
pub struct Ctx {
	watchers: Vec<watch::Receiver<bool>>,
}

/// Cancels the context it was created with.
pub struct Canceller {
	tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
	pub fn cancel(&self) {
		let _ = self.tx.send(true);
	}
}

impl Ctx {
	/// A context that is never cancelled.
	pub fn background() -> Self {
		Default::default()
	}

	/// Derives a child context together with its canceller.
	pub fn with_cancel(&self) -> (Ctx, Canceller) {
		let (tx, rx) = watch::channel(false);
		let mut child = self.clone();
		child.watchers.push(rx);
		(child, Canceller { tx: Arc::new(tx) })
	}

	/// Derives a child context that cancels itself after the given wall-clock
	/// duration.
	pub fn with_timeout(&self, dur: std::time::Duration) -> Ctx {
		let (ctx, canceller) = self.with_cancel();
		tokio::spawn(async move {
			tokio::time::sleep(dur).await;
			canceller.cancel();
		});
		ctx
	}

	/// A context that is cancelled as soon as either input context is.
	pub fn merged(&self, other: &Ctx) -> Ctx {
		let mut merged = self.clone();
		merged.watchers.extend(other.watchers.iter().cloned());
		merged
	}

	pub fn is_cancelled(&self) -> bool {
		self.watchers.iter().any(|rx| *rx.borrow())
	}

	/// Resolves once the context is cancelled; never resolves for contexts
	/// without cancellers.
	pub async fn cancelled(&self) {
		if self.watchers.is_empty() {
			return pending().await;
		}
		let waits = self
			.watchers
			.iter()
			.map(|rx| {
				let mut rx = rx.clone();
				Box::pin(async move {
					loop {
						if *rx.borrow() {
							return;
						}
						if rx.changed().await.is_err() {
							// Canceller dropped; this link can never fire.
							pending::<()>().await;
						}
					}
				})
			})
			.collect::<Vec<_>>();
		select_all(waits).await;
	}

	/// The context's cancellation cause, if any.
	pub fn err(&self) -> Option<Error> {
		if self.is_cancelled() {
			Some(Error::Cancelled)
		} else {
			None
		}
	}
}

/// An async mutex whose acquisition is cancellable through a [`Ctx`]. All
/// per-channel operations serialize through it.
pub struct CtxMutex<T> {
	inner: tokio::sync::Mutex<T>,
}

impl<T> CtxMutex<T> {
	pub fn new(value: T) -> Self {
		Self {
			inner: tokio::sync::Mutex::new(value),
		}
	}

	/// Acquires the lock unconditionally.
	pub async fn lock(&self) -> MutexGuard<'_, T> {
		self.inner.lock().await
	}

	/// Acquires the lock, giving up with [`Error::LockTimeout`] when the
	/// context fires first.
	pub async fn try_lock_ctx(&self, ctx: &Ctx) -> Result<MutexGuard<'_, T>> {
		if ctx.is_cancelled() {
			return Err(Error::LockTimeout);
		}
		tokio::select! {
			guard = self.inner.lock() => Ok(guard),
			_ = ctx.cancelled() => Err(Error::LockTimeout),
		}
	}
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runs registered hooks exactly once at close and cancels the associated
/// context. Closing twice is a no-op.
pub struct Closer {
	hooks: Mutex<Option<Vec<Hook>>>,
	canceller: Canceller,
	ctx: Ctx,
}

impl Default for Closer {
	fn default() -> Self {
		Self::new()
	}
}

impl Closer {
	pub fn new() -> Self {
		let (ctx, canceller) = Ctx::background().with_cancel();
		Self {
			hooks: Mutex::new(Some(Vec::new())),
			canceller,
			ctx,
		}
	}

	/// A context that is cancelled when this closer closes.
	pub fn ctx(&self) -> Ctx {
		self.ctx.clone()
	}

	pub fn is_closed(&self) -> bool {
		self.hooks.lock().unwrap().is_none()
	}

	/// Registers a hook to run at close. Returns false and drops the hook
	/// when already closed.
	pub fn on_close(&self, hook: Hook) -> bool {
		match self.hooks.lock().unwrap().as_mut() {
			Some(hooks) => {
				hooks.push(hook);
				true
			}
			None => false,
		}
	}

	/// Registers a hook to run at close, running it immediately when already
	/// closed.
	pub fn on_close_always(&self, hook: Hook) {
		let mut guard = self.hooks.lock().unwrap();
		match guard.as_mut() {
			Some(hooks) => hooks.push(hook),
			None => {
				drop(guard);
				hook();
			}
		}
	}

	/// Closes, cancelling the context and running all hooks in registration
	/// order. Returns [`Error::Closed`] when already closed.
	pub fn close(&self) -> Result<()> {
		let hooks = self.hooks.lock().unwrap().take();
		match hooks {
			Some(hooks) => {
				self.canceller.cancel();
				for hook in hooks {
					hook();
				}
				Ok(())
			}
			None => Err(Error::Closed),
		}
	}
}
