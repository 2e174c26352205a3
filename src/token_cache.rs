// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::constants::DEFAULT_EAGER_REFRESH_WINDOW;
use crate::errors::{CredentialsError, ErrorKind};
use crate::token::{Token, TokenProvider};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
// Using tokio's wrapper makes the cache testable without relying on clock
// times.
use tokio::time::Instant;

/// Per-credential refresh behavior, attached by the builders.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RefreshOptions {
    /// A cached token within this window of its expiration is refreshed
    /// instead of served.
    pub(crate) eager_refresh_window: Duration,
    /// Serve a stale token, with a warning, when a refresh fails.
    pub(crate) force_refresh_on_failure: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            eager_refresh_window: DEFAULT_EAGER_REFRESH_WINDOW,
            force_refresh_on_failure: false,
        }
    }
}

#[derive(Debug)]
struct State {
    // The last published token, or the last seen error.
    current: Result<Token>,
    // Incremented every time a refresh publishes a result, success or not.
    // Waiters use it to tell a completed refresh from a cancelled one.
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct TokenCache<T>
where
    T: TokenProvider,
{
    state: Arc<Mutex<State>>,

    // Held for the duration of a refresh. If the lock is taken, a refresh
    // is in flight.
    refresh_in_progress: Arc<Mutex<()>>,
    // Wakes waiters when a refresh publishes, or when it is abandoned.
    refresh_notify: Arc<Notify>,

    options: RefreshOptions,

    // The token provider. This thing does the refreshing.
    inner: Arc<T>,
}

// We manually implement `Clone` because the derived implementation would
// require `T: Clone`, even though we only hold an `Arc<T>`.
impl<T: TokenProvider> Clone for TokenCache<T> {
    fn clone(&self) -> TokenCache<T> {
        TokenCache {
            state: self.state.clone(),
            refresh_in_progress: self.refresh_in_progress.clone(),
            refresh_notify: self.refresh_notify.clone(),
            options: self.options,
            inner: self.inner.clone(),
        }
    }
}

// Wakes all waiters when dropped. A refresh that is cancelled mid-flight
// must not leave waiters sleeping; one of them takes over the refresh.
struct NotifyOnDrop(Arc<Notify>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify_waiters();
    }
}

impl<T: TokenProvider> TokenCache<T> {
    pub(crate) fn new(inner: T) -> TokenCache<T> {
        Self::with_options(inner, RefreshOptions::default())
    }

    pub(crate) fn with_options(inner: T, options: RefreshOptions) -> TokenCache<T> {
        TokenCache {
            state: Arc::new(Mutex::new(State {
                current: Err(CredentialsError::from_str(
                    true,
                    ErrorKind::Other,
                    "no token fetched yet",
                )),
                generation: 0,
            })),
            refresh_in_progress: Arc::new(Mutex::new(())),
            refresh_notify: Arc::new(Notify::new()),
            options,
            inner: Arc::new(inner),
        }
    }

    // A token is served from the cache only while it has longer than the
    // eager refresh window left before expiration.
    fn usable(&self, token: &Token) -> bool {
        token
            .expires_at
            .is_none_or(|e| Instant::now() + self.options.eager_refresh_window < e)
    }

    async fn run_refresh(&self) -> Result<Token> {
        let result = self.inner.token().await;
        let mut state = self.state.lock().await;
        state.generation += 1;
        match result {
            Ok(token) => {
                state.current = Ok(token.clone());
                Ok(token)
            }
            Err(e) => {
                if self.options.force_refresh_on_failure {
                    if let Ok(stale) = &state.current {
                        tracing::warn!(
                            error = %e,
                            "token refresh failed, serving stale token"
                        );
                        return Ok(stale.clone());
                    }
                }
                let shared = e.duplicate();
                state.current = Err(e);
                Err(shared)
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: TokenProvider + 'static> TokenProvider for TokenCache<T> {
    async fn token(&self) -> Result<Token> {
        loop {
            let generation = {
                let state = self.state.lock().await;
                if let Ok(token) = &state.current {
                    if self.usable(token) {
                        return Ok(token.clone());
                    }
                }
                state.generation
            };

            match self.refresh_in_progress.try_lock() {
                Ok(_refresh_guard) => {
                    // A refresh may have published between the staleness
                    // check and acquiring the lock; its result is shared.
                    {
                        let state = self.state.lock().await;
                        if state.generation != generation {
                            return match &state.current {
                                Ok(token) => Ok(token.clone()),
                                Err(e) => Err(e.duplicate()),
                            };
                        }
                    }
                    // No refresh in flight. This caller performs it. The
                    // guard wakes waiters even if this future is dropped.
                    let _notify_guard = NotifyOnDrop(self.refresh_notify.clone());
                    return self.run_refresh().await;
                }
                Err(_) => {
                    // A refresh is in flight. Wait for it to publish, then
                    // hand out whatever it produced.
                    let notified = self.refresh_notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let state = self.state.lock().await;
                        if state.generation != generation {
                            return match &state.current {
                                Ok(token) => Ok(token.clone()),
                                Err(e) => Err(e.duplicate()),
                            };
                        }
                    }
                    notified.await;
                    let state = self.state.lock().await;
                    if state.generation != generation {
                        return match &state.current {
                            Ok(token) => Ok(token.clone()),
                            Err(e) => Err(e.duplicate()),
                        };
                    }
                    // The refresh was abandoned before publishing. Start
                    // over; this caller may become the refresher.
                }
            }
        }
    }
}
