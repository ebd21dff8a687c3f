//! Single-flight token refresh.
//!
//! Both the explicit "stay logged in" action and background requests that
//! hit a 401 want a fresh access token, and they may do so at the same time.
//! A [`Refresher`] makes sure at most one refresh call is outstanding: callers
//! that arrive while one is pending are joined to it and receive the same
//! outcome.
//!
//! The refresher reports failure as `None` and never ends the session itself;
//! the caller decides whether a failed renewal means logging out.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};

use crate::{
    auth::Authenticator,
    credentials::{save_tokens, CredentialStore, REFRESH_TOKEN},
    token::AccessToken,
};

type PendingRefresh = Shared<BoxFuture<'static, Option<AccessToken>>>;

/// Object-safe view of a refresher, so that the coordinator and the fetch
/// client do not have to be generic over the authenticator.
pub trait Renew: Send + Sync {
    fn renew(&self) -> BoxFuture<'_, Option<AccessToken>>;

    fn store(&self) -> &Arc<dyn CredentialStore>;
}

pub struct Refresher<A> {
    api: Arc<A>,
    store: Arc<dyn CredentialStore>,
    in_flight: Mutex<Option<PendingRefresh>>,
}

impl<A: Authenticator> Refresher<A> {
    #[must_use]
    pub fn new(api: Arc<A>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            api,
            store,
            in_flight: Mutex::new(None),
        }
    }

    /// Whether a refresh call is currently outstanding.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Obtains a new access token, joining a refresh that is already in
    /// flight.
    ///
    /// Returns `None` when no refresh token is stored (without a network
    /// call), when the refresh fails for any reason, or when the stored
    /// refresh token changed while the call was out. Failures are never
    /// retried.
    pub async fn renew(&self) -> Option<AccessToken> {
        let pending = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(pending) = in_flight.as_ref() {
                trace!("joining token refresh in flight");
                pending.clone()
            } else {
                let Some(refresh_token) = self.store.get(REFRESH_TOKEN) else {
                    warn!("cannot renew session: no refresh token stored");
                    return None;
                };

                let api = Arc::clone(&self.api);
                let store = Arc::clone(&self.store);
                let pending = Self::refresh(api, store, refresh_token).boxed().shared();
                *in_flight = Some(pending.clone());
                pending
            }
        };

        let result = pending.clone().await;

        // The first caller to finish clears the slot, unless a newer refresh
        // has taken it already.
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&pending))
        {
            *in_flight = None;
        }

        result
    }

    async fn refresh(
        api: Arc<A>,
        store: Arc<dyn CredentialStore>,
        refresh_token: String,
    ) -> Option<AccessToken> {
        debug!("refreshing access token");

        let tokens = match api.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("token refresh failed: {e}");
                return None;
            }
        };

        // A sign-in or logout while the call was out replaced the refresh
        // token this renewal was based on. Its tokens must not overwrite
        // the newer ones.
        if store.get(REFRESH_TOKEN).as_deref() != Some(refresh_token.as_str()) {
            warn!("credentials changed during token refresh, discarding renewal");
            return None;
        }

        // A token that cannot be stored still works for this process.
        if let Err(e) = save_tokens(store.as_ref(), &tokens) {
            error!("failed storing renewed tokens: {e}");
        }

        let token = AccessToken::parse(tokens.access_token);
        match token.time_to_live() {
            Some(ttl) => info!("access token renewed, valid for {}s", ttl.as_secs()),
            None => info!("access token renewed"),
        }

        Some(token)
    }
}

impl<A: Authenticator> Renew for Refresher<A> {
    fn renew(&self) -> BoxFuture<'_, Option<AccessToken>> {
        Refresher::renew(self).boxed()
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}
