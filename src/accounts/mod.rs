//! Account identity, provider description, and login state.
//!
//! Credential storage internals are an external collaborator; this
//! module keeps only what the acquisition engine needs: who the account
//! is, where its provider's loans feed and patron profile live, whether
//! the provider supports authentication at all, and the current login
//! state (which a 401 during sync clears).

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use url::Url;

/// Opaque account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates an account identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authentication style supported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationSupport {
    /// The provider requires no authentication; syncing is a no-op.
    Anonymous,
    /// HTTP basic credentials.
    Basic,
}

/// Static description of an account's provider.
#[derive(Debug, Clone)]
pub struct AccountProvider {
    /// Location of the account's loans feed.
    pub loans_uri: Url,
    /// Location of the patron user profile document.
    pub patron_profile_uri: Url,
    /// Authentication style the provider declares.
    pub authentication: AuthenticationSupport,
}

/// Basic credentials for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Barcode or user name.
    pub user_name: String,
    /// PIN or password.
    pub password: String,
}

/// Login state of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    /// No credentials are held.
    NotLoggedIn,
    /// Credentials are held and presumed valid.
    LoggedIn(Credentials),
}

/// An account known to the controller.
///
/// Login state is interior-mutable: a 401 during sync clears it without
/// replacing the account value shared across operations.
#[derive(Debug)]
pub struct Account {
    /// Account identity.
    pub id: AccountId,
    /// Provider description.
    pub provider: AccountProvider,
    login_state: Mutex<LoginState>,
}

impl Account {
    /// Creates an account in the given login state.
    #[must_use]
    pub fn new(id: AccountId, provider: AccountProvider, login_state: LoginState) -> Self {
        Self {
            id,
            provider,
            login_state: Mutex::new(login_state),
        }
    }

    /// Returns a snapshot of the login state. Poisoned locks are
    /// recovered: login state stays readable after a panic elsewhere.
    #[must_use]
    pub fn login_state(&self) -> LoginState {
        match self.login_state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the held credentials, if logged in.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match self.login_state() {
            LoginState::NotLoggedIn => None,
            LoginState::LoggedIn(credentials) => Some(credentials),
        }
    }

    /// Replaces the login state.
    pub fn set_login_state(&self, state: LoginState) {
        match self.login_state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Clears held credentials; login state becomes not-logged-in.
    pub fn clear_credentials(&self) {
        tracing::info!(account = %self.id, "clearing account credentials");
        self.set_login_state(LoginState::NotLoggedIn);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider(authentication: AuthenticationSupport) -> AccountProvider {
        AccountProvider {
            loans_uri: Url::parse("https://example.com/loans").unwrap(),
            patron_profile_uri: Url::parse("https://example.com/patron").unwrap(),
            authentication,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            user_name: "abcd".to_string(),
            password: "1234".to_string(),
        }
    }

    #[test]
    fn test_account_starts_in_given_state() {
        let account = Account::new(
            AccountId::new("a"),
            provider(AuthenticationSupport::Basic),
            LoginState::LoggedIn(credentials()),
        );
        assert_eq!(account.credentials(), Some(credentials()));
    }

    #[test]
    fn test_clear_credentials_transitions_to_not_logged_in() {
        let account = Account::new(
            AccountId::new("a"),
            provider(AuthenticationSupport::Basic),
            LoginState::LoggedIn(credentials()),
        );
        account.clear_credentials();
        assert_eq!(account.login_state(), LoginState::NotLoggedIn);
        assert_eq!(account.credentials(), None);
    }

    #[test]
    fn test_anonymous_provider_has_no_credentials() {
        let account = Account::new(
            AccountId::new("a"),
            provider(AuthenticationSupport::Anonymous),
            LoginState::NotLoggedIn,
        );
        assert_eq!(account.credentials(), None);
    }
}
