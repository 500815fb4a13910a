pub mod fingerprint;
pub mod gate;
pub mod identity;
pub mod oauth;
pub mod trust;
pub mod verifier;

pub use fingerprint::{ClientOrigin, Fingerprint};
pub use gate::{
    Direction, FastAuthConfig, FastAuthDecision, FastAuthGate, RedirectReason, TtlPolicy,
    TtlRule, WriteBackError,
};
pub use identity::{ProviderUser, UserIdentity};
pub use oauth::{AccessGrant, IdentityProvider, OAuthClient, ProviderConfig, ProviderError};
pub use trust::{DecrementOutcome, TrustConfig, TrustStore};
pub use verifier::{Corroboration, TrustVerifier, Verdict, VerificationScheduler, VerifierConfig};
